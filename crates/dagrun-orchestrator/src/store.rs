//! Collaborator contracts
//!
//! The orchestrator never owns run history, queues or process liveness. It
//! reads and writes them through these traits; storage engines and the
//! executor process supervisor live behind them.

use crate::definition::WorkflowDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dagrun_core::{RunRef, RunState, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors reported by collaborators
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

pub type StoreResult<T> = std::result::Result<T, CollaboratorError>;

/// One stored attempt of a run: its status plus the definition it ran with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAttempt {
    /// Store-assigned attempt identifier, unique across retries of one run ID
    pub attempt_id: String,
    /// Definition snapshot captured when the attempt was created
    pub definition: WorkflowDefinition,
    pub status: RunStatus,
}

impl RunAttempt {
    pub fn run(&self) -> &RunRef {
        &self.status.run
    }
}

/// Filter for history listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub run_id: Option<String>,
    /// Empty means any state
    #[serde(default)]
    pub states: Vec<RunState>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, status: &RunStatus) -> bool {
        if let Some(name) = &self.workflow_name {
            if &status.run.workflow_name != name {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if &status.run.run_id != run_id {
                return false;
            }
        }
        self.states.is_empty() || self.states.contains(&status.state)
    }
}

#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Latest attempt of a root run
    async fn find_attempt(&self, run: &RunRef) -> StoreResult<RunAttempt>;
    /// Latest attempt of a sub-run stored under `root`
    async fn find_sub_attempt(&self, root: &RunRef, sub_run_id: &str) -> StoreResult<RunAttempt>;
    async fn list_statuses(&self, filter: &RunFilter) -> StoreResult<Vec<RunStatus>>;
    async fn latest_attempt(&self, workflow_name: &str) -> StoreResult<RunAttempt>;
    async fn current_status(&self, run: &RunRef) -> StoreResult<RunStatus>;
    /// Overwrite the latest attempt's status. Sub-run statuses are written
    /// under their `root`.
    async fn update_status(&self, root: &RunRef, status: RunStatus) -> StoreResult<()>;
}

/// An entry waiting in a persisted queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub run: RunRef,
    pub queued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(run: RunRef) -> Self {
        Self {
            run,
            queued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn list_by_workflow(&self, group: &str, workflow_name: &str) -> StoreResult<Vec<QueueItem>>;
    async fn len(&self, queue_name: &str) -> StoreResult<usize>;
    async fn queue_list(&self) -> StoreResult<Vec<String>>;
}

/// Registry of heartbeating executor processes
#[async_trait]
pub trait ProcStore: Send + Sync {
    async fn count_alive_by_workflow(&self, group: &str, workflow_name: &str) -> StoreResult<usize>;
    /// Alive runs keyed by process group
    async fn list_all_alive(&self) -> StoreResult<HashMap<String, Vec<RunRef>>>;
}

/// Options for launching a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub run_id: String,
    pub params: String,
    pub singleton: bool,
}

/// Options for enqueuing a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub run_id: String,
    pub params: String,
    /// Queue override; the definition's process group otherwise
    pub queue: Option<String>,
}

/// Fire-and-forget commands to the out-of-process executor.
///
/// Completion of any command is only ever observed through the run-history
/// store.
#[async_trait]
pub trait ExecutorLauncher: Send + Sync {
    async fn start(&self, definition: &WorkflowDefinition, options: StartOptions) -> StoreResult<()>;
    async fn enqueue(&self, definition: &WorkflowDefinition, options: EnqueueOptions) -> StoreResult<()>;
    async fn retry(
        &self,
        definition: &WorkflowDefinition,
        run_id: &str,
        step_name: Option<&str>,
        step_only: bool,
    ) -> StoreResult<()>;
    async fn stop(&self, definition: &WorkflowDefinition, run_id: &str) -> StoreResult<()>;
    async fn dequeue(&self, definition: &WorkflowDefinition, run_id: &str) -> StoreResult<()>;
}

pub trait RunIdGenerator: Send + Sync {
    fn generate(&self) -> StoreResult<String>;
}

/// Retry task handed to the coordinator for distributed execution
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub definition: WorkflowDefinition,
    pub run_id: String,
    pub previous_status: RunStatus,
    pub step_name: Option<String>,
}

/// Coordinator of remote workers
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn dispatch_retry(&self, task: RetryTask) -> StoreResult<()>;
    async fn request_cancel(&self, run: &RunRef) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMember {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub started_at: DateTime<Utc>,
}

impl ServiceMember {
    pub fn active(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            status: ServiceStatus::Active,
            started_at: Utc::now(),
        }
    }
}

/// Read-only view of distributed service membership
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn get_service_members(&self, service_name: &str) -> StoreResult<Vec<ServiceMember>>;
}
