//! DAG run admission and lifecycle orchestration
//!
//! This crate decides whether a workflow run may start or queue, keeps run
//! identifiers unique, drives runs through an out-of-process executor by
//! polling the run-history store, and gates progress on human approval:
//! - Run ID allocation, validation and uniqueness
//! - Singleton / max-active-runs admission control
//! - Start, enqueue and synchronous-wait observation with adaptive backoff
//! - Retry (same ID or new ID, whole run or single step), dequeue, terminate
//! - Sub-run correlation under a root run
//! - Approve / reject of waiting steps

pub mod admission;
pub mod approval;
pub mod dag;
pub mod definition;
pub mod identity;
pub mod lifecycle;
pub mod memory;
pub mod observer;
pub mod queues;
pub mod store;
pub mod subrun;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionMode, AdmissionPolicy};
pub use approval::{ApprovalGate, ApprovalOutcome, ApproveRequest, RejectOutcome, RejectRequest};
pub use dag::{DagValidationError, WorkflowDag};
pub use definition::{StepDefinition, WaitConfig, WorkflowDefinition};
pub use identity::{validate_run_id, Reservation, RunIdentity, UuidV7Generator};
pub use lifecycle::{
    Collaborators, EnqueueRequest, ExecuteRequest, LifecycleOrchestrator, RetryOutcome,
    RetryRequest, SyncOutcome, COORDINATOR_SERVICE,
};
pub use memory::{InMemoryProcStore, InMemoryQueueStore, InMemoryRunHistory, InMemoryServiceRegistry};
pub use observer::{Confirmation, PollBackoff, RunObserver, WaitOutcome};
pub use queues::{summarize_queues, QueueSummary};
pub use store::{
    CollaboratorError, Coordinator, EnqueueOptions, ExecutorLauncher, ProcStore, QueueItem,
    QueueStore, RetryTask, RunAttempt, RunFilter, RunHistoryStore, RunIdGenerator, ServiceMember,
    ServiceRegistry, ServiceStatus, StartOptions,
};
pub use subrun::{RunTarget, SubRunCorrelator};

use dagrun_core::RunRef;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sub-run {sub_run_id} not found under {root}")]
    SubRunNotFound { root: RunRef, sub_run_id: String },

    #[error("Step {step} not found in {run}")]
    StepNotFound { run: RunRef, step: String },

    #[error("Run already exists: {0}")]
    AlreadyExists(RunRef),

    #[error("Admission rejected: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Run is not running: {0}")]
    NotRunning(RunRef),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid run ID {run_id:?}: {reason}")]
    InvalidRunId { run_id: String, reason: String },

    #[error("Missing required inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error("Run did not start: {0}")]
    StartTimeout(RunRef),

    #[error("Run was not enqueued: {0}")]
    EnqueueTimeout(RunRef),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DagValidationError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Closed set of error kinds the API boundary translates into status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    InvalidState,
    BadRequest,
    Internal,
    Unavailable,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_)
            | OrchestratorError::SubRunNotFound { .. }
            | OrchestratorError::StepNotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::InvalidState(_) | OrchestratorError::NotRunning(_) => {
                ErrorKind::InvalidState
            }
            OrchestratorError::BadRequest(_)
            | OrchestratorError::InvalidRunId { .. }
            | OrchestratorError::MissingInputs(_)
            | OrchestratorError::InvalidDefinition(_) => ErrorKind::BadRequest,
            OrchestratorError::StartTimeout(_) | OrchestratorError::EnqueueTimeout(_) => {
                ErrorKind::Internal
            }
            OrchestratorError::Unavailable(_) => ErrorKind::Unavailable,
            OrchestratorError::Collaborator(err) => match err {
                CollaboratorError::NotFound(_) => ErrorKind::NotFound,
                CollaboratorError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                CollaboratorError::Unavailable(_) => ErrorKind::Unavailable,
                CollaboratorError::Failed(_) => ErrorKind::Internal,
            },
        }
    }

    /// Maps a collaborator lookup failure for `run`, turning a store-level
    /// not-found into the run's own `NotFound`.
    pub(crate) fn run_lookup(run: &RunRef) -> impl FnOnce(CollaboratorError) -> Self {
        let run = run.clone();
        move |err| match err {
            CollaboratorError::NotFound(_) => OrchestratorError::NotFound(format!("run {run}")),
            other => OrchestratorError::Collaborator(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
