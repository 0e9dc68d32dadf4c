//! Admission control
//!
//! Live-process count and queue length come from two collaborators that are
//! each consistent on their own. They are read as a snapshot, not a
//! transaction: two simultaneous first submissions of a singleton workflow
//! can both observe nothing live and both be admitted.

use crate::store::{ProcStore, QueueStore};
use crate::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Concurrency policy derived from a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    /// Zero or negative means unbounded
    pub max_active_runs: i32,
    pub singleton: bool,
    pub queue_name: Option<String>,
}

/// What the submission intends to do once admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    Start,
    Enqueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject(String),
}

/// Apply the admission table to one snapshot of live and queued counts
pub fn decide(
    policy: &AdmissionPolicy,
    requested_singleton: bool,
    mode: AdmissionMode,
    live: usize,
    queued: usize,
) -> AdmissionDecision {
    if requested_singleton || policy.singleton || policy.max_active_runs == 1 {
        if live > 0 {
            return AdmissionDecision::Reject(format!(
                "singleton workflow already has {live} running"
            ));
        }
        if mode == AdmissionMode::Enqueue && queued > 0 {
            return AdmissionDecision::Reject(format!(
                "singleton workflow already has {queued} queued"
            ));
        }
        return AdmissionDecision::Admit;
    }

    if policy.max_active_runs > 0 {
        let max = policy.max_active_runs as usize;
        if live + queued >= max {
            return AdmissionDecision::Reject(format!(
                "max active runs reached ({live} running + {queued} queued >= {max})"
            ));
        }
    }

    AdmissionDecision::Admit
}

/// Reads liveness and queue collaborators and applies [`decide`]
#[derive(Clone)]
pub struct AdmissionController {
    procs: Arc<dyn ProcStore>,
    queues: Arc<dyn QueueStore>,
}

impl AdmissionController {
    pub fn new(procs: Arc<dyn ProcStore>, queues: Arc<dyn QueueStore>) -> Self {
        Self { procs, queues }
    }

    /// Admit or reject a submission for `workflow_name` within process `group`.
    ///
    /// The live and queued counts are two separate reads, a snapshot rather
    /// than a transaction, so simultaneous first submissions can race past a
    /// singleton or `max_active_runs` limit.
    pub async fn check(
        &self,
        workflow_name: &str,
        group: &str,
        policy: &AdmissionPolicy,
        requested_singleton: bool,
        mode: AdmissionMode,
    ) -> Result<()> {
        let live = self.procs.count_alive_by_workflow(group, workflow_name).await?;
        let queued = self.queues.list_by_workflow(group, workflow_name).await?.len();

        debug!(
            workflow = %workflow_name,
            group = %group,
            live,
            queued,
            ?mode,
            "Admission snapshot"
        );

        match decide(policy, requested_singleton, mode, live, queued) {
            AdmissionDecision::Admit => Ok(()),
            AdmissionDecision::Reject(reason) => {
                warn!(
                    workflow = %workflow_name,
                    group = %group,
                    reason = %reason,
                    "Admission rejected"
                );
                Err(OrchestratorError::Conflict(format!("{workflow_name}: {reason}")))
            }
        }
    }
}
