//! Sub-run correlation
//!
//! Sub-runs are stored under their root run and are only addressable
//! through it: the same child ID may repeat under different roots.

use crate::store::{CollaboratorError, RunAttempt, RunHistoryStore};
use crate::{OrchestratorError, Result};
use dagrun_core::{RunRef, RunStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Address of a run that an operation acts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTarget {
    Root(RunRef),
    SubRun { root: RunRef, sub_run_id: String },
}

impl RunTarget {
    pub fn root(&self) -> &RunRef {
        match self {
            RunTarget::Root(run) => run,
            RunTarget::SubRun { root, .. } => root,
        }
    }
}

impl From<RunRef> for RunTarget {
    fn from(run: RunRef) -> Self {
        RunTarget::Root(run)
    }
}

#[derive(Clone)]
pub struct SubRunCorrelator {
    history: Arc<dyn RunHistoryStore>,
}

impl SubRunCorrelator {
    pub fn new(history: Arc<dyn RunHistoryStore>) -> Self {
        Self { history }
    }

    /// Status of a sub-run under `root`
    pub async fn resolve(&self, root: &RunRef, sub_run_id: &str) -> Result<RunStatus> {
        Ok(self.resolve_attempt(root, sub_run_id).await?.status)
    }

    /// Latest attempt of a sub-run. A missing root is reported as the
    /// root's `NotFound`, a missing child as `SubRunNotFound`.
    pub async fn resolve_attempt(&self, root: &RunRef, sub_run_id: &str) -> Result<RunAttempt> {
        match self.history.find_sub_attempt(root, sub_run_id).await {
            Ok(attempt) => Ok(attempt),
            Err(CollaboratorError::NotFound(_)) => {
                self.history
                    .find_attempt(root)
                    .await
                    .map_err(OrchestratorError::run_lookup(root))?;
                Err(OrchestratorError::SubRunNotFound {
                    root: root.clone(),
                    sub_run_id: sub_run_id.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Load the attempt a target points at
    pub async fn resolve_target(&self, target: &RunTarget) -> Result<RunAttempt> {
        match target {
            RunTarget::Root(run) => self
                .history
                .find_attempt(run)
                .await
                .map_err(OrchestratorError::run_lookup(run)),
            RunTarget::SubRun { root, sub_run_id } => {
                self.resolve_attempt(root, sub_run_id).await
            }
        }
    }

    /// Statuses of the sub-runs launched by `root`, or by one of its
    /// sub-runs when `parent_sub_run_id` is given.
    ///
    /// Regular and repeated entries are both listed. Entries that fail to
    /// resolve are skipped.
    pub async fn list_sub_runs(
        &self,
        root: &RunRef,
        parent_sub_run_id: Option<&str>,
    ) -> Result<Vec<RunStatus>> {
        let parent = match parent_sub_run_id {
            Some(id) => self.resolve(root, id).await?,
            None => {
                self.history
                    .find_attempt(root)
                    .await
                    .map_err(OrchestratorError::run_lookup(root))?
                    .status
            }
        };

        let entries: Vec<String> = parent
            .nodes
            .iter()
            .flat_map(|node| node.all_sub_runs())
            .map(|entry| entry.run_id.clone())
            .collect();

        let lookups = entries
            .iter()
            .map(|id| self.history.find_sub_attempt(root, id));
        let results = join_all(lookups).await;

        Ok(entries
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(attempt) => Some(attempt.status),
                Err(err) => {
                    debug!(root = %root, sub_run_id = %id, error = %err, "Skipping unresolvable sub-run");
                    None
                }
            })
            .collect())
    }
}
