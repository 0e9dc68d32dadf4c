//! Approval gate for human-in-the-loop steps

use crate::dag::WorkflowDag;
use crate::store::{ExecutorLauncher, RunHistoryStore};
use crate::subrun::{RunTarget, SubRunCorrelator};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use dagrun_core::{NodeState, RunState, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Approve a waiting step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub target: RunTarget,
    pub step_name: String,
    /// Values handed to downstream steps as variables
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    pub approved_by: Option<String>,
}

impl ApproveRequest {
    pub fn new(target: impl Into<RunTarget>, step_name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            step_name: step_name.into(),
            inputs: HashMap::new(),
            approved_by: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn approved_by(mut self, user: impl Into<String>) -> Self {
        self.approved_by = Some(user.into());
        self
    }
}

/// Reject a waiting step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRequest {
    pub target: RunTarget,
    pub step_name: String,
    pub reason: Option<String>,
    pub rejected_by: Option<String>,
}

impl RejectRequest {
    pub fn new(target: impl Into<RunTarget>, step_name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            step_name: step_name.into(),
            reason: None,
            rejected_by: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn rejected_by(mut self, user: impl Into<String>) -> Self {
        self.rejected_by = Some(user.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub run_id: String,
    pub step_name: String,
    /// False while other steps still wait, or when the resume launch failed
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectOutcome {
    pub run_id: String,
    pub step_name: String,
    /// Downstream steps that will never run
    pub blocked_steps: Vec<String>,
}

/// Applies approve/reject decisions to persisted run state
#[derive(Clone)]
pub struct ApprovalGate {
    history: Arc<dyn RunHistoryStore>,
    launcher: Arc<dyn ExecutorLauncher>,
    sub_runs: SubRunCorrelator,
}

impl ApprovalGate {
    pub fn new(
        history: Arc<dyn RunHistoryStore>,
        launcher: Arc<dyn ExecutorLauncher>,
        sub_runs: SubRunCorrelator,
    ) -> Self {
        Self {
            history,
            launcher,
            sub_runs,
        }
    }

    /// Approve a waiting step and resume the run once nothing else waits
    pub async fn approve(&self, request: ApproveRequest) -> Result<ApprovalOutcome> {
        let attempt = self.sub_runs.resolve_target(&request.target).await?;
        let mut status = attempt.status;
        ensure_waiting(&status, &request.step_name)?;

        let mut missing: Vec<String> = attempt
            .definition
            .required_inputs(&request.step_name)
            .iter()
            .filter(|key| request.inputs.get(*key).map_or(true, |v| v.is_empty()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(OrchestratorError::MissingInputs(missing));
        }

        if let Some(node) = status.node_mut(&request.step_name) {
            node.state = NodeState::Succeeded;
            node.approved_at = Some(Utc::now());
            node.approved_by = request.approved_by.clone();
            for (key, value) in &request.inputs {
                node.output_variables
                    .insert(key.clone(), format!("{key}={value}"));
            }
            node.approval_inputs = Some(
                request
                    .inputs
                    .iter()
                    .map(|(key, value)| (screaming_snake_to_camel(key), value.clone()))
                    .collect(),
            );
        }

        self.history
            .update_status(request.target.root(), status.clone())
            .await?;

        info!(
            run = %status.run,
            step = %request.step_name,
            approved_by = request.approved_by.as_deref().unwrap_or(""),
            "Step approved"
        );

        let mut resumed = !status.has_waiting_nodes();
        if resumed {
            match self
                .launcher
                .retry(&attempt.definition, &status.run.run_id, None, false)
                .await
            {
                Ok(()) => info!(run = %status.run, "Run resumed after approval"),
                Err(err) => {
                    error!(run = %status.run, error = %err, "Failed to resume run after approval");
                    resumed = false;
                }
            }
        } else {
            info!(run = %status.run, "Other steps still waiting for approval");
        }

        Ok(ApprovalOutcome {
            run_id: status.run.run_id,
            step_name: request.step_name,
            resumed,
        })
    }

    /// Reject a waiting step; the run ends as `Rejected`
    pub async fn reject(&self, request: RejectRequest) -> Result<RejectOutcome> {
        let attempt = self.sub_runs.resolve_target(&request.target).await?;
        let mut status = attempt.status;
        ensure_waiting(&status, &request.step_name)?;

        let now = Utc::now();
        if let Some(node) = status.node_mut(&request.step_name) {
            node.state = NodeState::Rejected;
            node.rejected_at = Some(now);
            node.rejected_by = request.rejected_by.clone();
            node.rejection_reason = request.reason.clone();
        }
        status.state = RunState::Rejected;
        status.finished_at = Some(now);

        self.history
            .update_status(request.target.root(), status.clone())
            .await?;

        let blocked_steps = match WorkflowDag::new(&attempt.definition.steps) {
            Ok(dag) => dag.descendants(&request.step_name),
            Err(err) => {
                warn!(run = %status.run, error = %err, "Stored definition has no valid step graph");
                Vec::new()
            }
        };

        info!(
            run = %status.run,
            step = %request.step_name,
            reason = request.reason.as_deref().unwrap_or(""),
            blocked = blocked_steps.len(),
            "Step rejected"
        );

        Ok(RejectOutcome {
            run_id: status.run.run_id,
            step_name: request.step_name,
            blocked_steps,
        })
    }
}

fn ensure_waiting(status: &RunStatus, step_name: &str) -> Result<()> {
    let node = status
        .node(step_name)
        .ok_or_else(|| OrchestratorError::StepNotFound {
            run: status.run.clone(),
            step: step_name.to_string(),
        })?;

    if status.state != RunState::Waiting {
        return Err(OrchestratorError::InvalidState(format!(
            "run {} is {}, not waiting",
            status.run, status.state
        )));
    }
    if node.state != NodeState::Waiting {
        return Err(OrchestratorError::InvalidState(format!(
            "step {step_name} is {}, not waiting",
            node.state
        )));
    }
    Ok(())
}

/// `TOTAL_COUNT` -> `totalCount`, `FOO` -> `foo`. Empty segments are skipped.
fn screaming_snake_to_camel(key: &str) -> String {
    let mut camel = String::with_capacity(key.len());
    for part in key.split('_').filter(|p| !p.is_empty()) {
        let lower = part.to_lowercase();
        if camel.is_empty() {
            camel.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            camel.extend(first.to_uppercase());
            camel.push_str(chars.as_str());
        }
    }
    camel
}
