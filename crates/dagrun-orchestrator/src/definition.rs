//! Workflow definition snapshot
//!
//! A definition is produced by the (external) workflow loader. Every stored
//! attempt keeps the definition it ran with so retries and approvals are
//! reproducible after the definition changes.

use crate::admission::AdmissionPolicy;
use crate::dag::{DagValidationError, WorkflowDag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Human-approval configuration of a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Inputs that must be supplied, non-empty, on approval
    #[serde(default)]
    pub required: Vec<String>,
}

/// Step of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Names of steps that must finish first
    #[serde(default)]
    pub depends: Vec<String>,
    /// Present on human-in-the-loop steps
    pub wait: Option<WaitConfig>,
    /// Workflow launched as a sub-run by this step
    pub sub_workflow: Option<String>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends: Vec::new(),
            wait: None,
            sub_workflow: None,
        }
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends.push(step.into());
        self
    }

    pub fn with_approval<I, S>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait = Some(WaitConfig {
            required: required.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_sub_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.sub_workflow = Some(workflow.into());
        self
    }

    pub fn is_approval(&self) -> bool {
        self.wait.is_some()
    }
}

/// Workflow definition snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Named queue; shares its process group with other workflows
    pub queue: Option<String>,
    /// Zero or negative means unbounded
    #[serde(default)]
    pub max_active_runs: i32,
    /// Default parameters
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Labels a remote worker must match; empty runs locally
    #[serde(default)]
    pub worker_selector: HashMap<String, String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            max_active_runs: 0,
            params: String::new(),
            steps: Vec::new(),
            worker_selector: HashMap::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_active_runs(mut self, max: i32) -> Self {
        self.max_active_runs = max;
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_worker_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.worker_selector.insert(key.into(), value.into());
        self
    }

    /// Scope for liveness and queue lookups: the queue name when set
    pub fn proc_group(&self) -> &str {
        match self.queue.as_deref() {
            Some(queue) if !queue.is_empty() => queue,
            _ => &self.name,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            max_active_runs: self.max_active_runs,
            singleton: self.max_active_runs == 1,
            queue_name: self.queue.clone(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        !self.worker_selector.is_empty()
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Inputs a step requires on approval; empty for ordinary steps
    pub fn required_inputs(&self, step: &str) -> &[String] {
        self.step(step)
            .and_then(|s| s.wait.as_ref())
            .map(|w| w.required.as_slice())
            .unwrap_or(&[])
    }

    /// Build the step graph, rejecting definitions that cannot run
    pub fn validate(&self) -> Result<WorkflowDag, DagValidationError> {
        if self.name.trim().is_empty() {
            return Err(DagValidationError::InvalidStep(
                "workflow name must not be empty".to_string(),
            ));
        }
        WorkflowDag::new(&self.steps)
    }
}
