//! Run, node and sub-run status records as persisted per attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identity of a single run: workflow name plus run ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunRef {
    pub workflow_name: String,
    pub run_id: String,
}

impl RunRef {
    pub fn new(workflow_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for RunRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow_name, self.run_id)
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Submitted, executor has not picked it up yet
    NotStarted,
    /// Sitting in a persisted queue
    Queued,
    /// Executor is running steps
    Running,
    /// Paused on a human approval step
    Waiting,
    Succeeded,
    Failed,
    PartialSuccess,
    Aborted,
    Rejected,
}

impl RunState {
    /// True while the executor still owns the run.
    ///
    /// `Waiting` is deliberately not active: nothing progresses until a human
    /// approves or rejects.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::NotStarted | RunState::Queued | RunState::Running
        )
    }

    pub fn is_waiting(self) -> bool {
        self == RunState::Waiting
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::PartialSuccess
                | RunState::Aborted
                | RunState::Rejected
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunState::NotStarted => "not_started",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Waiting => "waiting",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::PartialSuccess => "partial_success",
            RunState::Aborted => "aborted",
            RunState::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// State of a single step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    NotStarted,
    Running,
    Waiting,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    Rejected,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeState::NotStarted => "not_started",
            NodeState::Running => "running",
            NodeState::Waiting => "waiting",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Aborted => "aborted",
            NodeState::Skipped => "skipped",
            NodeState::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// A sub-run launched by a step, addressable only under its root run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRunEntry {
    pub run_id: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
}

impl SubRunEntry {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            params: String::new(),
            workflow_name: None,
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_workflow_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }
}

/// Per-step status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub state: NodeState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub done_count: u32,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approval_inputs: Option<HashMap<String, String>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
    /// Variables exported to downstream steps, stored as `KEY=value`
    #[serde(default)]
    pub output_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub sub_runs: Vec<SubRunEntry>,
    /// Sub-runs spawned by repeat/parallel execution of the same step
    #[serde(default)]
    pub sub_runs_repeated: Vec<SubRunEntry>,
}

impl NodeStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: NodeState::NotStarted,
            retry_count: 0,
            done_count: 0,
            approved_at: None,
            approved_by: None,
            approval_inputs: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
            output_variables: BTreeMap::new(),
            sub_runs: Vec::new(),
            sub_runs_repeated: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn with_sub_run(mut self, entry: SubRunEntry) -> Self {
        self.sub_runs.push(entry);
        self
    }

    pub fn with_repeated_sub_run(mut self, entry: SubRunEntry) -> Self {
        self.sub_runs_repeated.push(entry);
        self
    }

    /// All sub-run entries, regular ones first.
    pub fn all_sub_runs(&self) -> impl Iterator<Item = &SubRunEntry> {
        self.sub_runs.iter().chain(self.sub_runs_repeated.iter())
    }
}

/// Status of one run attempt as kept by the run-history store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run: RunRef,
    pub state: RunState,
    #[serde(default)]
    pub params: String,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a remote worker executes the run
    pub worker_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
    pub root: RunRef,
    pub parent: Option<RunRef>,
}

impl RunStatus {
    /// Fresh root-run status in `NotStarted`.
    pub fn new(run: RunRef) -> Self {
        Self {
            root: run.clone(),
            run,
            state: RunState::NotStarted,
            params: String::new(),
            queued_at: None,
            started_at: None,
            finished_at: None,
            worker_id: None,
            nodes: Vec::new(),
            parent: None,
        }
    }

    /// Fresh sub-run status nested under `parent`, sharing `root`'s storage.
    pub fn new_sub_run(run: RunRef, root: RunRef, parent: RunRef) -> Self {
        Self {
            root,
            parent: Some(parent),
            ..Self::new(run)
        }
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeStatus>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn is_sub_run(&self) -> bool {
        self.run != self.root
    }

    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeStatus> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn has_waiting_nodes(&self) -> bool {
        self.nodes.iter().any(|n| n.state == NodeState::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_classification() {
        assert!(RunState::NotStarted.is_active());
        assert!(RunState::Queued.is_active());
        assert!(RunState::Running.is_active());
        assert!(!RunState::Waiting.is_active());
        assert!(RunState::Waiting.is_waiting());

        for state in [
            RunState::Succeeded,
            RunState::Failed,
            RunState::PartialSuccess,
            RunState::Aborted,
            RunState::Rejected,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
            assert!(!state.is_active());
        }
        assert!(!RunState::Waiting.is_terminal());
    }

    #[test]
    fn test_sub_run_status_keeps_root() {
        let root = RunRef::new("parent", "r1");
        let child = RunRef::new("child", "c1");
        let status = RunStatus::new_sub_run(child.clone(), root.clone(), root.clone());

        assert!(status.is_sub_run());
        assert_eq!(status.root, root);
        assert_eq!(status.parent, Some(root));
        assert_eq!(status.run, child);
        assert_eq!(status.state, RunState::NotStarted);
    }

    #[test]
    fn test_node_lookup_and_waiting() {
        let mut status = RunStatus::new(RunRef::new("wf", "r1")).with_nodes(vec![
            NodeStatus::new("a").with_state(NodeState::Succeeded),
            NodeStatus::new("gate").with_state(NodeState::Waiting),
        ]);

        assert!(status.has_waiting_nodes());
        status.node_mut("gate").unwrap().state = NodeState::Succeeded;
        assert!(!status.has_waiting_nodes());
        assert!(status.node("missing").is_none());
    }

    #[test]
    fn test_all_sub_runs_includes_repeated() {
        let node = NodeStatus::new("fanout")
            .with_sub_run(SubRunEntry::new("s1"))
            .with_repeated_sub_run(SubRunEntry::new("s2").with_params("n=2"));

        let ids: Vec<_> = node.all_sub_runs().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let status = RunStatus::new(RunRef::new("wf", "r1")).with_state(RunState::PartialSuccess);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "partial_success");
        assert_eq!(RunRef::new("wf", "r1").to_string(), "wf:r1");
    }
}
