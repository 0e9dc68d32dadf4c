//! Simulated executor and fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use dagrun_core::{NodeState, NodeStatus, PollingConfig, RunRef, RunState, RunStatus, SubRunEntry};
use dagrun_orchestrator::{
    Collaborators, Coordinator, EnqueueOptions, ExecutorLauncher, InMemoryProcStore,
    InMemoryQueueStore, InMemoryRunHistory, InMemoryServiceRegistry, LifecycleOrchestrator,
    QueueItem, RetryTask, RunHistoryStore, StartOptions, StepDefinition, WorkflowDefinition,
};
use dagrun_orchestrator::store::{CollaboratorError, StoreResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the simulated executor behaves
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Delay between receiving a command and reporting the run as started
    pub start_delay: Duration,
    pub step_duration: Duration,
    /// Accept commands but never pick the run up
    pub never_start: bool,
    pub failing_steps: Vec<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(250),
            step_duration: Duration::from_millis(500),
            never_start: false,
            failing_steps: Vec::new(),
        }
    }
}

struct Inner {
    history: Arc<InMemoryRunHistory>,
    queues: Arc<InMemoryQueueStore>,
    procs: Arc<InMemoryProcStore>,
    behavior: Behavior,
    stops: DashMap<RunRef, CancellationToken>,
    starts: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

/// Executor that runs steps as timed sleeps and reports through the
/// in-memory stores, the way an out-of-process executor would.
#[derive(Clone)]
pub struct SimulatedExecutor {
    inner: Arc<Inner>,
}

impl SimulatedExecutor {
    pub fn new(
        history: Arc<InMemoryRunHistory>,
        queues: Arc<InMemoryQueueStore>,
        procs: Arc<InMemoryProcStore>,
        behavior: Behavior,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                history,
                queues,
                procs,
                behavior,
                stops: DashMap::new(),
                starts: AtomicUsize::new(0),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.commands.lock().unwrap().clone()
    }

    fn record(&self, command: String) {
        self.inner.commands.lock().unwrap().push(command);
    }

    fn token(&self, run: &RunRef) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.stops.insert(run.clone(), token.clone());
        token
    }

    fn spawn_drive(&self, definition: WorkflowDefinition, run: RunRef, only: Option<String>) {
        if self.inner.behavior.never_start {
            return;
        }
        let token = self.token(&run);
        let inner = self.inner.clone();
        tokio::spawn(drive(inner, definition, run, only, token));
    }
}

fn initial_nodes(definition: &WorkflowDefinition) -> Vec<NodeStatus> {
    definition.steps.iter().map(|s| NodeStatus::new(&s.name)).collect()
}

async fn update(inner: &Inner, run: &RunRef, apply: impl FnOnce(&mut RunStatus)) {
    if let Ok(mut status) = inner.history.current_status(run).await {
        apply(&mut status);
        let _ = inner.history.update_status(run, status).await;
    }
}

/// Unregisters before reporting, so a run seen as settled is never still alive
async fn finish(inner: &Inner, group: &str, run: &RunRef, state: RunState) {
    inner.procs.unregister(group, run).await;
    update(inner, run, |s| {
        s.state = state;
        if state != RunState::Waiting {
            s.finished_at = Some(Utc::now());
        }
    })
    .await;
}

async fn drive(
    inner: Arc<Inner>,
    definition: WorkflowDefinition,
    run: RunRef,
    only: Option<String>,
    token: CancellationToken,
) {
    let group = definition.proc_group().to_string();

    tokio::select! {
        _ = token.cancelled() => {
            finish(&inner, &group, &run, RunState::Aborted).await;
            return;
        }
        _ = tokio::time::sleep(inner.behavior.start_delay) => {}
    }

    inner.procs.register(&group, run.clone()).await;
    let worker = definition.is_distributed().then(|| "worker-1".to_string());
    update(&inner, &run, |s| {
        s.state = RunState::Running;
        s.started_at = Some(Utc::now());
        s.finished_at = None;
        s.worker_id = worker;
    })
    .await;

    let order = match definition.validate() {
        Ok(dag) => dag.topological_sort(),
        Err(_) => {
            finish(&inner, &group, &run, RunState::Failed).await;
            return;
        }
    };

    for step_name in order {
        if only.as_deref().is_some_and(|only| only != step_name) {
            continue;
        }
        let Ok(status) = inner.history.current_status(&run).await else {
            return;
        };
        if status.node(&step_name).is_some_and(|n| n.state == NodeState::Succeeded) {
            continue;
        }
        let Some(step) = definition.step(&step_name).cloned() else {
            continue;
        };

        if step.is_approval() {
            // Every approval step whose dependencies are done waits together
            let ready: Vec<String> = definition
                .steps
                .iter()
                .filter(|s| s.is_approval())
                .filter(|s| {
                    status
                        .node(&s.name)
                        .is_some_and(|n| n.state != NodeState::Succeeded)
                })
                .filter(|s| {
                    s.depends.iter().all(|d| {
                        status
                            .node(d)
                            .is_some_and(|n| n.state == NodeState::Succeeded)
                    })
                })
                .map(|s| s.name.clone())
                .collect();
            update(&inner, &run, |s| {
                for name in &ready {
                    if let Some(node) = s.node_mut(name) {
                        node.state = NodeState::Waiting;
                    }
                }
            })
            .await;
            finish(&inner, &group, &run, RunState::Waiting).await;
            return;
        }

        update(&inner, &run, |s| {
            if let Some(node) = s.node_mut(&step_name) {
                node.state = NodeState::Running;
            }
        })
        .await;

        tokio::select! {
            _ = token.cancelled() => {
                update(&inner, &run, |s| {
                    if let Some(node) = s.node_mut(&step_name) {
                        node.state = NodeState::Aborted;
                    }
                })
                .await;
                finish(&inner, &group, &run, RunState::Aborted).await;
                return;
            }
            _ = tokio::time::sleep(inner.behavior.step_duration) => {}
        }

        if let Some(sub_workflow) = &step.sub_workflow {
            let sub_id = format!("{}-{}", run.run_id, step_name);
            let sub_run = RunRef::new(sub_workflow, &sub_id);
            inner
                .history
                .create_sub_attempt(
                    WorkflowDefinition::new(sub_workflow).with_step(StepDefinition::new("main")),
                    RunStatus::new_sub_run(sub_run, run.clone(), run.clone())
                        .with_state(RunState::Succeeded)
                        .with_nodes(vec![NodeStatus::new("main").with_state(NodeState::Succeeded)]),
                )
                .await;
            update(&inner, &run, |s| {
                if let Some(node) = s.node_mut(&step_name) {
                    node.sub_runs
                        .push(SubRunEntry::new(&sub_id).with_workflow_name(sub_workflow));
                }
            })
            .await;
        }

        let failed = inner.behavior.failing_steps.contains(&step_name);
        update(&inner, &run, |s| {
            if let Some(node) = s.node_mut(&step_name) {
                node.state = if failed { NodeState::Failed } else { NodeState::Succeeded };
                node.done_count += 1;
            }
        })
        .await;
        if failed {
            finish(&inner, &group, &run, RunState::Failed).await;
            return;
        }
    }

    finish(&inner, &group, &run, RunState::Succeeded).await;
}

#[async_trait]
impl ExecutorLauncher for SimulatedExecutor {
    async fn start(&self, definition: &WorkflowDefinition, options: StartOptions) -> StoreResult<()> {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        self.record(format!("start {}", options.run_id));

        let run = RunRef::new(&definition.name, &options.run_id);
        self.inner
            .history
            .create_attempt(
                definition.clone(),
                RunStatus::new(run.clone())
                    .with_params(options.params)
                    .with_nodes(initial_nodes(definition)),
            )
            .await;
        self.spawn_drive(definition.clone(), run, None);
        Ok(())
    }

    async fn enqueue(&self, definition: &WorkflowDefinition, options: EnqueueOptions) -> StoreResult<()> {
        self.record(format!("enqueue {}", options.run_id));

        let run = RunRef::new(&definition.name, &options.run_id);
        self.inner
            .history
            .create_attempt(
                definition.clone(),
                RunStatus::new(run.clone())
                    .with_params(options.params)
                    .with_nodes(initial_nodes(definition)),
            )
            .await;
        if self.inner.behavior.never_start {
            return Ok(());
        }

        let queue = options
            .queue
            .unwrap_or_else(|| definition.proc_group().to_string());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.behavior.start_delay).await;
            inner.queues.push(&queue, QueueItem::new(run.clone())).await;
            update(&inner, &run, |s| {
                s.state = RunState::Queued;
                s.queued_at = Some(Utc::now());
            })
            .await;
        });
        Ok(())
    }

    async fn retry(
        &self,
        definition: &WorkflowDefinition,
        run_id: &str,
        step_name: Option<&str>,
        step_only: bool,
    ) -> StoreResult<()> {
        self.record(format!("retry {run_id} {}", step_name.unwrap_or("*")));

        let run = RunRef::new(&definition.name, run_id);
        let previous = self.inner.history.current_status(&run).await?;
        let mut next = previous.clone();
        next.state = RunState::NotStarted;
        next.finished_at = None;
        for node in &mut next.nodes {
            let reset = match step_name {
                Some(step) if step_only => node.name == step,
                _ => node.state != NodeState::Succeeded,
            };
            if reset {
                node.state = NodeState::NotStarted;
                node.retry_count += 1;
            }
        }
        self.inner.history.create_attempt(definition.clone(), next).await;

        let only = if step_only { step_name.map(str::to_string) } else { None };
        self.spawn_drive(definition.clone(), run, only);
        Ok(())
    }

    async fn stop(&self, definition: &WorkflowDefinition, run_id: &str) -> StoreResult<()> {
        self.record(format!("stop {run_id}"));
        let run = RunRef::new(&definition.name, run_id);
        match self.inner.stops.get(&run) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(CollaboratorError::NotFound(run.to_string())),
        }
    }

    async fn dequeue(&self, definition: &WorkflowDefinition, run_id: &str) -> StoreResult<()> {
        self.record(format!("dequeue {run_id}"));
        let run = RunRef::new(&definition.name, run_id);
        self.inner.queues.remove(&run).await;
        update(&self.inner, &run, |s| {
            s.state = RunState::Aborted;
            s.finished_at = Some(Utc::now());
        })
        .await;
        Ok(())
    }
}

/// Coordinator that records what it was asked to do
#[derive(Default)]
pub struct RecordingCoordinator {
    pub dispatched: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<RunRef>>,
}

#[async_trait]
impl Coordinator for RecordingCoordinator {
    async fn dispatch_retry(&self, task: RetryTask) -> StoreResult<()> {
        self.dispatched.lock().unwrap().push(task.run_id);
        Ok(())
    }

    async fn request_cancel(&self, run: &RunRef) -> StoreResult<()> {
        self.cancelled.lock().unwrap().push(run.clone());
        Ok(())
    }
}

/// Orchestrator wired to in-memory stores and a simulated executor
pub struct Harness {
    pub orchestrator: LifecycleOrchestrator,
    pub history: Arc<InMemoryRunHistory>,
    pub queues: Arc<InMemoryQueueStore>,
    pub procs: Arc<InMemoryProcStore>,
    pub executor: SimulatedExecutor,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        let history = Arc::new(InMemoryRunHistory::new());
        let queues = Arc::new(InMemoryQueueStore::new());
        let procs = Arc::new(InMemoryProcStore::new());
        let executor =
            SimulatedExecutor::new(history.clone(), queues.clone(), procs.clone(), behavior);

        let collaborators = Collaborators::new(
            history.clone(),
            queues.clone(),
            procs.clone(),
            Arc::new(executor.clone()),
        );
        let orchestrator = LifecycleOrchestrator::new(collaborators, PollingConfig::default());

        Self {
            orchestrator,
            history,
            queues,
            procs,
            executor,
        }
    }

    /// Same harness, with a coordinator and service registry attached
    pub fn with_coordinator(
        mut self,
        coordinator: Arc<RecordingCoordinator>,
        registry: Arc<InMemoryServiceRegistry>,
    ) -> Self {
        self.orchestrator = self.orchestrator.with_coordinator(coordinator, registry);
        self
    }

    pub async fn status(&self, workflow: &str, run_id: &str) -> RunStatus {
        self.history
            .current_status(&RunRef::new(workflow, run_id))
            .await
            .unwrap()
    }

    /// Let simulated time pass so background executor work can progress
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub fn linear(name: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(name)
        .with_params("env=test")
        .with_step(StepDefinition::new("extract"))
        .with_step(StepDefinition::new("transform").depends_on("extract"))
        .with_step(StepDefinition::new("load").depends_on("transform"))
}

/// build -> (qa, security) -> deploy -> announce; qa and security wait for approval
pub fn release() -> WorkflowDefinition {
    WorkflowDefinition::new("release")
        .with_step(StepDefinition::new("build"))
        .with_step(StepDefinition::new("qa").depends_on("build").with_approval(["reason"]))
        .with_step(
            StepDefinition::new("security")
                .depends_on("build")
                .with_approval(Vec::<String>::new()),
        )
        .with_step(
            StepDefinition::new("deploy")
                .depends_on("qa")
                .depends_on("security"),
        )
        .with_step(StepDefinition::new("announce").depends_on("deploy"))
}
