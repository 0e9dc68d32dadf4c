//! Run lifecycle orchestration
//!
//! Entry points validate preconditions against freshly read state, then
//! delegate to the executor. Once a command has been handed to the executor
//! it is never rolled back: an observation failure is reported as
//! uncertainty, not as a failed run.

use crate::admission::{AdmissionController, AdmissionMode};
use crate::approval::{ApprovalGate, ApprovalOutcome, ApproveRequest, RejectOutcome, RejectRequest};
use crate::definition::WorkflowDefinition;
use crate::identity::{RunIdentity, UuidV7Generator};
use crate::observer::{Confirmation, RunObserver, WaitOutcome};
use crate::queues::{summarize_queues, QueueSummary};
use crate::store::{
    Coordinator, EnqueueOptions, ExecutorLauncher, ProcStore, QueueStore, RetryTask,
    RunFilter, RunHistoryStore, RunIdGenerator, ServiceRegistry, ServiceStatus, StartOptions,
};
use crate::subrun::{RunTarget, SubRunCorrelator};
use crate::{OrchestratorError, Result};
use dagrun_core::{NodeState, OrchestratorConfig, PollingConfig, RunRef, RunState, RunStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Span};

/// Service name of the coordinator in the service registry
pub const COORDINATOR_SERVICE: &str = "coordinator";

/// Collaborators the orchestrator is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub history: Arc<dyn RunHistoryStore>,
    pub queues: Arc<dyn QueueStore>,
    pub procs: Arc<dyn ProcStore>,
    pub launcher: Arc<dyn ExecutorLauncher>,
    pub id_generator: Arc<dyn RunIdGenerator>,
}

impl Collaborators {
    pub fn new(
        history: Arc<dyn RunHistoryStore>,
        queues: Arc<dyn QueueStore>,
        procs: Arc<dyn ProcStore>,
        launcher: Arc<dyn ExecutorLauncher>,
    ) -> Self {
        Self {
            history,
            queues,
            procs,
            launcher,
            id_generator: Arc::new(UuidV7Generator),
        }
    }

    pub fn with_id_generator(mut self, generator: Arc<dyn RunIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }
}

/// Start a run now
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Overrides the definition's default parameters
    pub params: Option<String>,
    /// Caller-chosen run ID; allocated when absent
    pub run_id: Option<String>,
    #[serde(default)]
    pub singleton: bool,
}

impl ExecuteRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

/// Put a run on a persisted queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub params: Option<String>,
    pub run_id: Option<String>,
    /// Overrides the definition's queue, and with it the process group
    pub queue: Option<String>,
    #[serde(default)]
    pub singleton: bool,
}

impl EnqueueRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

/// Retry options. The default retries the whole run in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryRequest {
    pub new_run_id: Option<String>,
    #[serde(default)]
    pub generate_new_id: bool,
    /// Retry only this step; requires the original run ID
    pub step_name: Option<String>,
}

impl RetryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_new_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.new_run_id = Some(run_id.into());
        self
    }

    pub fn generate_new_id(mut self) -> Self {
        self.generate_new_id = true;
        self
    }

    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub run_id: String,
    /// The new run landed in a queue instead of starting
    pub queued: bool,
}

/// Result of a synchronous execution
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The run finished or is waiting for approval
    Finished(RunStatus),
    /// The wait ran out; the run continues in the background
    TimedOut {
        run_id: String,
        last_status: Option<RunStatus>,
    },
    /// The caller gave up waiting; the run is unaffected
    Cancelled {
        run_id: String,
        last_status: Option<RunStatus>,
    },
}

impl SyncOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            SyncOutcome::Finished(status) => &status.run.run_id,
            SyncOutcome::TimedOut { run_id, .. } | SyncOutcome::Cancelled { run_id, .. } => run_id,
        }
    }
}

/// Top-level run state machine
pub struct LifecycleOrchestrator {
    history: Arc<dyn RunHistoryStore>,
    queues: Arc<dyn QueueStore>,
    procs: Arc<dyn ProcStore>,
    launcher: Arc<dyn ExecutorLauncher>,
    identity: RunIdentity,
    admission: AdmissionController,
    observer: RunObserver,
    sub_runs: SubRunCorrelator,
    approvals: ApprovalGate,
    coordinator: Option<Arc<dyn Coordinator>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

impl LifecycleOrchestrator {
    pub fn new(collaborators: Collaborators, polling: PollingConfig) -> Self {
        let Collaborators {
            history,
            queues,
            procs,
            launcher,
            id_generator,
        } = collaborators;

        let sub_runs = SubRunCorrelator::new(history.clone());
        Self {
            identity: RunIdentity::new(id_generator, history.clone()),
            admission: AdmissionController::new(procs.clone(), queues.clone()),
            observer: RunObserver::new(history.clone(), polling),
            approvals: ApprovalGate::new(history.clone(), launcher.clone(), sub_runs.clone()),
            sub_runs,
            history,
            queues,
            procs,
            launcher,
            coordinator: None,
            registry: None,
        }
    }

    pub fn from_config(collaborators: Collaborators, config: &OrchestratorConfig) -> Self {
        Self::new(collaborators, config.polling.clone())
    }

    /// Route distributed runs through a coordinator
    pub fn with_coordinator(
        mut self,
        coordinator: Arc<dyn Coordinator>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Self {
        self.coordinator = Some(coordinator);
        self.registry = Some(registry);
        self
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Launch a run and wait until the executor picked it up
    #[instrument(skip(self, definition, request), fields(workflow = %definition.name, run_id = tracing::field::Empty))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        request: ExecuteRequest,
    ) -> Result<String> {
        let (run, confirmation) = self
            .launch(definition, &request, &CancellationToken::new())
            .await?;

        match confirmation {
            Confirmation::Confirmed(status) => {
                info!(run = %run, state = %status.state, "Run started");
                Ok(run.run_id)
            }
            Confirmation::TimedOut { last_error, .. } => {
                warn!(run = %run, last_error = ?last_error, "Run did not start in time");
                Err(OrchestratorError::StartTimeout(run))
            }
            Confirmation::Cancelled => {
                warn!(run = %run, "Run did not start in time");
                Err(OrchestratorError::StartTimeout(run))
            }
        }
    }

    /// Launch a run and wait until it finishes, pauses for approval, or
    /// `timeout` runs out
    pub async fn execute_sync(
        &self,
        definition: &WorkflowDefinition,
        request: ExecuteRequest,
        timeout: Duration,
    ) -> Result<SyncOutcome> {
        self.execute_sync_with_cancel(definition, request, timeout, &CancellationToken::new())
            .await
    }

    /// [`Self::execute_sync`] that also stops waiting when `cancel` fires
    #[instrument(skip(self, definition, request, cancel), fields(workflow = %definition.name, run_id = tracing::field::Empty))]
    pub async fn execute_sync_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        request: ExecuteRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let (run, confirmation) = self.launch(definition, &request, cancel).await?;

        match confirmation {
            Confirmation::Confirmed(_) => {}
            Confirmation::Cancelled => {
                return Ok(SyncOutcome::Cancelled {
                    run_id: run.run_id,
                    last_status: None,
                })
            }
            Confirmation::TimedOut { last_error, .. } => {
                warn!(run = %run, last_error = ?last_error, "Run did not start in time");
                return Err(OrchestratorError::StartTimeout(run));
            }
        }

        match self
            .observer
            .wait_for_terminal_or_waiting(&run, timeout, cancel)
            .await
        {
            WaitOutcome::Settled(status) => {
                info!(run = %run, state = %status.state, "Run settled");
                Ok(SyncOutcome::Finished(status))
            }
            WaitOutcome::DeadlineExceeded(last_status) => {
                info!(run = %run, ?timeout, "Run continues in background after wait timeout");
                Ok(SyncOutcome::TimedOut {
                    run_id: run.run_id,
                    last_status,
                })
            }
            WaitOutcome::Cancelled(last_status) => {
                info!(run = %run, "Wait cancelled by caller");
                Ok(SyncOutcome::Cancelled {
                    run_id: run.run_id,
                    last_status,
                })
            }
        }
    }

    async fn launch(
        &self,
        definition: &WorkflowDefinition,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<(RunRef, Confirmation)> {
        definition.validate()?;
        let run_id = self.identity.resolve(request.run_id.as_deref())?;
        Span::current().record("run_id", run_id.as_str());

        self.admission
            .check(
                &definition.name,
                definition.proc_group(),
                &definition.admission_policy(),
                request.singleton,
                AdmissionMode::Start,
            )
            .await?;
        let _reservation = self.identity.reserve(&definition.name, &run_id).await?;

        let options = StartOptions {
            run_id: run_id.clone(),
            params: request
                .params
                .clone()
                .unwrap_or_else(|| definition.params.clone()),
            singleton: request.singleton,
        };
        self.launcher.start(definition, options).await?;

        let run = RunRef::new(&definition.name, run_id);
        info!(run = %run, singleton = request.singleton, "Run launched");

        let confirmation = self.observer.await_start(&run, cancel).await;
        Ok((run, confirmation))
    }

    /// Put a run on a queue and wait until it shows up as queued
    #[instrument(skip(self, definition, request), fields(workflow = %definition.name, run_id = tracing::field::Empty))]
    pub async fn enqueue(
        &self,
        definition: &WorkflowDefinition,
        request: EnqueueRequest,
    ) -> Result<String> {
        definition.validate()?;
        let run_id = self.identity.resolve(request.run_id.as_deref())?;
        Span::current().record("run_id", run_id.as_str());

        let group = request
            .queue
            .as_deref()
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| definition.proc_group());

        self.admission
            .check(
                &definition.name,
                group,
                &definition.admission_policy(),
                request.singleton,
                AdmissionMode::Enqueue,
            )
            .await?;
        let _reservation = self.identity.reserve(&definition.name, &run_id).await?;

        let options = EnqueueOptions {
            run_id: run_id.clone(),
            params: request
                .params
                .clone()
                .unwrap_or_else(|| definition.params.clone()),
            queue: request.queue.clone(),
        };
        self.launcher.enqueue(definition, options).await?;

        let run = RunRef::new(&definition.name, run_id);
        match self.observer.await_enqueue(&run, &CancellationToken::new()).await {
            Confirmation::Confirmed(status) => {
                info!(run = %run, queue = %group, state = %status.state, "Run enqueued");
                Ok(run.run_id)
            }
            Confirmation::TimedOut { .. } | Confirmation::Cancelled => {
                warn!(run = %run, queue = %group, "Run was not enqueued in time");
                Err(OrchestratorError::EnqueueTimeout(run))
            }
        }
    }

    /// Remove a queued run from its queue
    #[instrument(skip(self))]
    pub async fn dequeue(&self, run: &RunRef) -> Result<()> {
        let status = self
            .history
            .current_status(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))?;

        if status.state != RunState::Queued {
            return Err(OrchestratorError::InvalidState(format!(
                "run {run} is {}, not queued",
                status.state
            )));
        }

        let attempt = self
            .history
            .find_attempt(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))?;
        self.launcher
            .dequeue(&attempt.definition, &run.run_id)
            .await?;

        info!(run = %run, "Run dequeued");
        Ok(())
    }

    /// Retry a run in place (optionally a single step) or as a new run.
    ///
    /// Both paths use the definition snapshot stored with the attempt.
    #[instrument(skip(self, request))]
    pub async fn retry(&self, run: &RunRef, request: RetryRequest) -> Result<RetryOutcome> {
        let requested_new_id = request
            .new_run_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != run.run_id);
        let same_id = !request.generate_new_id && requested_new_id.is_none();

        if request.step_name.is_some() && !same_id {
            return Err(OrchestratorError::BadRequest(
                "step retry must reuse the original run ID".to_string(),
            ));
        }

        let attempt = self
            .history
            .find_attempt(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))?;

        if same_id {
            self.retry_in_place(run, attempt.definition, attempt.status, request.step_name)
                .await
        } else {
            self.retry_as_new(run, attempt.definition, attempt.status, requested_new_id)
                .await
        }
    }

    async fn retry_in_place(
        &self,
        run: &RunRef,
        definition: WorkflowDefinition,
        status: RunStatus,
        step_name: Option<String>,
    ) -> Result<RetryOutcome> {
        if matches!(status.state, RunState::Queued | RunState::Running) {
            return Err(OrchestratorError::InvalidState(format!(
                "run {run} is still {}",
                status.state
            )));
        }
        if let Some(step) = step_name.as_deref() {
            if status.node(step).is_none() {
                return Err(OrchestratorError::StepNotFound {
                    run: run.clone(),
                    step: step.to_string(),
                });
            }
        }

        self.admission
            .check(
                &definition.name,
                definition.proc_group(),
                &definition.admission_policy(),
                false,
                AdmissionMode::Start,
            )
            .await?;

        if definition.is_distributed() {
            let coordinator = self.coordinator().await?;
            coordinator
                .dispatch_retry(RetryTask {
                    definition,
                    run_id: run.run_id.clone(),
                    previous_status: status,
                    step_name: step_name.clone(),
                })
                .await?;
            info!(run = %run, step = ?step_name, "Retry dispatched to coordinator");
        } else {
            self.launcher
                .retry(
                    &definition,
                    &run.run_id,
                    step_name.as_deref(),
                    step_name.is_some(),
                )
                .await?;
            info!(run = %run, step = ?step_name, "Run retried in place");
        }

        Ok(RetryOutcome {
            run_id: run.run_id.clone(),
            queued: false,
        })
    }

    async fn retry_as_new(
        &self,
        run: &RunRef,
        definition: WorkflowDefinition,
        previous: RunStatus,
        requested_id: Option<&str>,
    ) -> Result<RetryOutcome> {
        let new_id = self.identity.resolve(requested_id)?;
        let _reservation = self.identity.reserve(&definition.name, &new_id).await?;

        self.admission
            .check(
                &definition.name,
                definition.proc_group(),
                &definition.admission_policy(),
                false,
                AdmissionMode::Start,
            )
            .await?;

        let options = StartOptions {
            run_id: new_id.clone(),
            params: previous.params,
            singleton: false,
        };
        self.launcher.start(&definition, options).await?;

        let new_run = RunRef::new(&definition.name, new_id);
        info!(from = %run, run = %new_run, "Run retried under a new ID");

        if let Confirmation::TimedOut { .. } | Confirmation::Cancelled = self
            .observer
            .await_start(&new_run, &CancellationToken::new())
            .await
        {
            warn!(run = %new_run, "Retried run did not start in time");
            return Err(OrchestratorError::StartTimeout(new_run));
        }

        let queued = match self.history.current_status(&new_run).await {
            Ok(status) => status.state == RunState::Queued,
            Err(err) => {
                warn!(run = %new_run, error = %err, "Could not read status of retried run");
                false
            }
        };

        Ok(RetryOutcome {
            run_id: new_run.run_id,
            queued,
        })
    }

    /// Ask the executor (or the coordinator, for remote runs) to stop a
    /// running run. Does not wait for the stop to take effect.
    #[instrument(skip(self))]
    pub async fn terminate(&self, run: &RunRef) -> Result<()> {
        let attempt = self
            .history
            .find_attempt(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))?;

        if let Some(worker_id) = attempt.status.worker_id.as_deref() {
            if attempt.status.state != RunState::Running {
                return Err(OrchestratorError::NotRunning(run.clone()));
            }
            let coordinator = self.coordinator().await?;
            coordinator.request_cancel(run).await?;
            info!(run = %run, worker_id = %worker_id, "Cancel requested through coordinator");
            return Ok(());
        }

        let status = self
            .history
            .current_status(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))?;
        if status.state != RunState::Running {
            return Err(OrchestratorError::NotRunning(run.clone()));
        }

        self.launcher.stop(&attempt.definition, &run.run_id).await?;
        info!(run = %run, "Stop requested");
        Ok(())
    }

    /// Stop every alive run of a workflow; returns how many stops were sent
    #[instrument(skip(self, definition), fields(workflow = %definition.name))]
    pub async fn terminate_all(&self, definition: &WorkflowDefinition) -> Result<usize> {
        let alive = self.procs.list_all_alive().await?;
        let runs: Vec<RunRef> = alive
            .get(definition.proc_group())
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.workflow_name == definition.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut stopped = 0;
        for run in &runs {
            match self.launcher.stop(definition, &run.run_id).await {
                Ok(()) => stopped += 1,
                Err(err) => warn!(run = %run, error = %err, "Failed to stop run"),
            }
        }

        info!(stopped, alive = runs.len(), "Stop requested for all alive runs");
        Ok(stopped)
    }

    #[instrument(skip(self, request), fields(step = %request.step_name))]
    pub async fn approve(&self, request: ApproveRequest) -> Result<ApprovalOutcome> {
        self.approvals.approve(request).await
    }

    #[instrument(skip(self, request), fields(step = %request.step_name))]
    pub async fn reject(&self, request: RejectRequest) -> Result<RejectOutcome> {
        self.approvals.reject(request).await
    }

    /// Manually set a step's state on a run that is not running
    #[instrument(skip(self))]
    pub async fn update_step_status(
        &self,
        target: &RunTarget,
        step_name: &str,
        state: NodeState,
    ) -> Result<RunStatus> {
        let mut status = self.sub_runs.resolve_target(target).await?.status;

        if status.state == RunState::Running {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is running; step status cannot be changed",
                status.run
            )));
        }

        let run = status.run.clone();
        let node = status
            .node_mut(step_name)
            .ok_or_else(|| OrchestratorError::StepNotFound {
                run: run.clone(),
                step: step_name.to_string(),
            })?;
        let previous = node.state;
        node.state = state;

        self.history
            .update_status(target.root(), status.clone())
            .await?;

        info!(run = %run, step = %step_name, from = %previous, to = %state, "Step status updated");
        Ok(status)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunStatus>> {
        Ok(self.history.list_statuses(filter).await?)
    }

    pub async fn latest_status(&self, workflow_name: &str) -> Result<RunStatus> {
        self.history
            .latest_attempt(workflow_name)
            .await
            .map(|attempt| attempt.status)
            .map_err(|err| match err {
                crate::store::CollaboratorError::NotFound(_) => {
                    OrchestratorError::NotFound(format!("no runs of workflow {workflow_name}"))
                }
                other => other.into(),
            })
    }

    pub async fn status(&self, run: &RunRef) -> Result<RunStatus> {
        self.history
            .current_status(run)
            .await
            .map_err(OrchestratorError::run_lookup(run))
    }

    pub async fn sub_run_status(&self, root: &RunRef, sub_run_id: &str) -> Result<RunStatus> {
        self.sub_runs.resolve(root, sub_run_id).await
    }

    pub async fn list_sub_runs(
        &self,
        root: &RunRef,
        parent_sub_run_id: Option<&str>,
    ) -> Result<Vec<RunStatus>> {
        self.sub_runs.list_sub_runs(root, parent_sub_run_id).await
    }

    pub async fn queue_overview(&self) -> Result<Vec<QueueSummary>> {
        summarize_queues(self.queues.as_ref(), self.procs.as_ref()).await
    }

    async fn coordinator(&self) -> Result<&Arc<dyn Coordinator>> {
        let (Some(coordinator), Some(registry)) = (&self.coordinator, &self.registry) else {
            return Err(OrchestratorError::Unavailable(
                "no coordinator configured".to_string(),
            ));
        };

        let members = registry.get_service_members(COORDINATOR_SERVICE).await?;
        if !members.iter().any(|m| m.status == ServiceStatus::Active) {
            return Err(OrchestratorError::Unavailable(
                "no active coordinator registered".to_string(),
            ));
        }

        Ok(coordinator)
    }
}
