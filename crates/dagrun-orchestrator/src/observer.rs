//! Run observation
//!
//! Runs execute out of process, so the only signal the orchestrator gets is
//! the run-history store. These loops poll it with fixed or growing
//! intervals, bounded by a timeout and interruptible through a
//! [`CancellationToken`]. Cancelling a wait never touches the run itself.

use crate::store::RunHistoryStore;
use dagrun_core::{PollingConfig, RunRef, RunState, RunStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll intervals growing geometrically up to a cap
#[derive(Debug, Clone)]
pub struct PollBackoff {
    current: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl PollBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            multiplier: multiplier.max(1.0),
            max,
            attempt: 0,
        }
    }

    /// Constant interval
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, 1.0, interval)
    }

    /// The adaptive schedule used while waiting for a run to settle
    pub fn for_sync_wait(config: &PollingConfig) -> Self {
        Self::new(
            config.sync_initial_interval(),
            config.sync_backoff_multiplier,
            config.sync_max_interval(),
        )
    }

    /// Get the next delay and grow the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        let grown = (self.current.as_nanos() as f64 * self.multiplier).round() as u64;
        self.current = Duration::from_nanos(grown).min(self.max);
        delay
    }

    /// Number of delays handed out so far
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for PollBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}

/// Result of a start or enqueue confirmation loop
#[derive(Debug, Clone)]
pub enum Confirmation {
    /// The run left `NotStarted`
    Confirmed(RunStatus),
    /// Timed out. `last` is the last status read and `last_error` the most
    /// recent read failure, if any.
    TimedOut {
        last: Option<RunStatus>,
        last_error: Option<String>,
    },
    Cancelled,
}

/// Result of waiting for a run to finish or pause
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// Terminal, or waiting for approval
    Settled(RunStatus),
    DeadlineExceeded(Option<RunStatus>),
    Cancelled(Option<RunStatus>),
}

enum PollResult {
    Matched(RunStatus),
    TimedOut(Option<RunStatus>, Option<String>),
    Cancelled(Option<RunStatus>),
}

#[derive(Clone)]
pub struct RunObserver {
    history: Arc<dyn RunHistoryStore>,
    config: PollingConfig,
}

impl RunObserver {
    pub fn new(history: Arc<dyn RunHistoryStore>, config: PollingConfig) -> Self {
        Self { history, config }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Wait until the executor has picked the run up
    pub async fn await_start(&self, run: &RunRef, cancel: &CancellationToken) -> Confirmation {
        self.confirm(run, self.config.start_timeout(), cancel).await
    }

    /// Wait until the run reached the queue (or beyond)
    pub async fn await_enqueue(&self, run: &RunRef, cancel: &CancellationToken) -> Confirmation {
        self.confirm(run, self.config.enqueue_timeout(), cancel).await
    }

    async fn confirm(
        &self,
        run: &RunRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Confirmation {
        let backoff = PollBackoff::fixed(self.config.start_poll_interval());
        match self
            .poll_until(run, timeout, backoff, cancel, |s| s.state != RunState::NotStarted)
            .await
        {
            PollResult::Matched(status) => Confirmation::Confirmed(status),
            PollResult::TimedOut(last, last_error) => Confirmation::TimedOut { last, last_error },
            PollResult::Cancelled(_) => Confirmation::Cancelled,
        }
    }

    /// Wait until the run is no longer active or is waiting for approval.
    ///
    /// Read errors are logged and polling continues.
    pub async fn wait_for_terminal_or_waiting(
        &self,
        run: &RunRef,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let backoff = PollBackoff::for_sync_wait(&self.config);
        match self
            .poll_until(run, deadline, backoff, cancel, |s| {
                !s.state.is_active() || s.state.is_waiting()
            })
            .await
        {
            PollResult::Matched(status) => WaitOutcome::Settled(status),
            PollResult::TimedOut(last, _) => WaitOutcome::DeadlineExceeded(last),
            PollResult::Cancelled(last) => WaitOutcome::Cancelled(last),
        }
    }

    async fn poll_until<F>(
        &self,
        run: &RunRef,
        timeout: Duration,
        mut backoff: PollBackoff,
        cancel: &CancellationToken,
        done: F,
    ) -> PollResult
    where
        F: Fn(&RunStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut last = None;
        let mut last_error = None;
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return PollResult::Cancelled(last);
            }

            match self.history.current_status(run).await {
                Ok(status) => {
                    debug!(run = %run, state = %status.state, "Polled run status");
                    if done(&status) {
                        return PollResult::Matched(status);
                    }
                    last = Some(status);
                }
                Err(err) => {
                    failures += 1;
                    // The record may legitimately not exist on the first read
                    if failures == 1 {
                        debug!(run = %run, error = %err, "Run status not readable yet");
                    } else {
                        warn!(run = %run, error = %err, failures, "Run status still not readable");
                    }
                    last_error = Some(err.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PollResult::TimedOut(last, last_error);
            }

            let delay = backoff.next_delay().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return PollResult::Cancelled(last),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{StepDefinition, WorkflowDefinition};
    use crate::memory::InMemoryRunHistory;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("etl").with_step(StepDefinition::new("extract"))
    }

    async fn seeded(state: RunState) -> (RunObserver, Arc<InMemoryRunHistory>, RunRef) {
        let history = Arc::new(InMemoryRunHistory::new());
        let run = RunRef::new("etl", "r1");
        history
            .create_attempt(definition(), RunStatus::new(run.clone()).with_state(state))
            .await;
        let observer = RunObserver::new(history.clone(), PollingConfig::default());
        (observer, history, run)
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let delays: Vec<_> = PollBackoff::new(
            Duration::from_millis(100),
            1.5,
            Duration::from_millis(300),
        )
        .take(5)
        .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(225),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_fixed_backoff() {
        let mut backoff = PollBackoff::fixed(Duration::from_millis(100));
        for _ in 0..4 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        }
        assert_eq!(backoff.current_attempt(), 4);
    }

    #[test]
    fn test_sync_backoff_from_config() {
        let delays: Vec<_> = PollBackoff::for_sync_wait(&PollingConfig::default())
            .take(10)
            .collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(150));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
        assert_eq!(delays[9], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_start_confirms_after_transition() {
        let (observer, history, run) = seeded(RunState::NotStarted).await;

        let writer = history.clone();
        let target = run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            let status = RunStatus::new(target.clone()).with_state(RunState::Running);
            writer.update_status(&target, status).await.unwrap();
        });

        let started = Instant::now();
        let outcome = observer.await_start(&run, &CancellationToken::new()).await;

        assert!(matches!(outcome, Confirmation::Confirmed(ref s) if s.state == RunState::Running));
        assert!(started.elapsed() >= Duration::from_millis(350));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_start_times_out() {
        let (observer, _, run) = seeded(RunState::NotStarted).await;

        let started = Instant::now();
        let outcome = observer.await_start(&run, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            Confirmation::TimedOut { last: Some(ref s), last_error: None } if s.state == RunState::NotStarted
        ));
        let timeout = observer.config().start_timeout();
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_enqueue_tolerates_missing_record() {
        let history = Arc::new(InMemoryRunHistory::new());
        let observer = RunObserver::new(history, PollingConfig::default());

        let outcome = observer
            .await_enqueue(&RunRef::new("etl", "ghost"), &CancellationToken::new())
            .await;

        match outcome {
            Confirmation::TimedOut { last, last_error } => {
                assert!(last.is_none());
                // The read failure behind the timeout is kept
                assert!(last_error.is_some_and(|e| e.contains("ghost")));
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_settles_on_waiting() {
        let (observer, _, run) = seeded(RunState::Waiting).await;

        let outcome = observer
            .wait_for_terminal_or_waiting(&run, Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, WaitOutcome::Settled(ref s) if s.state == RunState::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_returns_last_status() {
        let (observer, _, run) = seeded(RunState::Running).await;

        let outcome = observer
            .wait_for_terminal_or_waiting(&run, Duration::from_secs(3), &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            WaitOutcome::DeadlineExceeded(Some(ref s)) if s.state == RunState::Running
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancellation() {
        let (observer, history, run) = seeded(RunState::Running).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let outcome = observer
            .wait_for_terminal_or_waiting(&run, Duration::from_secs(60), &cancel)
            .await;

        assert!(matches!(outcome, WaitOutcome::Cancelled(Some(_))));
        // The run itself is untouched
        assert_eq!(
            history.current_status(&run).await.unwrap().state,
            RunState::Running
        );
    }
}
