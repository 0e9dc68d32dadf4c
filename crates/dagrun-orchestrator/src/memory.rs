//! In-memory collaborators
//!
//! Process-local implementations of the store contracts, used for embedding
//! and tests. Each keeps its state behind a `tokio::sync::RwLock`.

use crate::definition::WorkflowDefinition;
use crate::store::{
    CollaboratorError, ProcStore, QueueItem, QueueStore, RunAttempt, RunFilter, RunHistoryStore,
    ServiceMember, ServiceRegistry, StoreResult,
};
use async_trait::async_trait;
use dagrun_core::{RunRef, RunStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredAttempt {
    seq: u64,
    attempt: RunAttempt,
}

/// Run history keeping every attempt, root runs and sub-runs apart
pub struct InMemoryRunHistory {
    roots: RwLock<HashMap<RunRef, Vec<StoredAttempt>>>,
    /// Sub-runs keyed by (root, sub-run ID)
    subs: RwLock<HashMap<(RunRef, String), Vec<StoredAttempt>>>,
    seq: AtomicU64,
}

impl InMemoryRunHistory {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn stored(&self, definition: WorkflowDefinition, status: RunStatus) -> StoredAttempt {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        StoredAttempt {
            seq,
            attempt: RunAttempt {
                attempt_id: format!("{}-{seq:06}", status.run.run_id),
                definition,
                status,
            },
        }
    }

    /// Record a new attempt of a root run. Retries of the same run ID append.
    pub async fn create_attempt(
        &self,
        definition: WorkflowDefinition,
        status: RunStatus,
    ) -> RunAttempt {
        let stored = self.stored(definition, status);
        let attempt = stored.attempt.clone();
        let mut roots = self.roots.write().await;
        roots.entry(attempt.status.run.clone()).or_default().push(stored);
        attempt
    }

    /// Record a new attempt of a sub-run under its root
    pub async fn create_sub_attempt(
        &self,
        definition: WorkflowDefinition,
        status: RunStatus,
    ) -> RunAttempt {
        let key = (status.root.clone(), status.run.run_id.clone());
        let stored = self.stored(definition, status);
        let attempt = stored.attempt.clone();
        let mut subs = self.subs.write().await;
        subs.entry(key).or_default().push(stored);
        attempt
    }

    /// Every attempt of a root run, oldest first
    pub async fn attempts(&self, run: &RunRef) -> Vec<RunAttempt> {
        let roots = self.roots.read().await;
        roots
            .get(run)
            .map(|list| list.iter().map(|s| s.attempt.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryRunHistory {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(what: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::NotFound(what.to_string())
}

#[async_trait]
impl RunHistoryStore for InMemoryRunHistory {
    async fn find_attempt(&self, run: &RunRef) -> StoreResult<RunAttempt> {
        let roots = self.roots.read().await;
        roots
            .get(run)
            .and_then(|list| list.last())
            .map(|s| s.attempt.clone())
            .ok_or_else(|| not_found(run))
    }

    async fn find_sub_attempt(&self, root: &RunRef, sub_run_id: &str) -> StoreResult<RunAttempt> {
        let subs = self.subs.read().await;
        subs.get(&(root.clone(), sub_run_id.to_string()))
            .and_then(|list| list.last())
            .map(|s| s.attempt.clone())
            .ok_or_else(|| not_found(format!("{root}/{sub_run_id}")))
    }

    async fn list_statuses(&self, filter: &RunFilter) -> StoreResult<Vec<RunStatus>> {
        let roots = self.roots.read().await;
        let mut latest: Vec<&StoredAttempt> = roots
            .values()
            .filter_map(|list| list.last())
            .filter(|s| filter.matches(&s.attempt.status))
            .collect();

        // Most recent first
        latest.sort_by(|a, b| b.seq.cmp(&a.seq));

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(latest
            .into_iter()
            .take(limit)
            .map(|s| s.attempt.status.clone())
            .collect())
    }

    async fn latest_attempt(&self, workflow_name: &str) -> StoreResult<RunAttempt> {
        let roots = self.roots.read().await;
        roots
            .iter()
            .filter(|(run, _)| run.workflow_name == workflow_name)
            .filter_map(|(_, list)| list.first().zip(list.last()))
            // Ordered by when the run was first submitted
            .max_by_key(|(first, _)| first.seq)
            .map(|(_, last)| last.attempt.clone())
            .ok_or_else(|| not_found(workflow_name))
    }

    async fn current_status(&self, run: &RunRef) -> StoreResult<RunStatus> {
        self.find_attempt(run).await.map(|a| a.status)
    }

    async fn update_status(&self, root: &RunRef, status: RunStatus) -> StoreResult<()> {
        if &status.run == root {
            let mut roots = self.roots.write().await;
            let latest = roots
                .get_mut(root)
                .and_then(|list| list.last_mut())
                .ok_or_else(|| not_found(root))?;
            latest.attempt.status = status;
            return Ok(());
        }

        let key = (root.clone(), status.run.run_id.clone());
        let mut subs = self.subs.write().await;
        let latest = subs
            .get_mut(&key)
            .and_then(|list| list.last_mut())
            .ok_or_else(|| not_found(format!("{root}/{}", key.1)))?;
        latest.attempt.status = status;
        Ok(())
    }
}

/// Persisted-queue stand-in; queues are keyed by process group
pub struct InMemoryQueueStore {
    queues: RwLock<BTreeMap<String, Vec<QueueItem>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn push(&self, queue: &str, item: QueueItem) {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default().push(item);
    }

    /// Remove a run from whichever queue holds it
    pub async fn remove(&self, run: &RunRef) -> bool {
        let mut queues = self.queues.write().await;
        let mut removed = false;
        for items in queues.values_mut() {
            let before = items.len();
            items.retain(|item| &item.run != run);
            removed |= items.len() != before;
        }
        removed
    }

    /// Take the oldest item of a queue
    pub async fn pop(&self, queue: &str) -> Option<QueueItem> {
        let mut queues = self.queues.write().await;
        let items = queues.get_mut(queue)?;
        if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn list_by_workflow(&self, group: &str, workflow_name: &str) -> StoreResult<Vec<QueueItem>> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(group)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.run.workflow_name == workflow_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn len(&self, queue_name: &str) -> StoreResult<usize> {
        let queues = self.queues.read().await;
        Ok(queues.get(queue_name).map(Vec::len).unwrap_or(0))
    }

    async fn queue_list(&self) -> StoreResult<Vec<String>> {
        let queues = self.queues.read().await;
        Ok(queues.keys().cloned().collect())
    }
}

/// Liveness registry of executor processes, keyed by process group
pub struct InMemoryProcStore {
    alive: RwLock<HashMap<String, Vec<RunRef>>>,
}

impl InMemoryProcStore {
    pub fn new() -> Self {
        Self {
            alive: RwLock::new(HashMap::new()),
        }
    }

    /// Mark a run's executor as heartbeating
    pub async fn register(&self, group: &str, run: RunRef) {
        let mut alive = self.alive.write().await;
        let runs = alive.entry(group.to_string()).or_default();
        if !runs.contains(&run) {
            runs.push(run);
        }
    }

    pub async fn unregister(&self, group: &str, run: &RunRef) {
        let mut alive = self.alive.write().await;
        if let Some(runs) = alive.get_mut(group) {
            runs.retain(|r| r != run);
            if runs.is_empty() {
                alive.remove(group);
            }
        }
    }
}

impl Default for InMemoryProcStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcStore for InMemoryProcStore {
    async fn count_alive_by_workflow(&self, group: &str, workflow_name: &str) -> StoreResult<usize> {
        let alive = self.alive.read().await;
        Ok(alive
            .get(group)
            .map(|runs| runs.iter().filter(|r| r.workflow_name == workflow_name).count())
            .unwrap_or(0))
    }

    async fn list_all_alive(&self) -> StoreResult<HashMap<String, Vec<RunRef>>> {
        let alive = self.alive.read().await;
        Ok(alive.clone())
    }
}

/// Static service membership
pub struct InMemoryServiceRegistry {
    members: RwLock<HashMap<String, Vec<ServiceMember>>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, service_name: &str, member: ServiceMember) {
        let mut members = self.members.write().await;
        let list = members.entry(service_name.to_string()).or_default();
        list.retain(|m| m.id != member.id);
        list.push(member);
    }
}

impl Default for InMemoryServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn get_service_members(&self, service_name: &str) -> StoreResult<Vec<ServiceMember>> {
        let members = self.members.read().await;
        Ok(members.get(service_name).cloned().unwrap_or_default())
    }
}
