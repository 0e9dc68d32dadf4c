//! Queue overview

use crate::store::{ProcStore, QueueStore};
use crate::Result;
use dagrun_core::RunRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Occupancy of one queue (or process group)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    pub queued: usize,
    pub running: Vec<RunRef>,
}

/// Build a fresh overview of every known queue, sorted by name.
///
/// Queues come from the queue store and from process groups with alive
/// runs, so a group with nothing queued still shows its running runs.
pub async fn summarize_queues(
    queues: &dyn QueueStore,
    procs: &dyn ProcStore,
) -> Result<Vec<QueueSummary>> {
    let mut summaries: BTreeMap<String, QueueSummary> = BTreeMap::new();

    for name in queues.queue_list().await? {
        let queued = queues.len(&name).await?;
        summaries.insert(
            name.clone(),
            QueueSummary {
                name,
                queued,
                running: Vec::new(),
            },
        );
    }

    for (group, mut runs) in procs.list_all_alive().await? {
        runs.sort();
        let summary = summaries.entry(group.clone()).or_insert_with(|| QueueSummary {
            name: group,
            ..Default::default()
        });
        summary.running = runs;
    }

    Ok(summaries.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryProcStore, InMemoryQueueStore};
    use crate::store::QueueItem;

    #[tokio::test]
    async fn test_summary_merges_queues_and_groups() {
        let queues = InMemoryQueueStore::new();
        let procs = InMemoryProcStore::new();

        queues.push("batch", QueueItem::new(RunRef::new("etl", "q1"))).await;
        queues.push("batch", QueueItem::new(RunRef::new("report", "q2"))).await;
        procs.register("batch", RunRef::new("etl", "r1")).await;
        procs.register("adhoc", RunRef::new("adhoc", "r2")).await;

        let summaries = summarize_queues(&queues, &procs).await.unwrap();

        assert_eq!(
            summaries,
            vec![
                QueueSummary {
                    name: "adhoc".into(),
                    queued: 0,
                    running: vec![RunRef::new("adhoc", "r2")],
                },
                QueueSummary {
                    name: "batch".into(),
                    queued: 2,
                    running: vec![RunRef::new("etl", "r1")],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_overview() {
        let summaries = summarize_queues(&InMemoryQueueStore::new(), &InMemoryProcStore::new())
            .await
            .unwrap();
        assert!(summaries.is_empty());
    }
}
