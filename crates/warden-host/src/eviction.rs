//! Retain-most-recent eviction over an external record store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WardenError;

/// A cached record the store is willing to evict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionCandidate {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub last_activity_ms: u64,
}

/// Storage whose records can be listed and deleted. Record lifecycle stays
/// with the store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<EvictionCandidate>, WardenError>;

    async fn delete(&self, id: &str) -> Result<(), WardenError>;
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub deleted: Vec<String>,
    /// Records whose deletion failed, with the reason.
    pub failed: Vec<(String, String)>,
    pub retained: usize,
}

/// Keep the `retain` most recently active records and delete the rest,
/// one at a time. A failed delete is logged and skipped.
pub async fn evict_stale_records(
    store: &dyn RecordStore,
    retain: usize,
) -> Result<EvictionReport, WardenError> {
    let mut records = store.list_all().await?;
    records.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));

    let stale = if records.len() > retain {
        records.split_off(retain)
    } else {
        Vec::new()
    };

    let mut report = EvictionReport {
        retained: records.len(),
        ..EvictionReport::default()
    };

    for record in stale {
        match store.delete(&record.id).await {
            Ok(()) => {
                debug!("Evicted record {}", record.id);
                report.deleted.push(record.id);
            }
            Err(e) => {
                warn!("Failed to evict record {}: {}", record.id, e);
                report.failed.push((record.id, e.to_string()));
            }
        }
    }

    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn test_keeps_most_recent() {
        let store = MemoryStore::with_records(15);
        let report = evict_stale_records(&store, 10).await.unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["r0", "r1", "r2", "r3", "r4"]);
        assert_eq!(report.retained, 10);
        assert!(report.failed.is_empty());

        let expected: Vec<String> = {
            let mut ids: Vec<_> = (5..15).map(|i| format!("r{i}")).collect();
            ids.sort();
            ids
        };
        assert_eq!(store.ids(), expected);
    }

    #[tokio::test]
    async fn test_unsorted_input() {
        let store = MemoryStore::with_records(4);
        store.records.lock().unwrap().reverse();
        let report = evict_stale_records(&store, 2).await.unwrap();

        let mut deleted = report.deleted;
        deleted.sort();
        assert_eq!(deleted, vec!["r0", "r1"]);
    }

    #[tokio::test]
    async fn test_nothing_to_evict() {
        let store = MemoryStore::with_records(3);
        let report = evict_stale_records(&store, 10).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.retained, 3);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_batch() {
        let mut store = MemoryStore::with_records(6);
        store.failing.insert("r1".to_string());

        let report = evict_stale_records(&store, 3).await.unwrap();
        let mut deleted = report.deleted;
        deleted.sort();
        assert_eq!(deleted, vec!["r0", "r2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "r1");
        assert_eq!(store.ids(), vec!["r1", "r3", "r4", "r5"]);
    }

    #[tokio::test]
    async fn test_list_failure_propagates() {
        let store = MemoryStore {
            unavailable: true,
            ..MemoryStore::default()
        };
        let err = evict_stale_records(&store, 10).await.unwrap_err();
        assert!(matches!(err, WardenError::Store(_)));
    }
}
