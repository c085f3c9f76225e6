// Snapshot Storage Abstraction
//
// One row per aggregate holding its latest materialized state.
// Not versioned history: later writes overwrite earlier ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::log::{StoreError, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub aggregate_id: String,
    pub version: Version,
    pub is_over: bool,
    pub is_latest: bool,
    /// Encoded domain state.
    pub data: Vec<u8>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRow>, StoreError>;

    /// Write the first snapshot of an aggregate.
    async fn insert(&self, row: &SnapshotRow) -> Result<(), StoreError>;

    /// Overwrite an existing snapshot.
    async fn update(&self, row: &SnapshotRow) -> Result<(), StoreError>;

    /// Flag the snapshot terminal without rewriting its state.
    async fn mark_over(&self, aggregate_id: &str) -> Result<(), StoreError>;

    async fn delete(&self, aggregate_id: &str) -> Result<(), StoreError>;
}

/// A write observed by [`InMemorySnapshotStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotWrite {
    Insert { aggregate_id: String, version: Version },
    Update { aggregate_id: String, version: Version },
    MarkOver { aggregate_id: String },
    Delete { aggregate_id: String },
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    rows: Mutex<HashMap<String, SnapshotRow>>,
    writes: Mutex<Vec<SnapshotWrite>>,
    pending_faults: AtomicUsize,
    lost_acks: AtomicUsize,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`]
    /// before touching any row.
    pub fn fail_next(&self, count: usize) {
        self.pending_faults.fetch_add(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes land and then report
    /// [`StoreError::Unavailable`], as if the reply was lost.
    pub fn lose_next_ack(&self, count: usize) {
        self.lost_acks.fetch_add(count, Ordering::SeqCst);
    }

    pub fn row(&self, aggregate_id: &str) -> Option<SnapshotRow> {
        self.rows.lock().get(aggregate_id).cloned()
    }

    /// Every write in the order it happened.
    pub fn writes(&self) -> Vec<SnapshotWrite> {
        self.writes.lock().clone()
    }

    pub fn writes_for(&self, aggregate_id: &str) -> Vec<SnapshotWrite> {
        self.writes()
            .into_iter()
            .filter(|write| match write {
                SnapshotWrite::Insert { aggregate_id: id, .. }
                | SnapshotWrite::Update { aggregate_id: id, .. }
                | SnapshotWrite::MarkOver { aggregate_id: id }
                | SnapshotWrite::Delete { aggregate_id: id } => id == aggregate_id,
            })
            .collect()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn before_write(&self) -> Result<(), StoreError> {
        if Self::take(&self.pending_faults) {
            return Err(StoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }

    fn record(&self, write: SnapshotWrite) -> Result<(), StoreError> {
        self.writes.lock().push(write);
        if Self::take(&self.lost_acks) {
            return Err(StoreError::Unavailable("write acknowledgement lost".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRow>, StoreError> {
        Ok(self.row(aggregate_id))
    }

    async fn insert(&self, row: &SnapshotRow) -> Result<(), StoreError> {
        self.before_write()?;
        {
            let mut rows = self.rows.lock();
            if rows.contains_key(&row.aggregate_id) {
                return Err(StoreError::UniqueViolation {
                    partition: "snapshots".into(),
                    key: row.aggregate_id.clone(),
                });
            }
            rows.insert(row.aggregate_id.clone(), row.clone());
        }
        self.record(SnapshotWrite::Insert {
            aggregate_id: row.aggregate_id.clone(),
            version: row.version,
        })
    }

    async fn update(&self, row: &SnapshotRow) -> Result<(), StoreError> {
        self.before_write()?;
        {
            let mut rows = self.rows.lock();
            let existing = rows
                .get_mut(&row.aggregate_id)
                .ok_or_else(|| StoreError::NotFound(row.aggregate_id.clone()))?;
            *existing = row.clone();
        }
        self.record(SnapshotWrite::Update {
            aggregate_id: row.aggregate_id.clone(),
            version: row.version,
        })
    }

    async fn mark_over(&self, aggregate_id: &str) -> Result<(), StoreError> {
        self.before_write()?;
        {
            let mut rows = self.rows.lock();
            let existing = rows
                .get_mut(aggregate_id)
                .ok_or_else(|| StoreError::NotFound(aggregate_id.to_string()))?;
            existing.is_over = true;
            existing.is_latest = true;
        }
        self.record(SnapshotWrite::MarkOver {
            aggregate_id: aggregate_id.to_string(),
        })
    }

    async fn delete(&self, aggregate_id: &str) -> Result<(), StoreError> {
        self.before_write()?;
        self.rows.lock().remove(aggregate_id);
        self.record(SnapshotWrite::Delete {
            aggregate_id: aggregate_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(version: Version) -> SnapshotRow {
        SnapshotRow {
            aggregate_id: "a".into(),
            version,
            is_over: false,
            is_latest: false,
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn insert_then_update() {
        let store = InMemorySnapshotStore::new();
        store.insert(&row(3)).await.unwrap();
        store.update(&row(6)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().version, 6);
        assert_eq!(
            store.writes(),
            vec![
                SnapshotWrite::Insert { aggregate_id: "a".into(), version: 3 },
                SnapshotWrite::Update { aggregate_id: "a".into(), version: 6 },
            ]
        );
    }

    #[tokio::test]
    async fn second_insert_conflicts() {
        let store = InMemorySnapshotStore::new();
        store.insert(&row(1)).await.unwrap();
        assert!(store.insert(&row(2)).await.unwrap_err().is_unique_violation());
    }

    #[tokio::test]
    async fn update_and_mark_over_need_a_row() {
        let store = InMemorySnapshotStore::new();
        assert!(matches!(store.update(&row(1)).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.mark_over("a").await, Err(StoreError::NotFound(_))));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn mark_over_keeps_state() {
        let store = InMemorySnapshotStore::new();
        store.insert(&row(4)).await.unwrap();
        store.mark_over("a").await.unwrap();

        let stored = store.row("a").unwrap();
        assert!(stored.is_over && stored.is_latest);
        assert_eq!(stored.version, 4);
    }

    #[tokio::test]
    async fn injected_fault_writes_nothing() {
        let store = InMemorySnapshotStore::new();
        store.fail_next(1);

        assert!(matches!(store.insert(&row(1)).await, Err(StoreError::Unavailable(_))));
        assert!(store.row("a").is_none());
        assert!(store.writes().is_empty());

        store.insert(&row(1)).await.unwrap();
        assert_eq!(store.row("a").unwrap().version, 1);
    }

    #[tokio::test]
    async fn lost_ack_still_persists() {
        let store = InMemorySnapshotStore::new();
        store.lose_next_ack(1);

        assert!(matches!(store.insert(&row(2)).await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.row("a").unwrap().version, 2);
        assert!(store.insert(&row(3)).await.unwrap_err().is_unique_violation());
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = InMemorySnapshotStore::new();
        store.insert(&row(1)).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.writes_for("a").len(), 2);
    }
}
