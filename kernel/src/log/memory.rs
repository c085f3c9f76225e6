// In-Memory Event Log Backend
//
// Reference implementation of `EventLogBackend` with the same uniqueness
// and all-or-nothing bulk load behavior a relational engine provides.
// Uniqueness holds across every partition for the lifetime of the log.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::partition::Partition;
use super::store::{EventLogBackend, LogRow, RowFilter, StoreError};
use super::Version;

#[derive(Default)]
struct Segments {
    partitions: BTreeMap<String, Segment>,
    versions: HashSet<(String, Version)>,
    tokens: HashSet<(String, String)>,
}

struct Segment {
    partition: Partition,
    rows: Vec<LogRow>,
}

impl Segments {
    fn segment_mut(&mut self, partition: &Partition) -> Result<&mut Segment, StoreError> {
        self.partitions
            .get_mut(&partition.name)
            .ok_or_else(|| StoreError::MissingPartition(partition.name.clone()))
    }

    fn check_unique(&self, partition: &Partition, row: &LogRow) -> Result<(), StoreError> {
        if self
            .versions
            .contains(&(row.aggregate_id.clone(), row.version))
        {
            return Err(StoreError::UniqueViolation {
                partition: partition.name.clone(),
                key: format!("({}, version {})", row.aggregate_id, row.version),
            });
        }
        if !row.token.is_empty()
            && self
                .tokens
                .contains(&(row.aggregate_id.clone(), row.token.clone()))
        {
            return Err(StoreError::UniqueViolation {
                partition: partition.name.clone(),
                key: format!("({}, token {})", row.aggregate_id, row.token),
            });
        }
        Ok(())
    }

    fn index(&mut self, row: &LogRow) {
        self.versions.insert((row.aggregate_id.clone(), row.version));
        if !row.token.is_empty() {
            self.tokens
                .insert((row.aggregate_id.clone(), row.token.clone()));
        }
    }
}

#[derive(Default)]
pub struct InMemoryEventLog {
    segments: Mutex<Segments>,
    pending_faults: AtomicUsize,
    inserts: AtomicUsize,
    bulk_loads: AtomicUsize,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` row operations (insert, bulk load, export) fail
    /// with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.pending_faults.fetch_add(count, Ordering::SeqCst);
    }

    /// Every stored row, ordered by partition then insertion.
    pub fn rows(&self) -> Vec<LogRow> {
        self.segments
            .lock()
            .partitions
            .values()
            .flat_map(|segment| segment.rows.iter().cloned())
            .collect()
    }

    pub fn rows_for(&self, aggregate_id: &str) -> Vec<LogRow> {
        let mut rows: Vec<_> = self
            .rows()
            .into_iter()
            .filter(|row| row.aggregate_id == aggregate_id)
            .collect();
        rows.sort_by_key(|row| row.version);
        rows
    }

    pub fn row_count(&self) -> usize {
        self.segments
            .lock()
            .partitions
            .values()
            .map(|segment| segment.rows.len())
            .sum()
    }

    /// Number of accepted single-row inserts.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Number of accepted bulk loads.
    pub fn bulk_loads(&self) -> usize {
        self.bulk_loads.load(Ordering::SeqCst)
    }

    fn take_fault(&self) -> Result<(), StoreError> {
        let injected = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventLogBackend for InMemoryEventLog {
    async fn create_partition(&self, partition: &Partition) -> Result<(), StoreError> {
        self.segments
            .lock()
            .partitions
            .entry(partition.name.clone())
            .or_insert_with(|| Segment {
                partition: partition.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        Ok(self
            .segments
            .lock()
            .partitions
            .values()
            .map(|segment| segment.partition.clone())
            .collect())
    }

    async fn insert(&self, partition: &Partition, row: &LogRow) -> Result<(), StoreError> {
        self.take_fault()?;
        let mut segments = self.segments.lock();
        segments.segment_mut(partition)?;
        segments.check_unique(partition, row)?;
        segments.index(row);
        segments.segment_mut(partition)?.rows.push(row.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_load(&self, partition: &Partition, rows: &[LogRow]) -> Result<(), StoreError> {
        self.take_fault()?;
        let mut segments = self.segments.lock();
        segments.segment_mut(partition)?;

        // Validate the whole load, including conflicts inside the load itself,
        // before touching any state.
        let mut versions = HashSet::with_capacity(rows.len());
        let mut tokens = HashSet::new();
        for row in rows {
            segments.check_unique(partition, row)?;
            let fresh_version = versions.insert((row.aggregate_id.as_str(), row.version));
            let fresh_token = row.token.is_empty()
                || tokens.insert((row.aggregate_id.as_str(), row.token.as_str()));
            if !fresh_version || !fresh_token {
                return Err(StoreError::UniqueViolation {
                    partition: partition.name.clone(),
                    key: format!("({}, version {})", row.aggregate_id, row.version),
                });
            }
        }

        for row in rows {
            segments.index(row);
        }
        segments
            .segment_mut(partition)?
            .rows
            .extend(rows.iter().cloned());
        self.bulk_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn export(
        &self,
        partition: &Partition,
        filter: &RowFilter,
    ) -> Result<Vec<LogRow>, StoreError> {
        self.take_fault()?;
        let mut segments = self.segments.lock();
        let segment = segments.segment_mut(partition)?;

        let mut rows: Vec<_> = segment
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.version);
        if let Some(limit) = filter.limit() {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(name: &str) -> Partition {
        Partition {
            start_ms: 0,
            end_ms: 1_000,
            name: name.into(),
        }
    }

    fn row(aggregate_id: &str, version: Version, token: &str) -> LogRow {
        LogRow {
            aggregate_id: aggregate_id.into(),
            token: token.into(),
            type_code: "test".into(),
            payload: vec![],
            version,
            timestamp: 0,
        }
    }

    async fn backend() -> InMemoryEventLog {
        let log = InMemoryEventLog::new();
        log.create_partition(&partition("p0")).await.unwrap();
        log
    }

    #[tokio::test]
    async fn rejects_duplicate_version() {
        let log = backend().await;
        log.insert(&partition("p0"), &row("a", 1, "")).await.unwrap();

        let err = log
            .insert(&partition("p0"), &row("a", 1, ""))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        // Same version on another aggregate is fine.
        log.insert(&partition("p0"), &row("b", 1, "")).await.unwrap();
        assert_eq!(log.row_count(), 2);
    }

    #[tokio::test]
    async fn token_uniqueness_spans_partitions() {
        let log = backend().await;
        log.create_partition(&partition("p1")).await.unwrap();
        log.insert(&partition("p0"), &row("a", 1, "t-1"))
            .await
            .unwrap();

        let err = log
            .insert(&partition("p1"), &row("a", 2, "t-1"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn empty_tokens_never_conflict() {
        let log = backend().await;
        log.insert(&partition("p0"), &row("a", 1, "")).await.unwrap();
        log.insert(&partition("p0"), &row("a", 2, "")).await.unwrap();
        assert_eq!(log.row_count(), 2);
    }

    #[tokio::test]
    async fn rejected_bulk_load_leaves_nothing_behind() {
        let log = backend().await;
        log.insert(&partition("p0"), &row("a", 2, "")).await.unwrap();

        let err = log
            .bulk_load(
                &partition("p0"),
                &[row("a", 1, ""), row("a", 2, ""), row("b", 1, "")],
            )
            .await
            .unwrap_err();

        assert!(err.is_unique_violation());
        assert_eq!(log.row_count(), 1);
        assert_eq!(log.bulk_loads(), 0);

        // Keys from the rejected load were not indexed.
        log.insert(&partition("p0"), &row("b", 1, "")).await.unwrap();
    }

    #[tokio::test]
    async fn bulk_load_detects_conflicts_within_itself() {
        let log = backend().await;
        let err = log
            .bulk_load(&partition("p0"), &[row("a", 1, "x"), row("a", 2, "x")])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(log.row_count(), 0);
    }

    #[tokio::test]
    async fn missing_partition_is_reported() {
        let log = InMemoryEventLog::new();
        let err = log
            .insert(&partition("nope"), &row("a", 1, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingPartition(name) if name == "nope"));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let log = backend().await;
        log.fail_next(1);

        let err = log
            .insert(&partition("p0"), &row("a", 1, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        log.insert(&partition("p0"), &row("a", 1, "")).await.unwrap();
        assert_eq!(log.inserts(), 1);
    }
}
