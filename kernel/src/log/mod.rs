// Durable Event Log
//
// Facade over a time-partitioned, append-only event store. Writes go
// through the batched commit pipeline; reads fan out over the partitions
// that overlap the requested interval and merge by version.

use std::sync::Arc;

use tracing::trace;

use crate::config::EngineConfig;

pub mod memory;
pub mod partition;
pub mod pipeline;
pub mod store;

pub use memory::InMemoryEventLog;
pub use partition::{Partition, PartitionResolver};
pub use pipeline::{CommitOutcome, CommitPipeline, PipelineStats};
pub use store::{EventLogBackend, LogRow, RowFilter, StoreError};

/// Per-aggregate event version. Versions start at 1; 0 means "nothing applied".
pub type Version = i64;

/// A decoded, committed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<K, E> {
    pub aggregate_id: K,
    pub version: Version,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub payload: E,
}

/// Wall-clock time in milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct EventLog {
    backend: Arc<dyn EventLogBackend>,
    partitions: Arc<PartitionResolver>,
    pipeline: CommitPipeline,
}

impl EventLog {
    pub fn new(config: &EngineConfig, backend: Arc<dyn EventLogBackend>) -> Self {
        let partitions = Arc::new(PartitionResolver::new(
            config.partition.clone(),
            Arc::clone(&backend),
        ));
        let pipeline = CommitPipeline::new(
            config.pipeline.clone(),
            Arc::clone(&backend),
            Arc::clone(&partitions),
        );

        Self {
            backend,
            partitions,
            pipeline,
        }
    }

    /// Append one row through the commit pipeline and wait for its outcome.
    ///
    /// Uniqueness conflicts come back as [`CommitOutcome::Duplicate`], never
    /// as an error.
    pub async fn append(&self, row: LogRow) -> Result<CommitOutcome, StoreError> {
        self.pipeline.submit(row).await
    }

    /// Rows for `aggregate_id` with `after < version <= up_to`, ascending.
    pub async fn read_range(
        &self,
        aggregate_id: &str,
        after: Version,
        up_to: Version,
        since: Option<i64>,
    ) -> Result<Vec<LogRow>, StoreError> {
        let filter = RowFilter::Range {
            aggregate_id: aggregate_id.to_string(),
            after,
            up_to,
        };

        let mut rows = Vec::new();
        for partition in self.partitions.partitions_since(since).await? {
            rows.extend(self.backend.export(&partition, &filter).await?);
        }
        rows.sort_by_key(|row| row.version);

        trace!(aggregate_id, after, up_to, rows = rows.len(), "read event range");
        Ok(rows)
    }

    /// Up to `limit` rows of one event type with `version > after`, ascending.
    pub async fn read_by_type(
        &self,
        aggregate_id: &str,
        type_code: &str,
        after: Version,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<LogRow>, StoreError> {
        let filter = RowFilter::ByType {
            aggregate_id: aggregate_id.to_string(),
            type_code: type_code.to_string(),
            after,
            limit,
        };

        let mut rows = Vec::with_capacity(limit);
        for partition in self.partitions.partitions_since(since).await? {
            rows.extend(self.backend.export(&partition, &filter).await?);
            if rows.len() >= limit {
                break;
            }
        }
        rows.sort_by_key(|row| row.version);
        rows.truncate(limit);

        Ok(rows)
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn partitions(&self) -> &PartitionResolver {
        &self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::partition::partition_for;

    fn row(aggregate_id: &str, version: Version, type_code: &str, timestamp: i64) -> LogRow {
        LogRow {
            aggregate_id: aggregate_id.into(),
            token: String::new(),
            type_code: type_code.into(),
            payload: vec![version as u8],
            version,
            timestamp,
        }
    }

    async fn seeded(config: &EngineConfig, rows: &[LogRow]) -> (EventLog, Arc<InMemoryEventLog>) {
        let backend = Arc::new(InMemoryEventLog::new());
        for r in rows {
            let partition = partition_for(r.timestamp, &config.partition);
            backend.create_partition(&partition).await.unwrap();
            backend.insert(&partition, r).await.unwrap();
        }
        (EventLog::new(config, backend.clone()), backend)
    }

    #[tokio::test]
    async fn range_read_merges_partitions_in_version_order() {
        let config = EngineConfig::default();
        let span = config.partition.span_ms();
        let rows = vec![
            row("a", 3, "t", 2 * span + 5),
            row("a", 1, "t", 5),
            row("a", 2, "t", span + 5),
            row("b", 1, "t", 5),
        ];
        let (log, _) = seeded(&config, &rows).await;

        let read = log.read_range("a", 0, 10, None).await.unwrap();
        let versions: Vec<_> = read.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let bounded = log.read_range("a", 1, 2, None).await.unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].version, 2);
    }

    #[tokio::test]
    async fn since_time_prunes_older_partitions() {
        let config = EngineConfig::default();
        let span = config.partition.span_ms();
        let rows = vec![row("a", 1, "t", 5), row("a", 2, "t", span + 5)];
        let (log, _) = seeded(&config, &rows).await;

        let read = log.read_range("a", 0, 10, Some(span + 1)).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].version, 2);
    }

    #[tokio::test]
    async fn type_read_filters_and_limits() {
        let config = EngineConfig::default();
        let rows = vec![
            row("a", 1, "opened", 5),
            row("a", 2, "moved", 6),
            row("a", 3, "moved", 7),
            row("a", 4, "moved", 8),
        ];
        let (log, _) = seeded(&config, &rows).await;

        let read = log.read_by_type("a", "moved", 2, 1, None).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].version, 3);

        let all = log.read_by_type("a", "moved", 0, 10, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
