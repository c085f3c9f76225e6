// Partition Resolver
//
// Maps event timestamps onto fixed-width time buckets. Each bucket is a
// physical segment of the log; segments are created lazily on first write
// and cached afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::store::{EventLogBackend, StoreError};
use crate::config::PartitionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    /// Inclusive lower bound, ms since epoch.
    pub start_ms: i64,
    /// Exclusive upper bound, ms since epoch.
    pub end_ms: i64,
    pub name: String,
}

impl Partition {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }

    /// Whether this partition can hold rows written at or after `since`.
    pub fn overlaps_since(&self, since: Option<i64>) -> bool {
        since.map_or(true, |since| self.end_ms > since)
    }
}

/// Start of the bucket containing `timestamp_ms`.
pub fn bucket_start(timestamp_ms: i64, span_ms: i64) -> i64 {
    timestamp_ms.div_euclid(span_ms) * span_ms
}

/// The partition a row written at `timestamp_ms` belongs to.
pub fn partition_for(timestamp_ms: i64, config: &PartitionConfig) -> Partition {
    let span = config.span_ms();
    let start_ms = bucket_start(timestamp_ms, span);
    let name = match Utc.timestamp_millis_opt(start_ms).single() {
        Some(start) => format!("{}_{}", config.table_prefix, start.format("%Y%m%d")),
        None => format!("{}_{}", config.table_prefix, start_ms),
    };

    Partition {
        start_ms,
        end_ms: start_ms + span,
        name,
    }
}

pub struct PartitionResolver {
    config: PartitionConfig,
    backend: Arc<dyn EventLogBackend>,
    known: RwLock<BTreeMap<i64, Partition>>,
}

impl PartitionResolver {
    pub fn new(config: PartitionConfig, backend: Arc<dyn EventLogBackend>) -> Self {
        Self {
            config,
            backend,
            known: RwLock::new(BTreeMap::new()),
        }
    }

    /// Resolve the partition for `timestamp_ms`, creating it on first use.
    pub async fn resolve(&self, timestamp_ms: i64) -> Result<Partition, StoreError> {
        let start = bucket_start(timestamp_ms, self.config.span_ms());
        let cached = self.known.read().get(&start).cloned();
        if let Some(partition) = cached {
            return Ok(partition);
        }

        let partition = partition_for(timestamp_ms, &self.config);
        self.backend.create_partition(&partition).await?;
        self.known.write().insert(start, partition.clone());

        debug!(partition = %partition.name, "materialized log partition");
        Ok(partition)
    }

    /// All partitions that may hold rows written at or after `since`, oldest first.
    pub async fn partitions_since(&self, since: Option<i64>) -> Result<Vec<Partition>, StoreError> {
        let listed = self.backend.list_partitions().await?;
        {
            let mut known = self.known.write();
            for partition in &listed {
                known
                    .entry(partition.start_ms)
                    .or_insert_with(|| partition.clone());
            }
        }

        let mut partitions: Vec<_> = listed
            .into_iter()
            .filter(|partition| partition.overlaps_since(since))
            .collect();
        partitions.sort();
        Ok(partitions)
    }

    pub fn cached(&self) -> usize {
        self.known.read().len()
    }
}
