// Event Log Storage Abstraction
//
// Defines the durability contract for the partitioned event log.
// Implementations may persist to a relational engine, object storage, etc.

use async_trait::async_trait;

use super::partition::Partition;
use super::Version;

/// One persisted event row.
///
/// Uniqueness is enforced on `(aggregate_id, version)` and, when `token` is
/// non-empty, on `(aggregate_id, token)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub aggregate_id: String,
    /// Idempotency token; empty means no dedup was requested.
    pub token: String,
    pub type_code: String,
    pub payload: Vec<u8>,
    pub version: Version,
    pub timestamp: i64,
}

/// Row selection pushed down to a partition export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `after < version <= up_to`.
    Range {
        aggregate_id: String,
        after: Version,
        up_to: Version,
    },
    /// `version > after` of a single type, at most `limit` rows.
    ByType {
        aggregate_id: String,
        type_code: String,
        after: Version,
        limit: usize,
    },
}

impl RowFilter {
    pub fn matches(&self, row: &LogRow) -> bool {
        match self {
            RowFilter::Range {
                aggregate_id,
                after,
                up_to,
            } => row.aggregate_id == *aggregate_id && row.version > *after && row.version <= *up_to,
            RowFilter::ByType {
                aggregate_id,
                type_code,
                after,
                ..
            } => {
                row.aggregate_id == *aggregate_id
                    && row.type_code == *type_code
                    && row.version > *after
            }
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            RowFilter::Range { .. } => None,
            RowFilter::ByType { limit, .. } => Some(*limit),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique key {key} already exists in {partition}")]
    UniqueViolation { partition: String, key: String },

    #[error("partition `{0}` does not exist")]
    MissingPartition(String),

    #[error("row `{0}` does not exist")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("commit pipeline dropped the request")]
    PipelineClosed,
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Storage backend for the event log.
///
/// Properties required from implementations:
/// - Append-only
/// - Unique `(aggregate_id, version)` and non-empty `(aggregate_id, token)`
/// - `bulk_load` is all-or-nothing: a rejected load leaves no rows behind
/// - `create_partition` is idempotent
#[async_trait]
pub trait EventLogBackend: Send + Sync {
    async fn create_partition(&self, partition: &Partition) -> Result<(), StoreError>;

    async fn list_partitions(&self) -> Result<Vec<Partition>, StoreError>;

    /// Insert a single row.
    async fn insert(&self, partition: &Partition, row: &LogRow) -> Result<(), StoreError>;

    /// Binary bulk load of many rows into one partition.
    async fn bulk_load(&self, partition: &Partition, rows: &[LogRow]) -> Result<(), StoreError>;

    /// Stream out the rows of one partition matching `filter`, ascending by version.
    async fn export(&self, partition: &Partition, filter: &RowFilter)
        -> Result<Vec<LogRow>, StoreError>;
}
