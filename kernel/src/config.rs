// Engine Configuration
//
// Tunables for recovery paging, snapshot cadence, the commit pipeline
// and log partitioning. Loaded from JSON; every field has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether this process may persist snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageRole {
    #[default]
    Master,
    /// Read-only replica: snapshot saves are skipped.
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wait between drain rounds to let concurrent appends join the batch.
    pub debounce_ms: u64,
    /// Extra drain rounds merged into one batch after the first.
    pub max_extra_rounds: usize,
    /// Smallest batch committed with a bulk load. Batches of one always use
    /// a single-row insert.
    pub bulk_threshold: usize,
}

impl PipelineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 10,
            max_extra_rounds: 5,
            bulk_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub table_prefix: String,
    /// Width of one time bucket.
    pub span_days: u32,
}

impl PartitionConfig {
    pub fn span_ms(&self) -> i64 {
        i64::from(self.span_days.max(1)) * 24 * 60 * 60 * 1000
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            table_prefix: "events".into(),
            span_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Versions between interval snapshots.
    pub snapshot_interval: i64,
    /// Minimum unsnapshotted versions that make deactivation save a snapshot.
    pub min_snapshot_interval: i64,
    /// Recovery page size.
    pub events_per_read: usize,
    pub role: StorageRole,
    /// Publish committed events to the broadcast collaborator.
    pub broadcast: bool,
    pub pipeline: PipelineConfig,
    pub partition: PartitionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 500,
            min_snapshot_interval: 1,
            events_per_read: 2000,
            role: StorageRole::Master,
            broadcast: true,
            pipeline: PipelineConfig::default(),
            partition: PartitionConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl EngineConfig {
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events_per_read == 0 {
            return Err(ConfigError::Invalid("events_per_read must be positive".into()));
        }
        if self.snapshot_interval < 1 {
            return Err(ConfigError::Invalid("snapshot_interval must be positive".into()));
        }
        if self.min_snapshot_interval < 0 {
            return Err(ConfigError::Invalid(
                "min_snapshot_interval must not be negative".into(),
            ));
        }
        if self.pipeline.bulk_threshold == 0 {
            return Err(ConfigError::Invalid("bulk_threshold must be positive".into()));
        }
        if self.partition.span_days == 0 {
            return Err(ConfigError::Invalid("partition span_days must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "snapshot_interval": 3, "role": "follower", "pipeline": { "debounce_ms": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.snapshot_interval, 3);
        assert_eq!(config.role, StorageRole::Follower);
        assert_eq!(config.pipeline.debounce(), Duration::ZERO);
        assert_eq!(config.pipeline.max_extra_rounds, 5);
        assert_eq!(config.events_per_read, 2000);
        assert_eq!(config.partition.table_prefix, "events");
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "events_per_read": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_role_is_a_parse_error() {
        let err = EngineConfig::from_json_str(r#"{ "role": "leader" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "partition": {{ "span_days": 7 }} }}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.partition.span_ms(), 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
