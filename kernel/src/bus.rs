// Broadcast Publisher
//
// Committed events are handed to a message bus for downstream followers.
// Delivery is best effort: the post-commit broadcast runs detached from
// the append and only logs its failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::log::Version;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broadcast transport failed: {0}")]
    Transport(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire wrapper around an encoded event or message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_code: String,
    pub aggregate_id: String,
    pub version: Version,
    pub bytes: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PublishError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, bytes: Vec<u8>, routing_key: &str) -> Result<(), PublishError>;
}

/// Publisher for deployments without followers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _bytes: Vec<u8>, _routing_key: &str) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Collects published messages; can be switched into a failing mode.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(routing_key, bytes)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.published()
            .iter()
            .filter_map(|(_, bytes)| Envelope::from_bytes(bytes).ok())
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, bytes: Vec<u8>, routing_key: &str) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Transport("publisher offline".into()));
        }
        self.published.lock().push((routing_key.to_string(), bytes));
        Ok(())
    }
}

/// Publish `envelope` on a detached task. Failures are logged, never returned.
///
/// The append path never awaits the returned handle.
pub fn publish_detached(
    publisher: Arc<dyn Publisher>,
    envelope: Envelope,
    routing_key: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let version = envelope.version;
        let sent = match envelope.to_bytes() {
            Ok(bytes) => publisher.publish(bytes, &routing_key).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => trace!(routing_key = %routing_key, version, "event broadcast"),
            Err(err) => error!(
                routing_key = %routing_key,
                version,
                error = %err,
                "event broadcast failed"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            type_code: "account.deposited".into(),
            aggregate_id: "a".into(),
            version: 3,
            bytes: br#"{"amount":1}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn detached_publish_delivers() {
        let publisher = Arc::new(MemoryPublisher::new());

        publish_detached(publisher.clone(), envelope(), "a".into())
            .await
            .unwrap();

        assert_eq!(publisher.envelopes(), vec![envelope()]);
        assert_eq!(publisher.published()[0].0, "a");
    }

    #[tokio::test]
    async fn detached_publish_failure_is_swallowed() {
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.set_failing(true);

        // The task completes normally; the failure only reaches the log.
        publish_detached(publisher.clone(), envelope(), "a".into())
            .await
            .unwrap();

        assert!(publisher.published().is_empty());
    }
}
