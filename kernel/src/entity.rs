// Aggregate Entity
//
// The append protocol and lifecycle hooks for one activated aggregate.
// The host runtime guarantees a single writer per identity and proves it
// by handing over a `WriterLease`; nothing here locks per identity.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, trace};

use crate::bus::{publish_detached, Envelope, PublishError, Publisher};
use crate::codec::{EventCodec, EventPayload};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::log::{now_millis, CommitOutcome, Event, EventLog, LogRow, Version};
use crate::replay::{recover, Recovered};
use crate::snapshot::{SnapshotManager, SnapshotStore};
use crate::state::{Aggregate, AggregateState};

/// Proof that the caller is the only writer for an identity.
///
/// Held by an [`Entity`] for as long as it lives.
pub trait WriterLease: Send + Sync {
    fn covers(&self, aggregate_id: &str) -> bool;
}

/// Caller-supplied dedup key. An empty `uid` requests no dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyToken {
    pub uid: String,
    /// Event timestamp used for every retry carrying this token.
    pub timestamp: i64,
}

impl IdempotencyToken {
    pub fn new(uid: impl Into<String>) -> Self {
        Self::with_timestamp(uid, now_millis())
    }

    pub fn with_timestamp(uid: impl Into<String>, timestamp: i64) -> Self {
        Self {
            uid: uid.into(),
            timestamp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uid.is_empty()
    }
}

/// Shared collaborators for every entity of one aggregate type.
pub struct Engine<A: Aggregate> {
    config: Arc<EngineConfig>,
    log: Arc<EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    publisher: Arc<dyn Publisher>,
    codec: Arc<EventCodec<A::Event>>,
}

impl<A: Aggregate> Clone for Engine<A> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            log: Arc::clone(&self.log),
            snapshots: Arc::clone(&self.snapshots),
            publisher: Arc::clone(&self.publisher),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<A: Aggregate> Engine<A> {
    pub fn new(
        config: EngineConfig,
        log: Arc<EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
        publisher: Arc<dyn Publisher>,
        codec: Arc<EventCodec<A::Event>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            log,
            snapshots,
            publisher,
            codec,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Bring an aggregate into memory: check the lease, then recover.
    pub async fn activate(&self, id: A::Id, lease: Box<dyn WriterLease>) -> Result<Entity<A>> {
        let key = id.to_string();
        if !lease.covers(&key) {
            return Err(EngineError::LeaseMismatch(key));
        }

        let mut entity = Entity {
            engine: self.clone(),
            state: AggregateState::new(id.clone()),
            id,
            key,
            snapshots: SnapshotManager::new(&self.config),
            needs_recovery: true,
            _lease: lease,
        };
        entity.recover().await?;
        trace!(aggregate_id = %entity.key, version = entity.state.version(), "aggregate activated");
        Ok(entity)
    }
}

pub struct Entity<A: Aggregate> {
    engine: Engine<A>,
    id: A::Id,
    key: String,
    state: AggregateState<A>,
    snapshots: SnapshotManager,
    /// Set when in-memory state may disagree with the log.
    needs_recovery: bool,
    _lease: Box<dyn WriterLease>,
}

impl<A: Aggregate> Entity<A> {
    pub fn id(&self) -> &A::Id {
        &self.id
    }

    pub fn state(&self) -> &AggregateState<A> {
        &self.state
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Discard in-memory state and rebuild it from the snapshot and the log.
    pub async fn recover(&mut self) -> Result<Recovered<A>> {
        let recovered = recover::<A>(
            &self.id,
            self.engine.snapshots.as_ref(),
            &self.engine.log,
            &self.engine.codec,
            self.engine.config.events_per_read,
        )
        .await;

        match recovered {
            Ok(recovered) => {
                self.state = recovered.state.clone();
                self.snapshots.restore(recovered.snapshot_version);
                self.needs_recovery = false;
                Ok(recovered)
            }
            Err(err) => {
                self.needs_recovery = true;
                Err(err)
            }
        }
    }

    async fn ensure_recovered(&mut self) -> Result<()> {
        if self.needs_recovery {
            self.recover().await?;
        }
        Ok(())
    }

    /// Append one event.
    ///
    /// Returns `true` when the event was committed and applied, `false` when
    /// the log already held its version or token.
    pub async fn raise(
        &mut self,
        payload: A::Event,
        token: Option<IdempotencyToken>,
    ) -> Result<bool> {
        self.ensure_recovered().await?;
        self.state.base.ensure_live()?;

        let token = token.filter(|token| !token.is_empty());
        let version = self.state.base.increment_doing_version()?;
        let timestamp = token.as_ref().map_or_else(now_millis, |token| token.timestamp);

        let bytes = match self.engine.codec.encode(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.state.base.decrement_doing_version();
                return Err(err.into());
            }
        };

        let type_code = payload.type_code();
        let row = LogRow {
            aggregate_id: self.key.clone(),
            token: token.map(|token| token.uid).unwrap_or_default(),
            type_code: type_code.to_string(),
            payload: bytes,
            version,
            timestamp,
        };
        let broadcast = self.engine.config.broadcast.then(|| Envelope {
            type_code: type_code.to_string(),
            aggregate_id: self.key.clone(),
            version,
            bytes: row.payload.clone(),
        });

        let outcome = match self.engine.log.append(row).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.discard(err.into()).await),
        };

        match outcome {
            CommitOutcome::Duplicate => {
                info!(aggregate_id = %self.key, version, "event ignored as duplicate");
                self.state.base.decrement_doing_version();
                Ok(false)
            }
            CommitOutcome::Committed => {
                let event = Event {
                    aggregate_id: self.id.clone(),
                    version,
                    timestamp,
                    payload,
                };
                self.state.data.apply(&event);

                if let Some(envelope) = broadcast {
                    let publisher = Arc::clone(&self.engine.publisher);
                    publish_detached(publisher, envelope, self.key.clone());
                }

                if let Err(err) = self.state.base.update_version(version) {
                    return Err(self.discard(err.into()).await);
                }
                trace!(aggregate_id = %self.key, version, "event committed");

                // The event is durable; a failed save still leaves snapshot
                // tracking unknown until it is re-read.
                let saved = self
                    .snapshots
                    .maybe_save(self.engine.snapshots.as_ref(), &self.state, false)
                    .await;
                if let Err(err) = saved {
                    return Err(self.discard(err).await);
                }
                Ok(true)
            }
        }
    }

    /// Log a fault raised after in-memory state moved, reload from durable
    /// state and hand the fault back.
    async fn discard(&mut self, err: EngineError) -> EngineError {
        error!(
            aggregate_id = %self.key,
            version = self.state.base.doing_version,
            error = %err,
            "write failed, reloading state"
        );
        if let Err(reload) = self.recover().await {
            error!(aggregate_id = %self.key, error = %reload, "reload after fault failed");
        }
        err
    }

    /// Persist a snapshot if the interval elapsed, or unconditionally when forced.
    pub async fn save_snapshot(&mut self, force: bool) -> Result<bool> {
        self.ensure_recovered().await?;
        self.snapshots
            .maybe_save(self.engine.snapshots.as_ref(), &self.state, force)
            .await
    }

    /// Eviction hook: save when enough versions accumulated since the last
    /// snapshot, then release the lease.
    pub async fn deactivate(mut self) -> Result<bool> {
        if self.needs_recovery {
            return Ok(false);
        }
        if !self.snapshots.due_on_deactivate(self.state.version()) {
            return Ok(false);
        }
        self.snapshots
            .maybe_save(self.engine.snapshots.as_ref(), &self.state, true)
            .await
    }

    /// Finalize the aggregate. Later raises fail with a terminal violation.
    pub async fn over(&mut self) -> Result<()> {
        self.ensure_recovered().await?;
        self.state.base.ensure_live()?;
        self.state.base.ensure_settled()?;

        self.state.base.is_over = true;
        self.state.base.is_latest = true;

        let store = self.engine.snapshots.as_ref();
        let written = if self.snapshots.has_snapshot()
            && self.snapshots.last_snapshot_version() == self.state.version()
        {
            self.snapshots.mark_over(store, &self.key).await
        } else {
            self.snapshots.maybe_save(store, &self.state, true).await
        };
        if let Err(err) = written {
            return Err(self.discard(err).await);
        }
        trace!(aggregate_id = %self.key, version = self.state.version(), "aggregate over");
        Ok(())
    }

    /// Drop the persisted snapshot. The log is untouched.
    pub async fn delete_state(&mut self) -> Result<bool> {
        self.ensure_recovered().await?;
        self.snapshots
            .delete(self.engine.snapshots.as_ref(), &self.key)
            .await
    }

    /// Send a message that changes no state. Routing defaults to the aggregate id.
    pub async fn publish<T: Serialize>(
        &self,
        type_code: &str,
        message: &T,
        routing_key: Option<&str>,
    ) -> Result<()> {
        let envelope = Envelope {
            type_code: type_code.to_string(),
            aggregate_id: self.key.clone(),
            version: self.state.version(),
            bytes: serde_json::to_vec(message).map_err(PublishError::from)?,
        };
        self.engine
            .publisher
            .publish(envelope.to_bytes()?, routing_key.unwrap_or(self.key.as_str()))
            .await?;
        Ok(())
    }

    /// Committed events of one type with `version > after`, decoded.
    pub async fn events_of_type(
        &self,
        type_code: &str,
        after: Version,
        limit: usize,
    ) -> Result<Vec<Event<A::Id, A::Event>>> {
        let rows = self
            .engine
            .log
            .read_by_type(&self.key, type_code, after, limit, None)
            .await?;
        rows.iter()
            .map(|row| {
                self.engine
                    .codec
                    .decode_row(&self.id, row)
                    .map_err(EngineError::from)
            })
            .collect()
    }
}
