// Aggregate State
//
// Version bookkeeping shared by every aggregate plus the contract domain
// state implements. `doing_version` is a reservation marker: it runs one
// ahead of `version` only while an event is being applied.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::EventPayload;
use crate::log::{Event, Version};

/// Identity of one aggregate instance. Rendered with `Display` as the
/// partition key of log and snapshot rows.
pub trait AggregateKey: Debug + Display + Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> AggregateKey for T where T: Debug + Display + Clone + Eq + Hash + Send + Sync + 'static {}

/// Domain state rebuilt from events.
pub trait Aggregate: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: AggregateKey;
    type Event: EventPayload;

    /// Initial state for an aggregate with no snapshot.
    fn create(id: &Self::Id) -> Self;

    /// Fold one committed event into the state. Must be deterministic.
    fn apply(&mut self, event: &Event<Self::Id, Self::Event>);
}

/// Errors produced by version and lifecycle checks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("aggregate {aggregate_id} is over and rejects further changes")]
    Over { aggregate_id: String },

    #[error(
        "aggregate {aggregate_id} is mid-apply: version {version}, doing version {doing_version}"
    )]
    VersionInconsistency {
        aggregate_id: String,
        version: Version,
        doing_version: Version,
    },

    #[error("aggregate {aggregate_id} expected event version {expected}, got {actual}")]
    OutOfOrder {
        aggregate_id: String,
        expected: Version,
        actual: Version,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBase<K> {
    pub aggregate_id: K,
    /// Last applied event version.
    pub version: Version,
    /// Version currently being applied.
    pub doing_version: Version,
    pub is_over: bool,
    pub is_latest: bool,
}

impl<K: AggregateKey> StateBase<K> {
    pub fn new(aggregate_id: K) -> Self {
        Self::restored(aggregate_id, 0, false, false)
    }

    pub fn restored(aggregate_id: K, version: Version, is_over: bool, is_latest: bool) -> Self {
        Self {
            aggregate_id,
            version,
            doing_version: version,
            is_over,
            is_latest,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.version == self.doing_version
    }

    pub fn ensure_settled(&self) -> Result<(), StateError> {
        if self.is_settled() {
            Ok(())
        } else {
            Err(StateError::VersionInconsistency {
                aggregate_id: self.aggregate_id.to_string(),
                version: self.version,
                doing_version: self.doing_version,
            })
        }
    }

    pub fn ensure_live(&self) -> Result<(), StateError> {
        if self.is_over {
            Err(StateError::Over {
                aggregate_id: self.aggregate_id.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Reserve the next version. Returns the reserved version.
    pub fn increment_doing_version(&mut self) -> Result<Version, StateError> {
        self.ensure_settled()?;
        self.doing_version += 1;
        Ok(self.doing_version)
    }

    /// Confirm the reserved version once its event is applied.
    pub fn update_version(&mut self, version: Version) -> Result<(), StateError> {
        if version != self.doing_version {
            return Err(StateError::OutOfOrder {
                aggregate_id: self.aggregate_id.to_string(),
                expected: self.doing_version,
                actual: version,
            });
        }
        self.version = version;
        Ok(())
    }

    /// Release a reservation without applying anything.
    pub fn decrement_doing_version(&mut self) {
        self.doing_version = self.version;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState<A: Aggregate> {
    pub base: StateBase<A::Id>,
    pub data: A,
}

impl<A: Aggregate> AggregateState<A> {
    /// Fresh zero-version state.
    pub fn new(aggregate_id: A::Id) -> Self {
        let data = A::create(&aggregate_id);
        Self {
            base: StateBase::new(aggregate_id),
            data,
        }
    }

    pub fn version(&self) -> Version {
        self.base.version
    }

    /// Apply one stored event during replay: reserve, fold, confirm.
    pub fn replay(&mut self, event: &Event<A::Id, A::Event>) -> Result<(), StateError> {
        let expected = self.base.increment_doing_version()?;
        if event.version != expected {
            self.base.decrement_doing_version();
            return Err(StateError::OutOfOrder {
                aggregate_id: self.base.aggregate_id.to_string(),
                expected,
                actual: event.version,
            });
        }
        self.data.apply(event);
        self.base.update_version(event.version)
    }
}
