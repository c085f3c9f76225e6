// Snapshot Manager
//
// Decides when an aggregate's state is persisted and whether that write is
// an insert or an update. Interval saves, forced saves and the
// deactivation save all pass through `maybe_save`.

use tracing::{error, trace};

use crate::codec::CodecError;
use crate::config::{EngineConfig, StorageRole};
use crate::error::EngineError;
use crate::log::Version;
use crate::state::{Aggregate, AggregateState, StateBase};

pub mod store;

pub use store::{InMemorySnapshotStore, SnapshotRow, SnapshotStore, SnapshotWrite};

const SNAPSHOT_CODE: &str = "snapshot";

pub fn encode_snapshot<A: Aggregate>(state: &AggregateState<A>) -> Result<SnapshotRow, CodecError> {
    let data = serde_json::to_vec(&state.data).map_err(|source| CodecError::Encode {
        type_code: SNAPSHOT_CODE.into(),
        source,
    })?;

    Ok(SnapshotRow {
        aggregate_id: state.base.aggregate_id.to_string(),
        version: state.base.version,
        is_over: state.base.is_over,
        is_latest: state.base.is_latest,
        data,
    })
}

pub fn decode_snapshot<A: Aggregate>(
    aggregate_id: &A::Id,
    row: &SnapshotRow,
) -> Result<AggregateState<A>, CodecError> {
    let data = serde_json::from_slice(&row.data).map_err(|source| CodecError::Decode {
        type_code: SNAPSHOT_CODE.into(),
        source,
    })?;

    Ok(AggregateState {
        base: StateBase::restored(aggregate_id.clone(), row.version, row.is_over, row.is_latest),
        data,
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    role: StorageRole,
    interval: i64,
    min_interval: i64,
    last_version: Version,
    has_snapshot: bool,
    skipped_as_follower: u64,
}

impl SnapshotManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            role: config.role,
            interval: config.snapshot_interval,
            min_interval: config.min_snapshot_interval,
            last_version: 0,
            has_snapshot: false,
            skipped_as_follower: 0,
        }
    }

    /// Reset tracking after recovery. `None` means no snapshot row exists.
    pub fn restore(&mut self, snapshot_version: Option<Version>) {
        self.has_snapshot = snapshot_version.is_some();
        self.last_version = snapshot_version.unwrap_or(0);
    }

    pub fn last_snapshot_version(&self) -> Version {
        self.last_version
    }

    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub fn role(&self) -> StorageRole {
        self.role
    }

    /// Saves that were due but skipped because this process is a follower.
    pub fn skipped_as_follower(&self) -> u64 {
        self.skipped_as_follower
    }

    pub fn is_due(&self, version: Version, force: bool) -> bool {
        force || version - self.last_version >= self.interval
    }

    pub fn due_on_deactivate(&self, version: Version) -> bool {
        version - self.last_version >= self.min_interval
    }

    /// Persist `state` if forced or the interval has elapsed.
    ///
    /// Returns whether a write happened. Fails with a version inconsistency
    /// if `state` is mid-apply.
    pub async fn maybe_save<A: Aggregate>(
        &mut self,
        store: &dyn SnapshotStore,
        state: &AggregateState<A>,
        force: bool,
    ) -> Result<bool, EngineError> {
        state.base.ensure_settled()?;

        let version = state.base.version;
        if !self.is_due(version, force) {
            return Ok(false);
        }
        if self.role == StorageRole::Follower {
            self.skipped_as_follower += 1;
            trace!(aggregate_id = %state.base.aggregate_id, version, "follower skips snapshot");
            return Ok(false);
        }

        let row = encode_snapshot(state)?;
        let written = if self.has_snapshot {
            store.update(&row).await
        } else {
            store.insert(&row).await
        };
        if let Err(err) = written {
            error!(
                aggregate_id = %state.base.aggregate_id,
                version,
                error = %err,
                "snapshot save failed"
            );
            return Err(err.into());
        }

        self.has_snapshot = true;
        self.last_version = version;
        trace!(aggregate_id = %state.base.aggregate_id, version, "snapshot saved");
        Ok(true)
    }

    /// Terminal-flag an already current snapshot without rewriting it.
    pub async fn mark_over(
        &mut self,
        store: &dyn SnapshotStore,
        aggregate_id: &str,
    ) -> Result<bool, EngineError> {
        if self.role == StorageRole::Follower {
            self.skipped_as_follower += 1;
            return Ok(false);
        }
        store.mark_over(aggregate_id).await?;
        Ok(true)
    }

    /// Drop the stored snapshot, if one was ever written.
    pub async fn delete(
        &mut self,
        store: &dyn SnapshotStore,
        aggregate_id: &str,
    ) -> Result<bool, EngineError> {
        if self.last_version <= 0 {
            return Ok(false);
        }
        store.delete(aggregate_id).await?;
        self.last_version = 0;
        self.has_snapshot = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateError;
    use crate::testing::Account;
    use uuid::Uuid;

    fn config(interval: i64, role: StorageRole) -> EngineConfig {
        EngineConfig {
            snapshot_interval: interval,
            role,
            ..EngineConfig::default()
        }
    }

    fn state_at(id: Uuid, version: Version) -> AggregateState<Account> {
        let mut state = AggregateState::<Account>::new(id);
        state.base = StateBase::restored(id, version, false, false);
        state.data.balance = version * 10;
        state
    }

    #[tokio::test]
    async fn interval_decides_and_first_write_inserts() {
        let store = InMemorySnapshotStore::new();
        let mut manager = SnapshotManager::new(&config(3, StorageRole::Master));
        let id = Uuid::new_v4();

        assert!(!manager.maybe_save(&store, &state_at(id, 2), false).await.unwrap());
        assert!(manager.maybe_save(&store, &state_at(id, 3), false).await.unwrap());
        assert!(!manager.maybe_save(&store, &state_at(id, 5), false).await.unwrap());
        assert!(manager.maybe_save(&store, &state_at(id, 6), false).await.unwrap());

        let key = id.to_string();
        assert_eq!(
            store.writes(),
            vec![
                SnapshotWrite::Insert { aggregate_id: key.clone(), version: 3 },
                SnapshotWrite::Update { aggregate_id: key, version: 6 },
            ]
        );
        assert_eq!(manager.last_snapshot_version(), 6);
    }

    #[tokio::test]
    async fn force_ignores_interval() {
        let store = InMemorySnapshotStore::new();
        let mut manager = SnapshotManager::new(&config(100, StorageRole::Master));

        assert!(manager
            .maybe_save(&store, &state_at(Uuid::new_v4(), 1), true)
            .await
            .unwrap());
        assert!(manager.has_snapshot());
    }

    #[tokio::test]
    async fn mid_apply_state_is_refused() {
        let store = InMemorySnapshotStore::new();
        let mut manager = SnapshotManager::new(&config(1, StorageRole::Master));
        let mut state = state_at(Uuid::new_v4(), 4);
        state.base.increment_doing_version().unwrap();

        let err = manager.maybe_save(&store, &state, true).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::VersionInconsistency {
                version: 4,
                doing_version: 5,
                ..
            })
        ));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn follower_never_writes() {
        let store = InMemorySnapshotStore::new();
        let mut manager = SnapshotManager::new(&config(1, StorageRole::Follower));
        let id = Uuid::new_v4();

        assert!(!manager.maybe_save(&store, &state_at(id, 5), true).await.unwrap());
        assert!(!manager.mark_over(&store, &id.to_string()).await.unwrap());

        assert!(store.writes().is_empty());
        assert_eq!(manager.skipped_as_follower(), 2);
    }

    #[tokio::test]
    async fn restored_tracking_switches_to_update() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();
        store
            .insert(&encode_snapshot(&state_at(id, 2)).unwrap())
            .await
            .unwrap();

        let mut manager = SnapshotManager::new(&config(1, StorageRole::Master));
        manager.restore(Some(2));
        manager.maybe_save(&store, &state_at(id, 3), false).await.unwrap();

        assert!(matches!(
            store.writes().last(),
            Some(SnapshotWrite::Update { version: 3, .. })
        ));
    }

    #[test]
    fn deactivation_threshold() {
        let mut config = config(10, StorageRole::Master);
        config.min_snapshot_interval = 2;
        let mut manager = SnapshotManager::new(&config);
        manager.restore(Some(5));

        assert!(!manager.due_on_deactivate(6));
        assert!(manager.due_on_deactivate(7));
    }

    #[test]
    fn snapshot_round_trips_state_and_flags() {
        let id = Uuid::new_v4();
        let mut state = state_at(id, 9);
        state.base.is_over = true;

        let decoded: AggregateState<Account> =
            decode_snapshot(&id, &encode_snapshot(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[tokio::test]
    async fn delete_only_after_a_snapshot() {
        let store = InMemorySnapshotStore::new();
        let mut manager = SnapshotManager::new(&config(1, StorageRole::Master));
        let id = Uuid::new_v4();

        assert!(!manager.delete(&store, &id.to_string()).await.unwrap());

        manager.maybe_save(&store, &state_at(id, 1), false).await.unwrap();
        assert!(manager.delete(&store, &id.to_string()).await.unwrap());
        assert!(!manager.has_snapshot());
        assert!(store.row(&id.to_string()).is_none());
    }
}
