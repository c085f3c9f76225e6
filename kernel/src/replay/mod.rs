// Recovery Engine
//
// Rebuilds an aggregate from its latest snapshot plus the events logged
// after it, read in bounded pages until the log head.

use tracing::{error, trace};

use crate::codec::EventCodec;
use crate::error::EngineError;
use crate::log::{Event, EventLog, Version};
use crate::snapshot::{decode_snapshot, SnapshotStore};
use crate::state::{Aggregate, AggregateState, StateError};

/// Result of a recovery run.
#[derive(Debug)]
pub struct Recovered<A: Aggregate> {
    pub state: AggregateState<A>,
    /// Version of the snapshot recovery started from; `None` when none existed.
    pub snapshot_version: Option<Version>,
    /// Events replayed on top of the snapshot.
    pub replayed: usize,
}

/// Fold `events` into `state` in order.
///
/// This is the only supported way to advance state from stored events.
pub fn replay_events<'a, A, I>(state: &mut AggregateState<A>, events: I) -> Result<(), StateError>
where
    A: Aggregate,
    I: IntoIterator<Item = &'a Event<A::Id, A::Event>>,
{
    for event in events {
        state.replay(event)?;
    }
    Ok(())
}

/// Load the snapshot for `aggregate_id` and replay the log up to its head.
pub async fn recover<A: Aggregate>(
    aggregate_id: &A::Id,
    snapshots: &dyn SnapshotStore,
    log: &EventLog,
    codec: &EventCodec<A::Event>,
    page_size: usize,
) -> Result<Recovered<A>, EngineError> {
    let key = aggregate_id.to_string();
    trace!(aggregate_id = %key, "recovering state");

    let result = rebuild(aggregate_id, &key, snapshots, log, codec, page_size.max(1)).await;
    match &result {
        Ok(recovered) => trace!(
            aggregate_id = %key,
            version = recovered.state.base.version,
            replayed = recovered.replayed,
            "state recovered"
        ),
        Err(err) => error!(aggregate_id = %key, error = %err, "state recovery failed"),
    }
    result
}

async fn rebuild<A: Aggregate>(
    aggregate_id: &A::Id,
    key: &str,
    snapshots: &dyn SnapshotStore,
    log: &EventLog,
    codec: &EventCodec<A::Event>,
    page_size: usize,
) -> Result<Recovered<A>, EngineError> {
    let snapshot = snapshots.get(key).await?;
    let snapshot_version = snapshot.as_ref().map(|row| row.version);
    let mut state = match snapshot {
        Some(row) => decode_snapshot::<A>(aggregate_id, &row)?,
        None => AggregateState::new(aggregate_id.clone()),
    };

    let mut replayed = 0;
    loop {
        let from = state.base.version;
        let rows = log
            .read_range(key, from, from + page_size as Version, None)
            .await?;
        let page = rows.len();

        for row in &rows {
            let event = codec.decode_row(aggregate_id, row)?;
            state.replay(&event)?;
        }
        replayed += page;

        if page < page_size {
            break;
        }
    }

    Ok(Recovered {
        state,
        snapshot_version,
        replayed,
    })
}
