// Reference Aggregate
//
// A small account ledger used by the test suites and the CLI to drive
// the engine end to end, plus helpers to wire it to in-memory backends.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::MemoryPublisher;
use crate::codec::{encode_json, CodecError, EventCodec, EventPayload};
use crate::config::EngineConfig;
use crate::entity::{Engine, WriterLease};
use crate::log::{Event, EventLog, InMemoryEventLog};
use crate::snapshot::InMemorySnapshotStore;
use crate::state::Aggregate;

pub const DEPOSITED: &str = "account.deposited";
pub const WITHDRAWN: &str = "account.withdrawn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

impl EventPayload for AccountEvent {
    fn type_code(&self) -> &'static str {
        match self {
            AccountEvent::Deposited(_) => DEPOSITED,
            AccountEvent::Withdrawn(_) => WITHDRAWN,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            AccountEvent::Deposited(body) => encode_json(DEPOSITED, body),
            AccountEvent::Withdrawn(body) => encode_json(WITHDRAWN, body),
        }
    }
}

pub fn deposit(amount: i64) -> AccountEvent {
    AccountEvent::Deposited(Deposited { amount })
}

pub fn withdraw(amount: i64) -> AccountEvent {
    AccountEvent::Withdrawn(Withdrawn { amount })
}

pub fn account_codec() -> EventCodec<AccountEvent> {
    EventCodec::new()
        .register(DEPOSITED, AccountEvent::Deposited)
        .register(WITHDRAWN, AccountEvent::Withdrawn)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
    pub deposits: u32,
    pub withdrawals: u32,
    pub last_event_at: i64,
}

impl Aggregate for Account {
    type Id = Uuid;
    type Event = AccountEvent;

    fn create(_id: &Uuid) -> Self {
        Self::default()
    }

    fn apply(&mut self, event: &Event<Uuid, AccountEvent>) {
        match &event.payload {
            AccountEvent::Deposited(body) => {
                self.balance += body.amount;
                self.deposits += 1;
            }
            AccountEvent::Withdrawn(body) => {
                self.balance -= body.amount;
                self.withdrawals += 1;
            }
        }
        self.last_event_at = event.timestamp;
    }
}

/// Lease for a host that already serializes all calls per identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoleWriter;

impl WriterLease for SoleWriter {
    fn covers(&self, _aggregate_id: &str) -> bool {
        true
    }
}

/// Lease scoped to exactly one identity.
#[derive(Debug, Clone)]
pub struct ScopedLease(pub String);

impl WriterLease for ScopedLease {
    fn covers(&self, aggregate_id: &str) -> bool {
        self.0 == aggregate_id
    }
}

/// An account engine wired to in-memory backends, with handles to each.
pub struct MemoryHarness {
    pub engine: Engine<Account>,
    pub log: Arc<InMemoryEventLog>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub publisher: Arc<MemoryPublisher>,
}

impl MemoryHarness {
    pub fn new(config: EngineConfig) -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        Self::with_log(config, log)
    }

    /// Fresh snapshot store and publisher over an existing log backend.
    pub fn with_log(config: EngineConfig, log: Arc<InMemoryEventLog>) -> Self {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let event_log = Arc::new(EventLog::new(&config, log.clone()));
        let engine = Engine::new(
            config,
            event_log,
            snapshots.clone(),
            publisher.clone(),
            Arc::new(account_codec()),
        );

        Self {
            engine,
            log,
            snapshots,
            publisher,
        }
    }
}
