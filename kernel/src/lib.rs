// Ledgerline Kernel
//
// Event-sourced persistence for aggregates: recovery from snapshots and a
// time-partitioned log, version-reserving appends with idempotency, and a
// batched commit pipeline shared by every aggregate in the process.

pub mod bus;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod log;
pub mod replay;
pub mod simulate;
pub mod snapshot;
pub mod state;
pub mod testing;

pub use config::EngineConfig;
pub use entity::{Engine, Entity, IdempotencyToken, WriterLease};
pub use error::{EngineError, Result};
