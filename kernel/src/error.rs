// Engine Errors
//
// Every public engine operation returns `EngineError`. Idempotent
// duplicates are not errors and never appear here.

use crate::bus::PublishError;
use crate::codec::CodecError;
use crate::log::StoreError;
use crate::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Terminal-state and version-consistency violations.
    #[error(transparent)]
    State(#[from] StateError),

    #[error("storage fault: {0}")]
    Storage(#[from] StoreError),

    #[error("serialization fault: {0}")]
    Codec(#[from] CodecError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("writer lease does not cover aggregate {0}")]
    LeaseMismatch(String),
}

impl EngineError {
    pub fn is_terminal_violation(&self) -> bool {
        matches!(self, EngineError::State(StateError::Over { .. }))
    }

    pub fn is_version_inconsistency(&self) -> bool {
        matches!(self, EngineError::State(StateError::VersionInconsistency { .. }))
    }

    pub fn is_storage_fault(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
