//! Error types for the twoway engine.

use crate::{session::SessionStatus, AccountId};
use thiserror::Error;

/// Failure reported by a record store or a session state store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,

    #[error("batch rejected: {0}")]
    Rejected(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Protocol errors (caller bugs, never retried)
    #[error("{step} for account {account} requires state {expected}, session is {actual}")]
    ProtocolViolation {
        account: AccountId,
        step: &'static str,
        expected: SessionStatus,
        actual: SessionStatus,
    },

    #[error("a sync session is already active for account {0}")]
    SessionActive(AccountId),

    #[error("{step} for account {account} called while another step is running")]
    StepInProgress {
        account: AccountId,
        step: &'static str,
    },

    // Store errors (session is reset before these are returned)
    #[error("local record store connection is unavailable")]
    StoreUnavailable,

    #[error("record store failure: {0}")]
    RecordStore(StoreError),

    #[error("session state store failure: {0}")]
    StateStore(StoreError),

    #[error("session state serialization failed: {0}")]
    Serialization(String),

    // Transport errors surfaced by an adapter
    #[error("adapter failure: {0}")]
    Adapter(String),
}

impl Error {
    /// Whether the error left the session reset to `Inactive`.
    pub fn resets_session(&self) -> bool {
        matches!(
            self,
            Error::RecordStore(_) | Error::StateStore(_) | Error::Serialization(_) | Error::Adapter(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
