//! Error types for the hosts pool store.

use thiserror::Error;

/// Pool store failures. Storage errors keep the redb message only.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open pool store: {0}")]
    Open(String),

    #[error("pool store transaction failed: {0}")]
    Transaction(String),

    #[error("pool store table unavailable: {0}")]
    Table(String),

    #[error("failed to read pool record: {0}")]
    Read(String),

    #[error("failed to write pool record: {0}")]
    Write(String),

    #[error("failed to encode pool record: {0}")]
    Serialize(String),

    #[error("failed to decode pool record: {0}")]
    Deserialize(String),

    #[error("no record at {0}")]
    NotFound(String),

    #[error("a record already exists at {0}")]
    AlreadyExists(String),

    /// Compare-and-swap rejected: the stored checkpoint moved on.
    #[error("checkpoint conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
}

pub type StateResult<T> = Result<T, StateError>;
