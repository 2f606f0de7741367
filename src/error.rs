//! Error types for jobq.

use thiserror::Error;

use crate::model::job::{JobId, OwnerToken};

#[derive(Debug, Error)]
pub enum Error {
    /// Caller error: missing queue name, malformed selector, bad option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Enqueue targeted an id whose job is no longer claimable.
    #[error("job '{id}' exists and is no longer enqueued")]
    DuplicateClaimedJob { id: JobId },

    /// Retirement found no job holding the expected owner token.
    #[error("ownership lost for token '{token}'")]
    LostOwnership { token: OwnerToken },

    #[error("job timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for faults raised by the backing store rather than by the caller
    /// or the job protocol.
    pub fn is_store_fault(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Migration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
