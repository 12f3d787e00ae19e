pub mod penalty;

pub use penalty::{
    LedgerDocument, LedgerSnapshot, PenaltyRecord, ReclaimReport, UserId, UserLedgerEntry,
};

use std::path::PathBuf;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The persisted document exists but cannot be trusted. Never coerced to
    /// an empty ledger; recovery is an explicit reset.
    #[error("Storage corrupt at {path}: {reason}")]
    StorageCorrupt { path: PathBuf, reason: String },

    #[error("Storage read error: {0}")]
    StorageRead(String),

    #[error("Storage write error: {0}")]
    StorageWrite(String),

    #[error("Invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("Invalid reclamation interval: {0}")]
    InvalidInterval(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StorageWrite(_) | LedgerError::StorageRead(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, LedgerError::StorageCorrupt { .. })
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(err: tokio::task::JoinError) -> Self {
        LedgerError::Internal(format!("storage task failed: {}", err))
    }
}
