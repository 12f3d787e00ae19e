//! Persistence backends for the penalty ledger.
//!
//! A store only knows how to hand out a full snapshot and how to replace the
//! committed snapshot in one step. Serializing load-modify-persist cycles is
//! the ledger service's job.

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::models::{LedgerResult, LedgerSnapshot};

#[async_trait]
pub trait PenaltyStore: Send + Sync {
    /// Return the last committed snapshot. An absent document is an empty ledger.
    async fn load(&self) -> LedgerResult<LedgerSnapshot>;

    /// Replace the committed snapshot. On error the prior snapshot stays current.
    async fn persist(&self, snapshot: &LedgerSnapshot) -> LedgerResult<()>;

    /// Short human-readable location, used in logs.
    fn describe(&self) -> String;
}
