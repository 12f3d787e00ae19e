//! Strike ledger for chat moderation.
//!
//! Tracks per-user penalty records with independent expirations in a single
//! durable document. Mutations are serialized through [`PenaltyLedger`] and a
//! background [`ReclamationPass`] purges expired records on a fixed interval.

pub mod clock;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod workers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::{
    LedgerError, LedgerResult, LedgerSnapshot, PenaltyRecord, ReclaimReport, UserId,
    UserLedgerEntry,
};
pub use services::PenaltyLedger;
pub use storage::{JsonFileStore, MemoryStore, PenaltyStore};
pub use workers::{ReclamationHandle, ReclamationPass, ReclamationStats, TickOutcome};
