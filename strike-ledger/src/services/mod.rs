pub mod ledger_service;

pub use ledger_service::{PenaltyLedger, DEFAULT_PENALTY_TTL_DAYS};
