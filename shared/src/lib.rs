//! Shared utilities for the strike ledger workspace

// Re-export common dependencies
pub use anyhow;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;

pub mod observability;
