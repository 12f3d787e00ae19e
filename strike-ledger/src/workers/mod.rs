pub mod reclamation;

pub use reclamation::{
    ReclamationHandle, ReclamationPass, ReclamationStats, TickOutcome, DEFAULT_RECLAIM_INTERVAL,
};
