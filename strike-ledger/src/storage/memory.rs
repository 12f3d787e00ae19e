use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::PenaltyStore;
use crate::models::{LedgerError, LedgerResult, LedgerSnapshot};

/// Process-local store. Nothing survives a restart; intended for tests and
/// for embedding the ledger where durability is handled elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: Mutex<LedgerSnapshot>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            committed: Mutex::new(snapshot),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following persist fail with `StorageWrite` until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PenaltyStore for MemoryStore {
    async fn load(&self) -> LedgerResult<LedgerSnapshot> {
        Ok(self
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn persist(&self, snapshot: &LedgerSnapshot) -> LedgerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageWrite(
                "memory store rejected write".to_string(),
            ));
        }
        *self
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
