use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::models::{LedgerError, LedgerResult, ReclaimReport};
use crate::services::ledger_service::PenaltyLedger;

/// Default period between reclamation ticks.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Running totals since the pass was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclamationStats {
    pub ticks_completed: u64,
    pub ticks_failed: u64,
    pub ticks_skipped: u64,
    pub users_removed: u64,
    pub records_removed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(ReclaimReport),
    Failed(LedgerError),
    /// Another tick was still running.
    Skipped,
    /// The ledger has been dropped; the loop ends.
    Detached,
}

/// Periodic purge of expired strikes.
///
/// Holds the ledger weakly: the ledger owns the running pass through its
/// handle, and dropping the last external `Arc` must still free it.
pub struct ReclamationPass {
    ledger: Weak<PenaltyLedger>,
    in_flight: AtomicBool,
    stats: Mutex<ReclamationStats>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReclamationPass {
    pub fn new(ledger: &Arc<PenaltyLedger>) -> Self {
        Self {
            ledger: Arc::downgrade(ledger),
            in_flight: AtomicBool::new(false),
            stats: Mutex::new(ReclamationStats::default()),
        }
    }

    pub fn stats(&self) -> ReclamationStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a single reclamation at the ledger's current time. Errors are
    /// logged and counted, never propagated.
    pub async fn run_once(&self) -> TickOutcome {
        let Some(ledger) = self.ledger.upgrade() else {
            info!("Strike ledger dropped, reclamation pass detaching");
            return TickOutcome::Detached;
        };
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Previous reclamation tick still running, skipping");
            self.update_stats(|stats| stats.ticks_skipped += 1);
            return TickOutcome::Skipped;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let now = ledger.now();
        match ledger.reclaim_expired(now).await {
            Ok(report) => {
                self.update_stats(|stats| {
                    stats.ticks_completed += 1;
                    stats.users_removed += report.users_removed as u64;
                    stats.records_removed += report.records_removed as u64;
                    stats.last_run_at = Some(now);
                });
                TickOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "Reclamation tick failed");
                self.update_stats(|stats| {
                    stats.ticks_failed += 1;
                    stats.last_run_at = Some(now);
                });
                TickOutcome::Failed(e)
            }
        }
    }

    /// Spawn the tick loop. The first tick fires immediately.
    pub fn spawn(self: Arc<Self>, period: Duration) -> LedgerResult<ReclamationHandle> {
        if period.is_zero() {
            return Err(LedgerError::InvalidInterval(
                "reclamation interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let pass = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Reclamation pass started");

            loop {
                // A tick that has started always runs to completion before
                // the shutdown signal is looked at again.
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("Reclamation pass stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let TickOutcome::Detached = pass.run_once().await {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ReclamationHandle {
            shutdown_tx,
            task,
            pass: self,
        })
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReclamationStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Owner of a running reclamation loop.
pub struct ReclamationHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    pass: Arc<ReclamationPass>,
}

impl ReclamationHandle {
    pub fn stats(&self) -> ReclamationStats {
        self.pass.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop and wait for it. No new ticks start after this is
    /// called; a tick in progress finishes its commit.
    pub async fn stop(self) -> ReclamationStats {
        // The loop may already be gone; a closed channel is fine.
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Reclamation task ended abnormally");
        }
        let stats = self.pass.stats();
        info!(
            ticks_completed = stats.ticks_completed,
            ticks_failed = stats.ticks_failed,
            ticks_skipped = stats.ticks_skipped,
            "Reclamation pass stopped"
        );
        stats
    }
}
