use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::models::{LedgerResult, LedgerSnapshot, PenaltyRecord, ReclaimReport, UserId};
use crate::storage::{JsonFileStore, PenaltyStore};
use crate::workers::reclamation::{ReclamationHandle, ReclamationPass, ReclamationStats};

/// Strike expiry used when the caller does not pick one.
pub const DEFAULT_PENALTY_TTL_DAYS: i64 = 60;

/// Serialized access to the penalty store.
///
/// Every mutation runs its whole load-modify-persist cycle while holding
/// `write_lock`, so mutations form a single total order and none of them can
/// overwrite another's write. Reads skip the lock and observe the last
/// committed snapshot.
pub struct PenaltyLedger {
    store: Arc<dyn PenaltyStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    write_lock: Mutex<()>,
    reclamation: Mutex<Option<ReclamationHandle>>,
}

impl PenaltyLedger {
    pub fn new(store: Arc<dyn PenaltyStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_ttl: Duration::days(DEFAULT_PENALTY_TTL_DAYS),
            write_lock: Mutex::new(()),
            reclamation: Mutex::new(None),
        }
    }

    /// Open the JSON document named by the configuration.
    pub fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        let store = JsonFileStore::open(&config.data_file, config.persist_timeout())?;
        Ok(Self::new(Arc::new(store)).with_default_ttl(config.default_ttl()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Record a strike issued now. Returns the user's active strike count.
    pub async fn add_penalty(
        &self,
        user_id: &UserId,
        reason: &str,
        ttl: Duration,
    ) -> LedgerResult<usize> {
        self.add_penalty_at(user_id, reason, ttl, self.clock.now()).await
    }

    pub async fn add_penalty_with_default_ttl(
        &self,
        user_id: &UserId,
        reason: &str,
    ) -> LedgerResult<usize> {
        self.add_penalty(user_id, reason, self.default_ttl).await
    }

    /// Record a strike issued at `now`. The user's already-expired records are
    /// dropped in the same commit, so the returned count is post-reclaim.
    pub async fn add_penalty_at(
        &self,
        user_id: &UserId,
        reason: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<usize> {
        let record = PenaltyRecord::new(reason, now, ttl)?;
        let expires_at = record.expires_at();

        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.store.load().await?;
        let pruned = snapshot.prune_user(user_id, now);
        snapshot.push(user_id.clone(), record);
        self.store.persist(&snapshot).await?;

        let active = snapshot
            .get(user_id)
            .map(|entry| entry.active_count(now))
            .unwrap_or(0);

        info!(
            user_id = %user_id,
            reason = %reason,
            expires_at = %expires_at,
            active,
            pruned,
            "Strike recorded"
        );
        Ok(active)
    }

    /// Unexpired records for `user_id`, oldest first. Never mutates the store.
    pub async fn list_active_penalties(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<PenaltyRecord>> {
        let snapshot = self.store.load().await?;
        Ok(snapshot
            .get(user_id)
            .map(|entry| entry.active_records(now))
            .unwrap_or_default())
    }

    pub async fn strike_count(&self, user_id: &UserId, now: DateTime<Utc>) -> LedgerResult<usize> {
        let snapshot = self.store.load().await?;
        Ok(snapshot
            .get(user_id)
            .map(|entry| entry.active_count(now))
            .unwrap_or(0))
    }

    /// Remove every record for `user_id`, expired or not. Returns whether the
    /// user had anything stored.
    pub async fn clear_penalties(&self, user_id: &UserId) -> LedgerResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.store.load().await?;

        let Some(entry) = snapshot.remove_user(user_id) else {
            debug!(user_id = %user_id, "No strikes to clear");
            return Ok(false);
        };
        self.store.persist(&snapshot).await?;

        info!(user_id = %user_id, cleared = entry.records().len(), "Strikes cleared");
        Ok(true)
    }

    /// Drop every record with `expires_at <= now` and every user left empty.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> LedgerResult<ReclaimReport> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.store.load().await?;

        let report = snapshot.reclaim(now);
        if report.is_empty() {
            debug!(now = %now, "Nothing to reclaim");
            return Ok(report);
        }
        self.store.persist(&snapshot).await?;

        info!(
            now = %now,
            users_removed = report.users_removed,
            records_removed = report.records_removed,
            "Expired strikes reclaimed"
        );
        Ok(report)
    }

    /// Last committed state of the whole ledger.
    pub async fn snapshot(&self) -> LedgerResult<LedgerSnapshot> {
        self.store.load().await
    }

    /// Replace the stored document with an empty ledger. This is the explicit
    /// recovery step after a corrupt document; it does not read the old one.
    pub async fn reset(&self) -> LedgerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.persist(&LedgerSnapshot::new()).await?;
        warn!(store = %self.store.describe(), "Strike ledger reset to empty");
        Ok(())
    }

    /// Start the periodic reclamation pass. A pass that is already running is kept.
    pub async fn start_reclamation(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> LedgerResult<()> {
        let mut slot = self.reclamation.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Reclamation pass already running, ignoring start request");
            return Ok(());
        }

        let pass = Arc::new(ReclamationPass::new(self));
        *slot = Some(pass.spawn(interval)?);
        Ok(())
    }

    /// Stop the reclamation pass, letting an in-flight tick finish first.
    pub async fn stop_reclamation(&self) -> Option<ReclamationStats> {
        let handle = self.reclamation.lock().await.take()?;
        Some(handle.stop().await)
    }

    pub async fn reclamation_stats(&self) -> Option<ReclamationStats> {
        self.reclamation.lock().await.as_ref().map(|handle| handle.stats())
    }

    pub async fn shutdown(&self) {
        if let Some(stats) = self.stop_reclamation().await {
            info!(
                ticks_completed = stats.ticks_completed,
                ticks_failed = stats.ticks_failed,
                records_removed = stats.records_removed,
                "Strike ledger shut down"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::LedgerError;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn memory_ledger() -> (Arc<MemoryStore>, PenaltyLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = PenaltyLedger::new(store.clone());
        (store, ledger)
    }

    fn file_ledger(dir: &TempDir) -> PenaltyLedger {
        let path = dir.path().join("strikes.json");
        let store = JsonFileStore::open(path, StdDuration::from_secs(5)).unwrap();
        PenaltyLedger::new(Arc::new(store))
    }

    fn reasons(records: &[PenaltyRecord]) -> Vec<String> {
        records.iter().map(|r| r.reason().to_string()).collect()
    }

    #[tokio::test]
    async fn test_spam_strike_lifecycle() {
        let dir = TempDir::new().unwrap();
        let ledger = file_ledger(&dir);
        let u1 = UserId::from("u1");

        let count = ledger.add_penalty_at(&u1, "spam", Duration::days(7), t0()).await.unwrap();
        assert_eq!(count, 1);

        let active = ledger.list_active_penalties(&u1, t0() + Duration::days(1)).await.unwrap();
        assert_eq!(reasons(&active), vec!["spam"]);
        assert_eq!(active[0].expires_at(), t0() + Duration::days(7));

        let later = ledger.list_active_penalties(&u1, t0() + Duration::days(8)).await.unwrap();
        assert!(later.is_empty());

        let report = ledger.reclaim_expired(t0() + Duration::days(8)).await.unwrap();
        assert_eq!(report, ReclaimReport { users_removed: 1, records_removed: 1 });
        assert!(!ledger.snapshot().await.unwrap().contains_user(&u1));
    }

    #[tokio::test]
    async fn test_added_record_visible_at_same_instant() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");

        ledger.add_penalty_at(&u1, "first", Duration::days(2), t0()).await.unwrap();
        ledger.add_penalty_at(&u1, "second", Duration::hours(1), t0()).await.unwrap();

        let active = ledger.list_active_penalties(&u1, t0()).await.unwrap();
        assert_eq!(reasons(&active), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_list_does_not_delete_expired_records() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");
        ledger.add_penalty_at(&u1, "old", Duration::days(1), t0()).await.unwrap();

        let later = t0() + Duration::days(3);
        assert!(ledger.list_active_penalties(&u1, later).await.unwrap().is_empty());
        assert_eq!(ledger.snapshot().await.unwrap().record_count(), 1);
    }

    #[tokio::test]
    async fn test_add_returns_post_reclaim_count() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");

        ledger.add_penalty_at(&u1, "old", Duration::days(1), t0()).await.unwrap();
        ledger.add_penalty_at(&u1, "kept", Duration::days(30), t0()).await.unwrap();
        let count = ledger
            .add_penalty_at(&u1, "new", Duration::days(7), t0() + Duration::days(2))
            .await
            .unwrap();

        assert_eq!(count, 2);
        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(reasons(snapshot.get(&u1).unwrap().records()), vec!["kept", "new"]);
    }

    #[tokio::test]
    async fn test_add_uses_injected_clock_and_default_ttl() {
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = PenaltyLedger::new(Arc::new(MemoryStore::new())).with_clock(clock.clone());
        let u1 = UserId::from(987654321u64);

        ledger.add_penalty_with_default_ttl(&u1, "raid").await.unwrap();

        let active = ledger.list_active_penalties(&u1, t0()).await.unwrap();
        assert_eq!(active[0].issued_at(), t0());
        assert_eq!(active[0].expires_at(), t0() + Duration::days(DEFAULT_PENALTY_TTL_DAYS));

        clock.advance(Duration::days(DEFAULT_PENALTY_TTL_DAYS));
        assert_eq!(ledger.strike_count(&u1, ledger.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_ttl_leaves_store_untouched() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");

        let err = assert_err!(ledger.add_penalty_at(&u1, "spam", Duration::zero(), t0()).await);
        assert!(matches!(err, LedgerError::InvalidTtl(_)));
        assert!(ledger.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_penalties() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");
        let u2 = UserId::from("u2");
        ledger.add_penalty_at(&u1, "spam", Duration::days(7), t0()).await.unwrap();
        ledger.add_penalty_at(&u2, "spam", Duration::days(7), t0()).await.unwrap();

        assert!(ledger.clear_penalties(&u1).await.unwrap());
        assert!(!ledger.clear_penalties(&u1).await.unwrap());
        assert!(!ledger.clear_penalties(&UserId::from("nobody")).await.unwrap());

        for now in [t0(), t0() - Duration::days(1), t0() + Duration::days(3)] {
            assert!(ledger.list_active_penalties(&u1, now).await.unwrap().is_empty());
        }
        assert_eq!(ledger.strike_count(&u2, t0()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_counts_expired_but_unreclaimed_records() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");
        ledger.add_penalty_at(&u1, "old", Duration::days(1), t0()).await.unwrap();

        assert!(ledger.clear_penalties(&u1).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_removes_exactly_expired_records() {
        let (_, ledger) = memory_ledger();
        let u1 = UserId::from("u1");
        let u2 = UserId::from("u2");
        ledger.add_penalty_at(&u1, "boundary", Duration::days(1), t0()).await.unwrap();
        let just_longer = Duration::days(1) + Duration::seconds(1);
        ledger.add_penalty_at(&u1, "survivor", just_longer, t0()).await.unwrap();
        ledger.add_penalty_at(&u2, "gone", Duration::hours(3), t0()).await.unwrap();

        let now = t0() + Duration::days(1);
        let report = ledger.reclaim_expired(now).await.unwrap();
        assert_eq!(report, ReclaimReport { users_removed: 1, records_removed: 2 });

        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(reasons(snapshot.get(&u1).unwrap().records()), vec!["survivor"]);
        assert!(!snapshot.contains_user(&u2));

        let again = ledger.reclaim_expired(now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_is_not_applied() {
        let (store, ledger) = memory_ledger();
        let u1 = UserId::from("u1");
        ledger.add_penalty_at(&u1, "kept", Duration::days(7), t0()).await.unwrap();

        store.set_fail_writes(true);
        let err = assert_err!(ledger.add_penalty_at(&u1, "lost", Duration::days(7), t0()).await);
        assert!(err.is_retryable());
        assert_err!(ledger.clear_penalties(&u1).await);
        assert_err!(ledger.reclaim_expired(t0() + Duration::days(30)).await);

        let active = ledger.list_active_penalties(&u1, t0()).await.unwrap();
        assert_eq!(reasons(&active), vec!["kept"]);

        store.set_fail_writes(false);
        assert_ok!(ledger.add_penalty_at(&u1, "retried", Duration::days(7), t0()).await);
        assert_eq!(ledger.strike_count(&u1, t0()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_document_surfaces_before_any_write() {
        let dir = TempDir::new().unwrap();
        let ledger = file_ledger(&dir);
        let u1 = UserId::from("u1");
        ledger.add_penalty_at(&u1, "spam", Duration::days(7), t0()).await.unwrap();

        let path = dir.path().join("strikes.json");
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 10]).unwrap();
        let damaged = std::fs::read(&path).unwrap();

        assert!(ledger.snapshot().await.unwrap_err().is_corrupt());
        let err = ledger
            .add_penalty_at(&u1, "again", Duration::days(7), t0())
            .await
            .unwrap_err();
        assert!(err.is_corrupt());
        assert!(ledger.clear_penalties(&u1).await.unwrap_err().is_corrupt());
        assert!(ledger.reclaim_expired(t0()).await.unwrap_err().is_corrupt());
        assert_eq!(std::fs::read(&path).unwrap(), damaged);

        ledger.reset().await.unwrap();
        assert_eq!(ledger.add_penalty_at(&u1, "again", Duration::days(7), t0()).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(file_ledger(&dir));
        let u1 = UserId::from("u1");
        const N: usize = 32;

        let tasks = (0..N).map(|i| {
            let ledger = Arc::clone(&ledger);
            let u1 = u1.clone();
            tokio::spawn(async move {
                ledger
                    .add_penalty_at(&u1, &format!("reason-{}", i), Duration::days(7), t0())
                    .await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let active = ledger.list_active_penalties(&u1, t0()).await.unwrap();
        assert_eq!(active.len(), N);
        let mut seen = reasons(&active);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), N);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adds_survive_concurrent_reclaim_and_clear() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(file_ledger(&dir));
        let keep = UserId::from("keep");
        let victim = UserId::from("victim");
        ledger.add_penalty_at(&victim, "doomed", Duration::days(1), t0()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            let keep = keep.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .add_penalty_at(&keep, &format!("r{}", i), Duration::days(30), t0())
                    .await
                    .map(|_| ())
            }));
        }
        for _ in 0..4 {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger.reclaim_expired(t0() + Duration::days(2)).await.map(|_| ())
            }));
        }
        {
            let ledger = Arc::clone(&ledger);
            let victim = victim.clone();
            tasks.push(tokio::spawn(async move {
                ledger.clear_penalties(&victim).await.map(|_| ())
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(ledger.strike_count(&keep, t0() + Duration::days(2)).await.unwrap(), 16);
        assert!(!ledger.snapshot().await.unwrap().contains_user(&victim));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let u1 = UserId::from("u1");
        {
            let ledger = file_ledger(&dir);
            ledger.add_penalty_at(&u1, "spam", Duration::days(7), t0()).await.unwrap();
        }

        let reopened = file_ledger(&dir);
        assert_eq!(reopened.strike_count(&u1, t0()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_from_config_applies_default_ttl() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            data_file: dir.path().join("nested").join("strikes.json"),
            persist_timeout_secs: 5,
            default_ttl_days: 14,
        };

        let ledger = PenaltyLedger::from_config(&config).unwrap();
        assert_eq!(ledger.default_ttl(), Duration::days(14));
    }
}
