use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{LedgerError, LedgerResult};

/// Opaque, stable identifier of a chat user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A single strike. Immutable once created; `expires_at > issued_at` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyRecord {
    reason: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl PenaltyRecord {
    pub fn new(
        reason: impl Into<String>,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> LedgerResult<Self> {
        if ttl <= Duration::zero() {
            return Err(LedgerError::InvalidTtl(format!(
                "ttl must be positive, got {}s",
                ttl.num_seconds()
            )));
        }
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .ok_or_else(|| LedgerError::InvalidTtl("expiry overflows the calendar".to_string()))?;

        Ok(Self {
            reason: reason.into(),
            issued_at,
            expires_at,
        })
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    fn validate(&self) -> Result<(), String> {
        if self.expires_at <= self.issued_at {
            return Err(format!(
                "record '{}' expires at {} which is not after its issue time {}",
                self.reason, self.expires_at, self.issued_at
            ));
        }
        Ok(())
    }
}

/// All strikes held against one user, oldest first. Never empty while stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLedgerEntry {
    user_id: UserId,
    records: Vec<PenaltyRecord>,
}

impl UserLedgerEntry {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn records(&self) -> &[PenaltyRecord] {
        &self.records
    }

    pub fn active_records(&self, now: DateTime<Utc>) -> Vec<PenaltyRecord> {
        self.records
            .iter()
            .filter(|record| record.is_active(now))
            .cloned()
            .collect()
    }

    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.records.iter().filter(|record| record.is_active(now)).count()
    }
}

/// Persisted layout: user id -> ordered list of records.
pub type LedgerDocument = BTreeMap<UserId, Vec<PenaltyRecord>>;

/// Outcome of dropping expired records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub users_removed: usize,
    pub records_removed: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.users_removed == 0 && self.records_removed == 0
    }
}

/// Owned copy of the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    entries: BTreeMap<UserId, UserLedgerEntry>,
}

impl LedgerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from a decoded document, checking record invariants.
    /// Keys holding an empty list are dropped.
    pub fn from_document(document: LedgerDocument) -> Result<Self, String> {
        let mut entries = BTreeMap::new();
        for (user_id, records) in document {
            if records.is_empty() {
                tracing::warn!(user_id = %user_id, "Dropping empty ledger entry from document");
                continue;
            }
            for record in &records {
                record.validate().map_err(|e| format!("user {}: {}", user_id, e))?;
            }
            entries.insert(
                user_id.clone(),
                UserLedgerEntry { user_id, records },
            );
        }
        Ok(Self { entries })
    }

    pub fn to_document(&self) -> LedgerDocument {
        self.entries
            .iter()
            .map(|(user_id, entry)| (user_id.clone(), entry.records.clone()))
            .collect()
    }

    pub fn get(&self, user_id: &UserId) -> Option<&UserLedgerEntry> {
        self.entries.get(user_id)
    }

    pub fn contains_user(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &UserLedgerEntry> {
        self.entries.values()
    }

    pub fn user_count(&self) -> usize {
        self.entries.len()
    }

    pub fn record_count(&self) -> usize {
        self.entries.values().map(|entry| entry.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a record, creating the user's entry if absent.
    pub fn push(&mut self, user_id: UserId, record: PenaltyRecord) {
        self.entries
            .entry(user_id.clone())
            .or_insert_with(|| UserLedgerEntry {
                user_id,
                records: Vec::new(),
            })
            .records
            .push(record);
    }

    pub fn remove_user(&mut self, user_id: &UserId) -> Option<UserLedgerEntry> {
        self.entries.remove(user_id)
    }

    /// Drop one user's expired records. Returns how many were dropped.
    pub fn prune_user(&mut self, user_id: &UserId, now: DateTime<Utc>) -> usize {
        let Some(entry) = self.entries.get_mut(user_id) else {
            return 0;
        };
        let before = entry.records.len();
        entry.records.retain(|record| record.is_active(now));
        let removed = before - entry.records.len();
        if entry.records.is_empty() {
            self.entries.remove(user_id);
        }
        removed
    }

    /// Drop every record with `expires_at <= now` and every user left empty.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        self.entries.retain(|_, entry| {
            let before = entry.records.len();
            entry.records.retain(|record| record.is_active(now));
            report.records_removed += before - entry.records.len();
            if entry.records.is_empty() {
                report.users_removed += 1;
                false
            } else {
                true
            }
        });
        report
    }
}
