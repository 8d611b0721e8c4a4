//! Persistence seam for slot reconciliation, run telemetry and the per-account lock.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use slotsync_core::{DayDiff, DayScope, NormalizedSlot, RunOutcome, SlotRecord, SlotStatus, SyncRun};
use uuid::Uuid;

/// Held for the whole run; dropping it without `release` still frees the lock.
#[async_trait]
pub trait AccountLease: Send {
    fn account_id(&self) -> &str;
    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn create_run(
        &self,
        account_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<SyncRun>;

    /// Writes the terminal state. Returns `false` if the run was already finalized.
    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<bool>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>>;

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>>;

    /// `None` when another run holds the account.
    async fn try_lock_account(&self, account_id: &str) -> Result<Option<Box<dyn AccountLease>>>;

    /// Upsert one day's observation and soft-delete every current slot of the
    /// scope that the observation no longer contains. Atomic per call.
    async fn upsert_and_diff_day(
        &self,
        scope: &DayScope,
        rows: &[NormalizedSlot],
        seen_at: DateTime<Utc>,
    ) -> Result<DayDiff>;

    async fn current_slots(&self, scope: &DayScope) -> Result<Vec<SlotRecord>>;
}

/// Signed 64-bit lock key: the first eight bytes of SHA-256 over the account id.
pub fn advisory_lock_key(account_id: &str) -> i64 {
    let digest = Sha256::digest(account_id.trim().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Stored state of a slot that matters for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingSlot {
    pub content_hash: String,
    pub status: SlotStatus,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    Updated,
    Unchanged,
}

pub fn classify_observation(existing: Option<&ExistingSlot>, incoming: &NormalizedSlot) -> Observation {
    match existing {
        None => Observation::Inserted,
        Some(prev)
            if prev.is_current
                && prev.content_hash == incoming.content_hash
                && prev.status == incoming.status =>
        {
            Observation::Unchanged
        }
        Some(_) => Observation::Updated,
    }
}

pub(crate) fn tally(diff: &mut DayDiff, observation: Observation) {
    match observation {
        Observation::Inserted => diff.inserted += 1,
        Observation::Updated => diff.updated += 1,
        Observation::Unchanged => diff.unchanged += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slot(hash: &str, status: SlotStatus) -> NormalizedSlot {
        NormalizedSlot {
            external_uid: "uid-1".into(),
            time: "08:00:00".into(),
            payload: json!({"holder_name": "MARIA"}),
            content_hash: hash.into(),
            status,
        }
    }

    #[test]
    fn lock_key_is_stable_and_account_specific() {
        assert_eq!(advisory_lock_key("clinica-centro"), advisory_lock_key("clinica-centro"));
        assert_eq!(advisory_lock_key(" clinica-centro "), advisory_lock_key("clinica-centro"));
        assert_ne!(advisory_lock_key("clinica-centro"), advisory_lock_key("clinica-norte"));
    }

    #[test]
    fn observation_classification() {
        let existing = ExistingSlot {
            content_hash: "h1".into(),
            status: SlotStatus::Available,
            is_current: true,
        };
        assert_eq!(classify_observation(None, &slot("h1", SlotStatus::Available)), Observation::Inserted);
        assert_eq!(
            classify_observation(Some(&existing), &slot("h1", SlotStatus::Available)),
            Observation::Unchanged
        );
        assert_eq!(
            classify_observation(Some(&existing), &slot("h2", SlotStatus::Available)),
            Observation::Updated
        );
        assert_eq!(
            classify_observation(Some(&existing), &slot("h1", SlotStatus::Booked)),
            Observation::Updated
        );
        let removed = ExistingSlot {
            status: SlotStatus::Removed,
            is_current: false,
            ..existing
        };
        assert_eq!(
            classify_observation(Some(&removed), &slot("h1", SlotStatus::Available)),
            Observation::Updated
        );
    }
}
