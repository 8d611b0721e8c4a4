//! In-process [`SlotStore`] for tests and `--memory` dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use slotsync_core::{DayDiff, DayScope, NormalizedSlot, RunOutcome, RunStatus, SlotRecord, SlotStatus, SyncRun, SyncTotals};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{classify_observation, tally, AccountLease, ExistingSlot, SlotStore};

#[derive(Debug, Default)]
struct MemoryState {
    slots: HashMap<(String, String), SlotRecord>,
    runs: Vec<SyncRun>,
}

#[derive(Debug, Default)]
pub struct MemorySlotStore {
    state: Mutex<MemoryState>,
    locks: Arc<StdMutex<HashSet<String>>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, current or not, ordered by date and time.
    pub async fn all_slots(&self) -> Vec<SlotRecord> {
        let state = self.state.lock().await;
        let mut slots: Vec<SlotRecord> = state.slots.values().cloned().collect();
        slots.sort_by(|a, b| (a.date, &a.time, &a.external_uid).cmp(&(b.date, &b.time, &b.external_uid)));
        slots
    }

    pub async fn runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.clone()
    }
}

fn in_scope(record: &SlotRecord, scope: &DayScope) -> bool {
    record.source == scope.source
        && record.unit_code == scope.unit_code
        && record.service_code == scope.service_code
        && record.date == scope.date
}

struct MemoryLease {
    account_id: String,
    locks: Arc<StdMutex<HashSet<String>>>,
}

impl MemoryLease {
    fn unlock(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.remove(&self.account_id);
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl AccountLease for MemoryLease {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.unlock();
        Ok(())
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn create_run(
        &self,
        account_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<SyncRun> {
        let run = SyncRun {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            window_start,
            window_end,
            status: RunStatus::Running,
            totals: SyncTotals::default(),
            error_kind: None,
            error_text: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.state.lock().await.runs.push(run.clone());
        Ok(run)
    }

    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status == RunStatus::Running)
        else {
            return Ok(false);
        };
        run.status = outcome.status();
        run.totals = outcome.totals();
        if let RunOutcome::Failed { kind, message, .. } = outcome {
            run.error_kind = Some(*kind);
            run.error_text = Some(message.clone());
        }
        run.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| account_id.map_or(true, |a| r.account_id == a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_lock_account(&self, account_id: &str) -> Result<Option<Box<dyn AccountLease>>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if !locks.insert(account_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLease {
            account_id: account_id.to_string(),
            locks: Arc::clone(&self.locks),
        })))
    }

    async fn upsert_and_diff_day(
        &self,
        scope: &DayScope,
        rows: &[NormalizedSlot],
        seen_at: DateTime<Utc>,
    ) -> Result<DayDiff> {
        let mut state = self.state.lock().await;
        let mut diff = DayDiff::default();
        let mut observed = HashSet::new();

        for row in rows {
            observed.insert(row.external_uid.clone());
            let key = (scope.source.clone(), row.external_uid.clone());
            let existing = state.slots.get(&key).map(|r| ExistingSlot {
                content_hash: r.content_hash.clone(),
                status: r.status,
                is_current: r.is_current,
            });
            tally(&mut diff, classify_observation(existing.as_ref(), row));

            let first_seen_at = state.slots.get(&key).map_or(seen_at, |r| r.first_seen_at);
            state.slots.insert(
                key,
                SlotRecord {
                    source: scope.source.clone(),
                    unit_code: scope.unit_code.clone(),
                    service_code: scope.service_code.clone(),
                    date: scope.date,
                    time: row.time.clone(),
                    external_uid: row.external_uid.clone(),
                    payload: row.payload.clone(),
                    content_hash: row.content_hash.clone(),
                    status: row.status,
                    is_current: true,
                    first_seen_at,
                    last_seen_at: seen_at,
                },
            );
        }

        for record in state.slots.values_mut() {
            if record.is_current && in_scope(record, scope) && !observed.contains(&record.external_uid) {
                record.status = SlotStatus::Removed;
                record.is_current = false;
                diff.removed += 1;
            }
        }
        Ok(diff)
    }

    async fn current_slots(&self, scope: &DayScope) -> Result<Vec<SlotRecord>> {
        let state = self.state.lock().await;
        let mut slots: Vec<SlotRecord> = state
            .slots
            .values()
            .filter(|r| r.is_current && in_scope(r, scope))
            .cloned()
            .collect();
        slots.sort_by(|a, b| (&a.time, &a.external_uid).cmp(&(&b.time, &b.external_uid)));
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slotsync_core::identity::{hash_payload, make_external_uid};
    use slotsync_core::ErrorKind;

    fn scope() -> DayScope {
        DayScope {
            source: "portal".into(),
            unit_code: "U1".into(),
            service_code: "S1".into(),
            date: NaiveDate::from_ymd_opt(2025, 11, 4).expect("date"),
        }
    }

    fn slot(time: &str, name: &str) -> NormalizedSlot {
        let payload = json!({"holder_name": name, "document_number": "12345678909"});
        NormalizedSlot {
            external_uid: make_external_uid("U1", "S1", "2025-11-04", time, None),
            time: time.into(),
            content_hash: hash_payload(&payload),
            payload,
            status: SlotStatus::Available,
        }
    }

    #[tokio::test]
    async fn second_identical_pass_is_a_no_op() {
        let store = MemorySlotStore::new();
        let rows = vec![slot("08:00:00", "MARIA"), slot("08:20:00", "JOSE")];

        let first = store.upsert_and_diff_day(&scope(), &rows, Utc::now()).await.expect("first");
        let before = store.all_slots().await;
        let second = store.upsert_and_diff_day(&scope(), &rows, Utc::now()).await.expect("second");
        let after = store.all_slots().await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second, DayDiff { inserted: 0, updated: 0, unchanged: 2, removed: 0 });
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.content_hash, a.content_hash);
            assert_eq!(b.status, a.status);
            assert_eq!(b.first_seen_at, a.first_seen_at);
        }
    }

    #[tokio::test]
    async fn slot_missing_from_new_observation_is_soft_deleted() {
        let store = MemorySlotStore::new();
        let a = slot("08:00:00", "MARIA");
        let b = slot("08:20:00", "JOSE");
        store
            .upsert_and_diff_day(&scope(), &[a.clone(), b.clone()], Utc::now())
            .await
            .expect("seed");

        let diff = store.upsert_and_diff_day(&scope(), &[a.clone()], Utc::now()).await.expect("diff");

        assert_eq!(diff, DayDiff { inserted: 0, updated: 0, unchanged: 1, removed: 1 });
        let all = store.all_slots().await;
        let gone = all.iter().find(|r| r.external_uid == b.external_uid).expect("b kept");
        assert_eq!(gone.status, SlotStatus::Removed);
        assert!(!gone.is_current);
        let kept = all.iter().find(|r| r.external_uid == a.external_uid).expect("a kept");
        assert_eq!(kept.content_hash, a.content_hash);
        assert!(kept.is_current);
        assert_eq!(store.current_slots(&scope()).await.expect("current").len(), 1);
    }

    #[tokio::test]
    async fn empty_observation_removes_the_whole_day_only() {
        let store = MemorySlotStore::new();
        store
            .upsert_and_diff_day(&scope(), &[slot("08:00:00", "MARIA")], Utc::now())
            .await
            .expect("seed");
        let other_day = DayScope {
            date: NaiveDate::from_ymd_opt(2025, 11, 5).expect("date"),
            ..scope()
        };
        store
            .upsert_and_diff_day(&other_day, &[slot("09:00:00", "ANA")], Utc::now())
            .await
            .expect("seed other");

        let diff = store.upsert_and_diff_day(&scope(), &[], Utc::now()).await.expect("empty");

        assert_eq!(diff.removed, 1);
        assert!(store.current_slots(&scope()).await.expect("current").is_empty());
        assert_eq!(store.current_slots(&other_day).await.expect("other").len(), 1);
    }

    #[tokio::test]
    async fn changed_and_reappearing_slots_count_as_updated() {
        let store = MemorySlotStore::new();
        let original = slot("08:00:00", "MARIA");
        store.upsert_and_diff_day(&scope(), &[original.clone()], Utc::now()).await.expect("seed");

        let changed = NormalizedSlot {
            payload: json!({"holder_name": "MARIA SOUZA"}),
            content_hash: hash_payload(&json!({"holder_name": "MARIA SOUZA"})),
            ..original.clone()
        };
        let diff = store.upsert_and_diff_day(&scope(), &[changed.clone()], Utc::now()).await.expect("changed");
        assert_eq!(diff.updated, 1);

        store.upsert_and_diff_day(&scope(), &[], Utc::now()).await.expect("removed");
        let back = store.upsert_and_diff_day(&scope(), &[changed], Utc::now()).await.expect("back");
        assert_eq!(back, DayDiff { inserted: 0, updated: 1, unchanged: 0, removed: 0 });
    }

    #[tokio::test]
    async fn runs_finalize_exactly_once() {
        let store = MemorySlotStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 11, 4).expect("date");
        let run = store.create_run("acct", day, day).await.expect("run");
        let failed = RunOutcome::Failed {
            totals: SyncTotals::default(),
            kind: ErrorKind::Timeout,
            message: "timed out".into(),
        };

        assert!(store.finalize_run(run.id, &failed).await.expect("finalize"));
        assert!(!store
            .finalize_run(run.id, &RunOutcome::Success(SyncTotals::default()))
            .await
            .expect("second finalize"));
        let stored = store.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_kind, Some(ErrorKind::Timeout));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn account_lock_is_exclusive_until_released_or_dropped() {
        let store = MemorySlotStore::new();
        let lease = store.try_lock_account("acct").await.expect("lock").expect("free");
        assert!(store.try_lock_account("acct").await.expect("lock").is_none());
        assert!(store.try_lock_account("other").await.expect("lock").is_some());

        lease.release().await.expect("release");
        let again = store.try_lock_account("acct").await.expect("lock").expect("free again");
        drop(again);
        assert!(store.try_lock_account("acct").await.expect("lock").is_some());
    }
}
