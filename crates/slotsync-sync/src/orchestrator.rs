//! Window sync: lock, session, per-date extraction with retry, reconciliation, finalization.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc, Weekday};
use futures::FutureExt;
use serde::Serialize;
use slotsync_core::dates::{dates_in_window, format_iso};
use slotsync_core::identity::{hash_payload, make_external_uid, normalize_slot_payload};
use slotsync_core::{
    AccountConfig, Credentials, DayDiff, DayScope, ErrorKind, NormalizedSlot, RunOutcome, SyncError, SyncTotals,
    DEFAULT_SOURCE,
};
use slotsync_portal::{PortalConnector, PortalSession, ResultsOutcome, ScrapedRow};
use slotsync_storage::{BackoffPolicy, SessionCache};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accounts::AccountDirectory;
use crate::store::SlotStore;

pub const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSyncRequest {
    pub account_id: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Falls back to the account's configured work days.
    pub work_days: Option<Vec<Weekday>>,
    /// Falls back to the account's stored credentials.
    pub credentials: Option<Credentials>,
}

impl WindowSyncRequest {
    pub fn new(account_id: impl Into<String>, window_start: NaiveDate, window_end: NaiveDate) -> Self {
        Self {
            account_id: account_id.into(),
            window_start,
            window_end,
            work_days: None,
            credentials: None,
        }
    }

    pub fn with_work_days(mut self, work_days: Vec<Weekday>) -> Self {
        self.work_days = Some(work_days);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Cache,
    Login,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DateState {
    Synced {
        diff: DayDiff,
        rows: usize,
        rejected: usize,
        outcome: ResultsOutcome,
    },
    Skipped {
        kind: ErrorKind,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateOutcome {
    pub date: NaiveDate,
    pub attempts: u32,
    #[serde(flatten)]
    pub state: DateState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub account_id: String,
    pub totals: SyncTotals,
    pub dates: Vec<DateOutcome>,
    pub rejected_rows: usize,
    pub session_source: Option<SessionSource>,
}

/// Anything that can run a window sync: the orchestrator itself, or a stand-in in tests.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn run_window_sync(&self, request: WindowSyncRequest) -> Result<SyncReport, SyncError>;

    /// Sync one calendar date regardless of the account's work days.
    async fn sync_single_date(&self, account_id: &str, date: NaiveDate) -> Result<SyncReport, SyncError> {
        let request = WindowSyncRequest::new(account_id, date, date).with_work_days(ALL_WEEKDAYS.to_vec());
        self.run_window_sync(request).await
    }
}

/// Build store-ready slots for one day.
///
/// Rows sharing a time and slot token get `#2`, `#3`, ... appended to the token,
/// assigned in document-number order so the same bookings keep the same ordinals.
pub fn normalize_day(unit_code: &str, service_code: &str, date: NaiveDate, rows: &[ScrapedRow]) -> Vec<NormalizedSlot> {
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&rows[a], &rows[b]);
        (&ra.time, &ra.slot_token, &ra.document_number, a).cmp(&(&rb.time, &rb.slot_token, &rb.document_number, b))
    });

    let mut tokens: Vec<Option<String>> = vec![None; rows.len()];
    let mut seen: HashMap<(&str, Option<&str>), u32> = HashMap::new();
    for i in order {
        let row = &rows[i];
        let ordinal = seen.entry((row.time.as_str(), row.slot_token.as_deref())).or_insert(0);
        *ordinal += 1;
        tokens[i] = match (*ordinal, &row.slot_token) {
            (1, token) => token.clone(),
            (n, Some(token)) => Some(format!("{token}#{n}")),
            (n, None) => Some(format!("#{n}")),
        };
    }

    let date_text = format_iso(date);
    rows.iter()
        .zip(tokens)
        .map(|(row, token)| {
            let normalized = normalize_slot_payload(&row.raw_payload());
            NormalizedSlot {
                external_uid: make_external_uid(unit_code, service_code, &date_text, &row.time, token.as_deref()),
                time: row.time.clone(),
                content_hash: hash_payload(&normalized.payload),
                payload: normalized.payload,
                status: normalized.status,
            }
        })
        .collect()
}

#[derive(Debug, Default)]
struct RunProgress {
    totals: SyncTotals,
    dates: Vec<DateOutcome>,
    rejected_rows: usize,
    session_source: Option<SessionSource>,
}

struct RunPlan {
    account: AccountConfig,
    credentials: Credentials,
    dates: Vec<NaiveDate>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn SlotStore>,
    accounts: Arc<dyn AccountDirectory>,
    connector: Arc<dyn PortalConnector>,
    sessions: Arc<SessionCache>,
    source: String,
    backoff: BackoffPolicy,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SlotStore>,
        accounts: Arc<dyn AccountDirectory>,
        connector: Arc<dyn PortalConnector>,
        sessions: Arc<SessionCache>,
    ) -> Self {
        Self {
            store,
            accounts,
            connector,
            sessions,
            source: DEFAULT_SOURCE.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    pub fn accounts(&self) -> &Arc<dyn AccountDirectory> {
        &self.accounts
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    async fn plan(&self, request: WindowSyncRequest) -> Result<RunPlan, SyncError> {
        if request.window_end < request.window_start {
            return Err(SyncError::InvalidRequest(format!(
                "window end {} is before window start {}",
                request.window_end, request.window_start
            )));
        }
        let account = self
            .accounts
            .get(&request.account_id)
            .await
            .map_err(SyncError::store)?
            .ok_or_else(|| SyncError::InvalidRequest(format!("unknown account {}", request.account_id)))?;
        if !account.active {
            return Err(SyncError::InvalidRequest(format!("account {} is inactive", account.account_id)));
        }
        let work_days = request.work_days.unwrap_or_else(|| account.work_days.clone());
        let credentials = request.credentials.unwrap_or_else(|| account.credentials.clone());
        let dates = dates_in_window(request.window_start, request.window_end, &work_days);
        Ok(RunPlan {
            account,
            credentials,
            dates,
        })
    }

    async fn resolve_session(
        &self,
        driver: &mut dyn PortalSession,
        plan: &RunPlan,
    ) -> Result<SessionSource, SyncError> {
        let account_id = plan.account.account_id.as_str();
        if let Some(tokens) = self.sessions.get(account_id).await {
            match driver.resume(&tokens).await {
                Ok(true) => return Ok(SessionSource::Cache),
                Ok(false) => info!(account_id, "cached session no longer valid, logging in"),
                Err(err) => warn!(account_id, error = %err, "cached session check failed, logging in"),
            }
            self.sessions.clear(account_id).await;
        }
        let tokens = driver.login(&plan.credentials).await?;
        self.sessions.set_default(account_id, tokens).await;
        Ok(SessionSource::Login)
    }

    async fn sync_date(
        &self,
        driver: &mut dyn PortalSession,
        account: &AccountConfig,
        date: NaiveDate,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempts = 0;
        let extraction = loop {
            attempts += 1;
            match driver.buscar_agendamentos(date).await {
                Ok(extraction) => break Ok(extraction),
                Err(err) if !err.retryable_per_date() => return Err(err),
                Err(err) if attempts >= max_attempts => break Err(err),
                Err(err) => {
                    let delay = self.backoff.jittered_delay(attempts - 1);
                    warn!(attempt = attempts, error = %err, delay_ms = delay.as_millis() as u64, "date extraction failed, retrying");
                    driver.voltar().await;
                    sleep(delay).await;
                }
            }
        };

        let extraction = match extraction {
            Ok(extraction) => extraction,
            Err(err) => {
                warn!(attempts, error = %err, "date skipped after exhausting retries");
                progress.totals.skipped += 1;
                progress.dates.push(DateOutcome {
                    date,
                    attempts,
                    state: DateState::Skipped {
                        kind: err.kind(),
                        reason: err.to_string(),
                    },
                });
                return Ok(());
            }
        };

        let slots = normalize_day(&account.unit_code, &account.service_code, date, &extraction.rows);
        let scope = DayScope {
            source: self.source.clone(),
            unit_code: account.unit_code.clone(),
            service_code: account.service_code.clone(),
            date,
        };
        let diff = self
            .store
            .upsert_and_diff_day(&scope, &slots, Utc::now())
            .await
            .map_err(SyncError::store)?;
        info!(
            attempts,
            inserted = diff.inserted,
            updated = diff.updated,
            unchanged = diff.unchanged,
            removed = diff.removed,
            "date reconciled"
        );

        progress.totals.absorb(&diff);
        progress.rejected_rows += extraction.rejected.len();
        progress.dates.push(DateOutcome {
            date,
            attempts,
            state: DateState::Synced {
                diff,
                rows: slots.len(),
                rejected: extraction.rejected.len(),
                outcome: extraction.outcome,
            },
        });
        Ok(())
    }

    async fn execute(
        &self,
        plan: &RunPlan,
        session: &mut Option<Box<dyn PortalSession>>,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        let driver = session.insert(self.connector.open(&plan.account.account_id).await?);
        let source = self.resolve_session(&mut **driver, plan).await?;
        progress.session_source = Some(source);
        info!(session = ?source, dates = plan.dates.len(), "session ready");

        for (i, date) in plan.dates.iter().copied().enumerate() {
            self.sync_date(&mut **driver, &plan.account, date, progress)
                .instrument(info_span!("sync_date", date = %date))
                .await?;
            if i + 1 < plan.dates.len() {
                driver.voltar().await;
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        run_id: Uuid,
        account_id: &str,
        result: Result<(), SyncError>,
        totals: SyncTotals,
    ) -> Result<(), SyncError> {
        let outcome = match &result {
            Ok(()) => RunOutcome::Success(totals),
            Err(err) => RunOutcome::Failed {
                totals,
                kind: err.kind(),
                message: err.to_string(),
            },
        };
        match self.store.finalize_run(run_id, &outcome).await {
            Ok(true) => {}
            Ok(false) => warn!(%run_id, "run was already finalized"),
            Err(err) => {
                error!(%run_id, account_id, error = %format!("{err:#}"), "failed to finalize run");
                if result.is_ok() {
                    return Err(SyncError::store(err));
                }
            }
        }
        result
    }

    /// Finalize a run that never got the lock.
    async fn reject(&self, run_id: Uuid, account_id: &str, err: SyncError) -> SyncError {
        match self.finish(run_id, account_id, Err(err.clone()), SyncTotals::default()).await {
            Ok(()) => err,
            Err(err) => err,
        }
    }

    /// Reconcile every work day in the window for one account.
    ///
    /// The run row is always finalized, the lock always released and the browser
    /// always closed, including when the run panics.
    pub async fn run_window_sync(&self, request: WindowSyncRequest) -> Result<SyncReport, SyncError> {
        let plan = self.plan(request.clone()).await?;
        let account_id = plan.account.account_id.clone();
        let run = self
            .store
            .create_run(&account_id, request.window_start, request.window_end)
            .await
            .map_err(SyncError::store)?;
        let span = info_span!("sync_run", account_id = %account_id, run_id = %run.id);

        async {
            let lease = match self.store.try_lock_account(&account_id).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    warn!("another run holds the account lock");
                    let err = SyncError::AlreadyRunning(account_id.clone());
                    return Err(self.reject(run.id, &account_id, err).await);
                }
                Err(err) => {
                    return Err(self.reject(run.id, &account_id, SyncError::store(err)).await);
                }
            };
            info!(
                window_start = %request.window_start,
                window_end = %request.window_end,
                dates = plan.dates.len(),
                "sync run started"
            );

            let mut session: Option<Box<dyn PortalSession>> = None;
            let mut progress = RunProgress::default();
            let result = AssertUnwindSafe(self.execute(&plan, &mut session, &mut progress))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(panic = %message, "sync run panicked");
                    Err(SyncError::Generic(format!("sync run panicked: {message}")))
                });

            if let Some(mut driver) = session.take() {
                driver.close().await;
            }
            if let Err(err) = &result {
                if err.invalidates_session() && self.sessions.clear(&account_id).await {
                    info!(kind = err.kind().as_str(), "cached session invalidated");
                }
            }
            let result = self.finish(run.id, &account_id, result, progress.totals).await;
            if let Err(err) = lease.release().await {
                warn!(error = %format!("{err:#}"), "failed to release account lock");
            }

            match &result {
                Ok(()) => info!(
                    inserted = progress.totals.inserted,
                    updated = progress.totals.updated,
                    removed = progress.totals.removed,
                    skipped = progress.totals.skipped,
                    unchanged = progress.totals.unchanged,
                    "sync run succeeded"
                ),
                Err(err) => error!(kind = err.kind().as_str(), error = %err, "sync run failed"),
            }
            result.map(|()| SyncReport {
                run_id: run.id,
                account_id: account_id.clone(),
                totals: progress.totals,
                dates: progress.dates,
                rejected_rows: progress.rejected_rows,
                session_source: progress.session_source,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl SyncTrigger for SyncOrchestrator {
    async fn run_window_sync(&self, request: WindowSyncRequest) -> Result<SyncReport, SyncError> {
        SyncOrchestrator::run_window_sync(self, request).await
    }
}
