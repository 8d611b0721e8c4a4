//! Daily fan-out over every schedulable account.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc, Weekday};
use futures::stream::{self, StreamExt};
use slotsync_core::dates::work_day_name;
use slotsync_core::SyncError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::accounts::AccountDirectory;
use crate::config::EngineConfig;
use crate::orchestrator::{SyncReport, SyncTrigger, WindowSyncRequest};

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cron: String,
    pub window_days: u32,
    pub cadence_days: Option<Vec<Weekday>>,
    pub max_concurrent_accounts: usize,
}

impl From<&EngineConfig> for ScheduleConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cron: config.sync_cron.clone(),
            window_days: config.window_days,
            cadence_days: config.cadence_days.clone(),
            max_concurrent_accounts: config.max_concurrent_accounts,
        }
    }
}

#[derive(Debug)]
pub struct ScheduledOutcome {
    pub account_id: String,
    pub result: Result<SyncReport, SyncError>,
}

pub struct SyncScheduler {
    trigger: Arc<dyn SyncTrigger>,
    accounts: Arc<dyn AccountDirectory>,
    config: ScheduleConfig,
}

impl SyncScheduler {
    pub fn new(trigger: Arc<dyn SyncTrigger>, accounts: Arc<dyn AccountDirectory>, config: ScheduleConfig) -> Self {
        Self {
            trigger,
            accounts,
            config,
        }
    }

    /// One request per schedulable account, covering tomorrow through `today + window_days`.
    pub async fn plan(&self, today: NaiveDate) -> Result<Vec<WindowSyncRequest>> {
        let window_start = today + Days::new(1);
        let window_end = today + Days::new(u64::from(self.config.window_days.max(1)));
        let accounts = self.accounts.list().await.context("listing accounts")?;

        let mut requests = Vec::new();
        for account in accounts.into_iter().filter(|a| a.is_schedulable()) {
            let work_days: Vec<Weekday> = match &self.config.cadence_days {
                Some(cadence) => account
                    .work_days
                    .iter()
                    .copied()
                    .filter(|d| cadence.contains(d))
                    .collect(),
                None => account.work_days.clone(),
            };
            if work_days.is_empty() {
                info!(account_id = %account.account_id, "no work days in this cadence, skipping");
                continue;
            }
            let names: Vec<&str> = work_days.iter().map(|d| work_day_name(*d)).collect();
            info!(account_id = %account.account_id, %window_start, %window_end, work_days = ?names, "scheduled");
            requests.push(WindowSyncRequest::new(account.account_id, window_start, window_end).with_work_days(work_days));
        }
        Ok(requests)
    }

    /// Run every planned account, at most `max_concurrent_accounts` at a time.
    /// A failing account never stops the others.
    pub async fn run_once(&self, today: NaiveDate) -> Result<Vec<ScheduledOutcome>> {
        let requests = self.plan(today).await?;
        let limit = self.config.max_concurrent_accounts.max(1);
        let outcomes: Vec<ScheduledOutcome> = stream::iter(requests)
            .map(|request| async move {
                let account_id = request.account_id.clone();
                let result = self.trigger.run_window_sync(request).await;
                match &result {
                    Ok(report) => info!(
                        account_id = %account_id,
                        inserted = report.totals.inserted,
                        updated = report.totals.updated,
                        removed = report.totals.removed,
                        skipped = report.totals.skipped,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(account_id = %account_id, kind = err.kind().as_str(), error = %err, "scheduled sync failed"),
                }
                ScheduledOutcome { account_id, result }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(accounts = outcomes.len(), failed, "scheduled fan-out complete");
        Ok(outcomes)
    }

    /// Cron job that runs [`SyncScheduler::run_once`] for the current UTC date.
    pub async fn build(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = Arc::clone(self);
        let cron = self.config.cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let today = Utc::now().date_naive();
                if let Err(err) = this.run_once(today).await {
                    warn!(error = %format!("{err:#}"), "scheduled fan-out could not start");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    pub async fn start(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = self.build().await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.cron, "sync scheduler started");
        Ok(sched)
    }
}
