//! Postgres-backed [`SlotStore`].

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use slotsync_core::{
    DayDiff, DayScope, ErrorKind, NormalizedSlot, RunOutcome, RunStatus, SlotRecord, SlotStatus, SyncRun,
    SyncTotals,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{advisory_lock_key, classify_observation, tally, AccountLease, ExistingSlot, SlotStore};

#[derive(Debug, Clone)]
pub struct PgSlotStore {
    pool: PgPool,
}

impl PgSlotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")?;
    Ok(())
}

fn db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn read_count(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column)?;
    Ok(u32::try_from(value).unwrap_or_default())
}

fn run_from_row(row: &PgRow) -> Result<SyncRun> {
    let status: String = row.try_get("status")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        status: RunStatus::parse(&status).ok_or_else(|| anyhow!("unknown run status {status}"))?,
        totals: SyncTotals {
            inserted: read_count(row, "inserted")?,
            updated: read_count(row, "updated")?,
            removed: read_count(row, "removed")?,
            skipped: read_count(row, "skipped")?,
            unchanged: read_count(row, "unchanged")?,
        },
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        error_text: row.try_get("error_text")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<SlotRecord> {
    let status: String = row.try_get("status")?;
    Ok(SlotRecord {
        source: row.try_get("source")?,
        unit_code: row.try_get("unit_code")?,
        service_code: row.try_get("service_code")?,
        date: row.try_get("slot_date")?,
        time: row.try_get("slot_time")?,
        external_uid: row.try_get("external_uid")?,
        payload: row.try_get("payload")?,
        content_hash: row.try_get("content_hash")?,
        status: SlotStatus::parse(&status).ok_or_else(|| anyhow!("unknown slot status {status}"))?,
        is_current: row.try_get("is_current")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

const RUN_COLUMNS: &str = "id, account_id, window_start, window_end, status, inserted, updated, removed, \
     skipped, unchanged, error_kind, error_text, started_at, finished_at";

/// Session-level advisory lock pinned to one pooled connection.
struct PgLease {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    account_id: String,
}

impl Drop for PgLease {
    fn drop(&mut self) {
        // Closing the session is the only way to drop a session lock without a round trip.
        if let Some(conn) = self.conn.take() {
            warn!(account_id = %self.account_id, "advisory lock dropped without release; closing its connection");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl AccountLease for PgLease {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("releasing advisory lock for {}", self.account_id))?;
        if !unlocked {
            warn!(account_id = %self.account_id, "advisory lock was not held at release");
        }
        Ok(())
    }
}

#[async_trait]
impl SlotStore for PgSlotStore {
    async fn create_run(
        &self,
        account_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<SyncRun> {
        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sync_runs (id, account_id, window_start, window_end, status, started_at)
            VALUES ($1, $2, $3, $4, 'running', NOW())
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(account_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&self.pool)
        .await
        .context("inserting sync run")?;
        run_from_row(&row)
    }

    async fn finalize_run(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        let totals = outcome.totals();
        let (error_kind, error_text) = match outcome {
            RunOutcome::Success(_) => (None, None),
            RunOutcome::Failed { kind, message, .. } => (Some(kind.as_str()), Some(message.as_str())),
        };
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   inserted = $3,
                   updated = $4,
                   removed = $5,
                   skipped = $6,
                   unchanged = $7,
                   error_kind = $8,
                   error_text = $9,
                   finished_at = NOW()
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(outcome.status().as_str())
        .bind(db_count(totals.inserted))
        .bind(db_count(totals.updated))
        .bind(db_count(totals.removed))
        .bind(db_count(totals.skipped))
        .bind(db_count(totals.unchanged))
        .bind(error_kind)
        .bind(error_text)
        .execute(&self.pool)
        .await
        .context("finalizing sync run")?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading sync run")?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM sync_runs
             WHERE ($1::text IS NULL OR account_id = $1)
             ORDER BY started_at DESC
             LIMIT $2
            "#
        ))
        .bind(account_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("listing sync runs")?;
        rows.iter().map(run_from_row).collect()
    }

    async fn try_lock_account(&self, account_id: &str) -> Result<Option<Box<dyn AccountLease>>> {
        let key = advisory_lock_key(account_id);
        let mut conn = self.pool.acquire().await.context("acquiring lock connection")?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .context("taking advisory lock")?;
        if !locked {
            debug!(account_id, key, "advisory lock busy");
            return Ok(None);
        }
        Ok(Some(Box::new(PgLease {
            conn: Some(conn),
            key,
            account_id: account_id.to_string(),
        })))
    }

    async fn upsert_and_diff_day(
        &self,
        scope: &DayScope,
        rows: &[NormalizedSlot],
        seen_at: DateTime<Utc>,
    ) -> Result<DayDiff> {
        let uids: Vec<String> = rows.iter().map(|r| r.external_uid.clone()).collect();
        let mut tx = self.pool.begin().await.context("opening day transaction")?;

        let existing_rows = sqlx::query(
            r#"
            SELECT external_uid, content_hash, status, is_current
              FROM slot_records
             WHERE source = $1
               AND external_uid = ANY($2)
               FOR UPDATE
            "#,
        )
        .bind(&scope.source)
        .bind(&uids)
        .fetch_all(&mut *tx)
        .await
        .context("loading existing slots")?;

        let mut existing = HashMap::with_capacity(existing_rows.len());
        for row in &existing_rows {
            let status: String = row.try_get("status")?;
            let uid: String = row.try_get("external_uid")?;
            existing.insert(
                uid,
                ExistingSlot {
                    content_hash: row.try_get("content_hash")?,
                    status: SlotStatus::parse(&status).unwrap_or(SlotStatus::Removed),
                    is_current: row.try_get("is_current")?,
                },
            );
        }

        let mut diff = DayDiff::default();
        for slot in rows {
            tally(&mut diff, classify_observation(existing.get(&slot.external_uid), slot));
            sqlx::query(
                r#"
                INSERT INTO slot_records (
                    source, external_uid, unit_code, service_code, slot_date, slot_time,
                    payload, content_hash, status, is_current, first_seen_at, last_seen_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10, $10)
                ON CONFLICT (source, external_uid) DO UPDATE
                   SET slot_time = EXCLUDED.slot_time,
                       payload = EXCLUDED.payload,
                       content_hash = EXCLUDED.content_hash,
                       status = EXCLUDED.status,
                       is_current = TRUE,
                       last_seen_at = EXCLUDED.last_seen_at
                "#,
            )
            .bind(&scope.source)
            .bind(&slot.external_uid)
            .bind(&scope.unit_code)
            .bind(&scope.service_code)
            .bind(scope.date)
            .bind(&slot.time)
            .bind(&slot.payload)
            .bind(&slot.content_hash)
            .bind(slot.status.as_str())
            .bind(seen_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting slot {}", slot.external_uid))?;
        }

        let removed = sqlx::query(
            r#"
            UPDATE slot_records
               SET status = 'removed',
                   is_current = FALSE
             WHERE source = $1
               AND unit_code = $2
               AND service_code = $3
               AND slot_date = $4
               AND is_current
               AND NOT (external_uid = ANY($5))
            "#,
        )
        .bind(&scope.source)
        .bind(&scope.unit_code)
        .bind(&scope.service_code)
        .bind(scope.date)
        .bind(&uids)
        .execute(&mut *tx)
        .await
        .context("soft-deleting vanished slots")?;
        diff.removed = u32::try_from(removed.rows_affected()).unwrap_or(u32::MAX);

        tx.commit().await.context("committing day transaction")?;
        Ok(diff)
    }

    async fn current_slots(&self, scope: &DayScope) -> Result<Vec<SlotRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source, external_uid, unit_code, service_code, slot_date, slot_time,
                   payload, content_hash, status, is_current, first_seen_at, last_seen_at
              FROM slot_records
             WHERE source = $1
               AND unit_code = $2
               AND service_code = $3
               AND slot_date = $4
               AND is_current
             ORDER BY slot_time, external_uid
            "#,
        )
        .bind(&scope.source)
        .bind(&scope.unit_code)
        .bind(&scope.service_code)
        .bind(scope.date)
        .fetch_all(&self.pool)
        .await
        .context("loading current slots")?;
        rows.iter().map(slot_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_saturate_instead_of_wrapping() {
        assert_eq!(db_count(7), 7);
        assert_eq!(db_count(u32::MAX), i32::MAX);
    }

    #[test]
    fn run_columns_cover_every_run_field() {
        for column in [
            "id",
            "account_id",
            "window_start",
            "window_end",
            "status",
            "inserted",
            "updated",
            "removed",
            "skipped",
            "unchanged",
            "error_kind",
            "error_text",
            "started_at",
            "finished_at",
        ] {
            assert!(RUN_COLUMNS.contains(column), "missing {column}");
        }
    }
}
