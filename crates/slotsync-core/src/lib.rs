//! Core domain model for the portal slot synchronizer.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod dates;
pub mod error;
pub mod identity;

pub use error::{ErrorKind, Severity, SyncError};

pub const CRATE_NAME: &str = "slotsync-core";

/// Origin tag used when no explicit source is configured.
pub const DEFAULT_SOURCE: &str = "portal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked,
    Removed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
            SlotStatus::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "available" => Some(SlotStatus::Available),
            "booked" => Some(SlotStatus::Booked),
            "removed" => Some(SlotStatus::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reconciled unit of truth. `(source, external_uid)` is the stable logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub source: String,
    pub unit_code: String,
    pub service_code: String,
    pub date: NaiveDate,
    pub time: String,
    pub external_uid: String,
    pub payload: serde_json::Value,
    pub content_hash: String,
    pub status: SlotStatus,
    pub is_current: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Identity-resolved observation ready to be reconciled into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSlot {
    pub external_uid: String,
    pub time: String,
    pub payload: serde_json::Value,
    pub content_hash: String,
    pub status: SlotStatus,
}

/// The `(source, unit, service, date)` combination a single day reconciliation covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayScope {
    pub source: String,
    pub unit_code: String,
    pub service_code: String,
    pub date: NaiveDate,
}

/// Outcome of reconciling one day of observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayDiff {
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub removed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTotals {
    pub inserted: u32,
    pub updated: u32,
    pub removed: u32,
    pub skipped: u32,
    pub unchanged: u32,
}

impl SyncTotals {
    pub fn absorb(&mut self, diff: &DayDiff) {
        self.inserted += diff.inserted;
        self.updated += diff.updated;
        self.removed += diff.removed;
        self.unchanged += diff.unchanged;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One execution of the engine over a window for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub account_id: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub status: RunStatus,
    pub totals: SyncTotals,
    pub error_kind: Option<ErrorKind>,
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal state written exactly once when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success(SyncTotals),
    Failed {
        totals: SyncTotals,
        kind: ErrorKind,
        message: String,
    },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success(_) => RunStatus::Success,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn totals(&self) -> SyncTotals {
        match self {
            RunOutcome::Success(totals) => *totals,
            RunOutcome::Failed { totals, .. } => *totals,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-account portal configuration, owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub account_id: String,
    pub display_name: String,
    pub credentials: Credentials,
    pub unit_code: String,
    pub service_code: String,
    pub work_days: Vec<Weekday>,
    pub active: bool,
    pub sync_enabled: bool,
}

impl AccountConfig {
    pub fn is_schedulable(&self) -> bool {
        self.active && self.sync_enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// Opaque authenticated state that lets a new browser skip the login flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub cookies: Vec<SessionCookie>,
    pub landing_url: Option<String>,
}

impl SessionTokens {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "12345678909".into(),
            password: "hunter2".into(),
        };
        let text = format!("{creds:?}");
        assert!(text.contains("12345678909"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn totals_absorb_day_diffs() {
        let mut totals = SyncTotals::default();
        totals.absorb(&DayDiff {
            inserted: 2,
            updated: 1,
            unchanged: 3,
            removed: 1,
        });
        totals.absorb(&DayDiff {
            inserted: 1,
            ..Default::default()
        });
        assert_eq!(totals.inserted, 3);
        assert_eq!(totals.updated, 1);
        assert_eq!(totals.unchanged, 3);
        assert_eq!(totals.removed, 1);
        assert_eq!(totals.skipped, 0);
    }

    #[test]
    fn slot_status_round_trips_through_text() {
        for status in [SlotStatus::Available, SlotStatus::Booked, SlotStatus::Removed] {
            assert_eq!(SlotStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SlotStatus::parse("BOOKED"), Some(SlotStatus::Booked));
        assert_eq!(SlotStatus::parse("gone"), None);
    }
}
