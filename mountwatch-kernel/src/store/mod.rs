//! Durable state: observations, host status, the issue ledger and the
//! off-hours queue.
//!
//! The monitor and the scheduler only see the [`StateStore`] trait; the
//! SQLite implementation lives in [`sqlite`].

use crate::models::{Connectivity, Issue, IssueKey, IssueKind, Severity, SoftwareCheck};
use chrono::{DateTime, Utc};
use mountwatch_probe::MountStatus;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("invalid argument: {0}")]
    Invalid(String),
}

/// Start of a window of length `span` ending at `now`
pub fn window_start(now: DateTime<Utc>, span: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| {
            let span = humantime::format_duration(span);
            StoreError::Invalid(format!("window of {} is out of range", span))
        })
}

/// Retention window and cleanup mode: a saved override wins over the
/// configured pair, which also covers an unreadable override
pub fn effective_retention(
    store: &dyn StateStore,
    retention: Duration,
    aggressive: bool,
) -> (Duration, bool) {
    match store.retention_override() {
        Ok(Some(saved)) => (saved.retention, saved.aggressive),
        Ok(None) => (retention, aggressive),
        Err(e) => {
            warn!(error = %e, "cannot read retention override, using config");
            (retention, aggressive)
        }
    }
}

/// Host-level facts written once per host per cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatusUpdate {
    pub workstation: String,
    pub checked_at: DateTime<Utc>,
    pub online: bool,
    pub connectivity: Connectivity,
    pub active_users: u32,
    /// Connected with nothing left open
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatusRecord {
    pub workstation: String,
    pub online: bool,
    pub connectivity: Connectivity,
    pub active_users: u32,
    pub last_checked: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// One row of the issue ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueRecord {
    pub id: i64,
    pub key: IssueKey,
    pub severity: Severity,
    pub description: String,
    pub mount_point: Option<String>,
    pub artifact: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u32,
    pub remediation_attempted: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl IssueRecord {
    pub fn kind(&self) -> IssueKind {
        self.key.kind
    }
}

/// An issue detected while alerts were suppressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedIssue {
    pub id: i64,
    pub workstation: String,
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub mount_point: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub observations: usize,
    pub software_checks: usize,
    pub issues: usize,
    pub queued: usize,
    pub hosts: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.observations + self.software_checks + self.issues + self.queued + self.hosts
    }
}

/// Failed mount observations of one workstation inside a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentFailures {
    pub workstation: String,
    pub failures: u32,
    pub affected_mounts: u32,
    pub latest: DateTime<Utc>,
}

/// Share of healthy mount observations for one workstation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReliability {
    pub workstation: String,
    pub total_checks: u32,
    pub successful: u32,
}

impl HostReliability {
    /// Percentage of healthy observations, 0 when nothing was observed
    pub fn success_rate(&self) -> f64 {
        percent(self.successful, self.total_checks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftwareAvailability {
    pub mount_point: String,
    pub artifact: String,
    pub checks: u32,
    pub available: u32,
}

impl SoftwareAvailability {
    pub fn availability(&self) -> f64 {
        percent(self.available, self.checks)
    }
}

fn percent(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) * 100.0 / f64::from(whole)
    }
}

/// One stored mount observation, newest first when listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountHistoryEntry {
    pub observed_at: DateTime<Utc>,
    pub mount_point: String,
    pub source: Option<String>,
    pub status: MountStatus,
}

/// Retention saved through the `config` command; wins over the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionOverride {
    pub retention: Duration,
    pub aggressive: bool,
    pub updated_at: DateTime<Utc>,
}

/// Persistence collaborator. Every write is one logical, durable operation.
pub trait StateStore: Send + Sync {
    fn record_mount_observation(
        &self,
        workstation: &str,
        mount_point: &str,
        status: MountStatus,
        source: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn record_software_check(
        &self,
        workstation: &str,
        check: &SoftwareCheck,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn update_host_status(&self, update: &HostStatusUpdate) -> Result<(), StoreError>;

    /// Open or bump the ledger row for the issue's key; returns its
    /// occurrence count.
    fn upsert_issue(&self, issue: &Issue) -> Result<u32, StoreError>;

    /// Close the open row for `key`. Returns false when there is none.
    fn resolve_issue(&self, key: &IssueKey, at: DateTime<Utc>) -> Result<bool, StoreError>;

    fn enqueue_off_hours_issue(
        &self,
        issue: &Issue,
        queued_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Mark queued entries sent. Already-sent entries are left untouched.
    fn mark_off_hours_flushed(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StoreError>;

    fn purge_older_than(
        &self,
        retention: Duration,
        aggressive: bool,
        now: DateTime<Utc>,
    ) -> Result<PurgeStats, StoreError>;

    fn open_issues(&self, workstation: &str) -> Result<Vec<IssueRecord>, StoreError>;

    fn unresolved_issues(&self) -> Result<Vec<IssueRecord>, StoreError>;

    fn host_statuses(&self) -> Result<Vec<HostStatusRecord>, StoreError>;

    fn pending_off_hours(&self) -> Result<Vec<QueuedIssue>, StoreError>;

    /// Workstations with failed mount observations since `since`, most failures first
    fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<RecentFailures>, StoreError>;

    /// Per-workstation share of healthy mount observations since `since`
    fn reliability(&self, since: DateTime<Utc>) -> Result<Vec<HostReliability>, StoreError>;

    fn software_summary(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SoftwareAvailability>, StoreError>;

    fn mount_history(
        &self,
        workstation: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MountHistoryEntry>, StoreError>;

    fn retention_override(&self) -> Result<Option<RetentionOverride>, StoreError>;

    fn set_retention_override(
        &self,
        retention: Duration,
        aggressive: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
