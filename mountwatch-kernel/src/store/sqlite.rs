//! SQLite-backed [`StateStore`]

use super::{
    HostReliability, HostStatusRecord, HostStatusUpdate, IssueRecord, MountHistoryEntry, PurgeStats,
    QueuedIssue, RecentFailures, RetentionOverride, SoftwareAvailability, StateStore, StoreError,
    window_start,
};
use crate::models::{Connectivity, Issue, IssueKey, IssueKind, Severity, SoftwareCheck};
use chrono::{DateTime, SecondsFormat, Utc};
use mountwatch_probe::MountStatus;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mount_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workstation TEXT NOT NULL,
    mount_point TEXT NOT NULL,
    source TEXT,
    status TEXT NOT NULL,
    observed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observations_host ON mount_observations(workstation, observed_at);

CREATE TABLE IF NOT EXISTS software_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workstation TEXT NOT NULL,
    mount_point TEXT NOT NULL,
    artifact TEXT NOT NULL,
    accessible INTEGER NOT NULL,
    checked_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_software_host ON software_checks(workstation, checked_at);

CREATE TABLE IF NOT EXISTS host_status (
    workstation TEXT PRIMARY KEY,
    online INTEGER NOT NULL,
    connectivity TEXT NOT NULL,
    active_users INTEGER NOT NULL,
    last_checked TEXT NOT NULL,
    last_seen TEXT,
    last_successful_check TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workstation TEXT NOT NULL,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    mount_point TEXT,
    artifact TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    occurrences INTEGER NOT NULL DEFAULT 1,
    remediation_attempted INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_issues_open
    ON issues(workstation, kind, subject) WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS off_hours_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workstation TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    mount_point TEXT,
    detected_at TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    sent_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_pending ON off_hours_queue(sent_at);

CREATE TABLE IF NOT EXISTS retention_override (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    retention_secs INTEGER NOT NULL,
    aggressive INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const HEALTHY_STATUSES: &str = "('mounted', 'newly_mounted')";

const ISSUE_COLUMNS: &str = "id, workstation, kind, subject, severity, description, mount_point, \
     artifact, first_seen, last_seen, occurrences, remediation_attempted, resolved_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn corrupt(table: &'static str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        reason: reason.into(),
    }
}

fn parse_ts(table: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("timestamp {:?}: {}", value, e)))
}

fn parse_opt_ts(
    table: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_ts(table, &v)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(table: &'static str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|e: String| corrupt(table, e))
}

/// Raw `issues` row, decoded after the statement is done with the row
struct IssueRow {
    id: i64,
    workstation: String,
    kind: String,
    subject: String,
    severity: String,
    description: String,
    mount_point: Option<String>,
    artifact: Option<String>,
    first_seen: String,
    last_seen: String,
    occurrences: u32,
    remediation_attempted: bool,
    resolved_at: Option<String>,
}

impl IssueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workstation: row.get(1)?,
            kind: row.get(2)?,
            subject: row.get(3)?,
            severity: row.get(4)?,
            description: row.get(5)?,
            mount_point: row.get(6)?,
            artifact: row.get(7)?,
            first_seen: row.get(8)?,
            last_seen: row.get(9)?,
            occurrences: row.get(10)?,
            remediation_attempted: row.get(11)?,
            resolved_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<IssueRecord, StoreError> {
        Ok(IssueRecord {
            id: self.id,
            key: IssueKey {
                workstation: self.workstation,
                kind: parse_enum("issues", &self.kind)?,
                subject: self.subject,
            },
            severity: parse_enum("issues", &self.severity)?,
            description: self.description,
            mount_point: self.mount_point,
            artifact: self.artifact,
            first_seen: parse_ts("issues", &self.first_seen)?,
            last_seen: parse_ts("issues", &self.last_seen)?,
            occurrences: self.occurrences,
            remediation_attempted: self.remediation_attempted,
            resolved_at: parse_opt_ts("issues", self.resolved_at)?,
        })
    }
}

impl SqliteStore {
    /// Open (or create) the database file and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Invalid(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_issues(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<IssueRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM issues WHERE {} ORDER BY workstation, first_seen, id",
            ISSUE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, IssueRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(IssueRow::decode).collect()
    }
}

impl StateStore for SqliteStore {
    fn record_mount_observation(
        &self,
        workstation: &str,
        mount_point: &str,
        status: MountStatus,
        source: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO mount_observations (workstation, mount_point, source, status, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![workstation, mount_point, source, status.as_str(), ts(at)],
        )?;
        Ok(())
    }

    fn record_software_check(
        &self,
        workstation: &str,
        check: &SoftwareCheck,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO software_checks
                 (workstation, mount_point, artifact, accessible, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![workstation, check.mount_point, check.artifact, check.accessible, ts(at)],
        )?;
        Ok(())
    }

    fn update_host_status(&self, update: &HostStatusUpdate) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO host_status (workstation, online, connectivity, active_users, last_checked,
                                      last_seen, last_successful_check, consecutive_failures)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     CASE WHEN ?2 THEN ?5 END,
                     CASE WHEN ?6 THEN ?5 END,
                     CASE WHEN ?6 THEN 0 ELSE 1 END)
             ON CONFLICT(workstation) DO UPDATE SET
                online = excluded.online,
                connectivity = excluded.connectivity,
                active_users = excluded.active_users,
                last_checked = excluded.last_checked,
                last_seen = COALESCE(excluded.last_seen, host_status.last_seen),
                last_successful_check =
                    COALESCE(excluded.last_successful_check, host_status.last_successful_check),
                consecutive_failures =
                    CASE WHEN ?6 THEN 0 ELSE host_status.consecutive_failures + 1 END",
            params![
                update.workstation,
                update.online,
                update.connectivity.as_str(),
                update.active_users,
                ts(update.checked_at),
                update.healthy,
            ],
        )?;
        Ok(())
    }

    fn upsert_issue(&self, issue: &Issue) -> Result<u32, StoreError> {
        let key = issue.key();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<(i64, u32)> = tx
            .query_row(
                "SELECT id, occurrences FROM issues
                 WHERE workstation = ?1 AND kind = ?2 AND subject = ?3 AND resolved_at IS NULL",
                params![key.workstation, key.kind.as_str(), key.subject],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let occurrences = match existing {
            Some((id, occurrences)) => {
                tx.execute(
                    "UPDATE issues SET occurrences = occurrences + 1, last_seen = ?2, severity = ?3,
                            description = ?4, remediation_attempted = remediation_attempted OR ?5
                     WHERE id = ?1",
                    params![
                        id,
                        ts(issue.detected_at),
                        issue.severity.as_str(),
                        issue.description,
                        issue.remediation_attempted,
                    ],
                )?;
                occurrences + 1
            }
            None => {
                tx.execute(
                    "INSERT INTO issues (workstation, kind, subject, severity, description,
                                         mount_point, artifact, first_seen, last_seen,
                                         occurrences, remediation_attempted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1, ?9)",
                    params![
                        key.workstation,
                        key.kind.as_str(),
                        key.subject,
                        issue.severity.as_str(),
                        issue.description,
                        issue.mount_point,
                        issue.artifact,
                        ts(issue.detected_at),
                        issue.remediation_attempted,
                    ],
                )?;
                1
            }
        };

        tx.commit()?;
        Ok(occurrences)
    }

    fn resolve_issue(&self, key: &IssueKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE issues SET resolved_at = ?4
             WHERE workstation = ?1 AND kind = ?2 AND subject = ?3 AND resolved_at IS NULL",
            params![key.workstation, key.kind.as_str(), key.subject, ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn enqueue_off_hours_issue(
        &self,
        issue: &Issue,
        queued_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO off_hours_queue (workstation, kind, severity, description, mount_point,
                                          detected_at, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                issue.workstation,
                issue.kind.as_str(),
                issue.severity.as_str(),
                issue.description,
                issue.mount_point,
                ts(issue.detected_at),
                ts(queued_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn mark_off_hours_flushed(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut marked = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE off_hours_queue SET sent_at = ?2 WHERE id = ?1 AND sent_at IS NULL",
            )?;
            for id in ids {
                marked += stmt.execute(params![id, ts(at)])?;
            }
        }
        tx.commit()?;
        Ok(marked)
    }

    fn purge_older_than(
        &self,
        retention: Duration,
        aggressive: bool,
        now: DateTime<Utc>,
    ) -> Result<PurgeStats, StoreError> {
        let cutoff = ts(window_start(now, retention)?);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut stats = PurgeStats {
            observations: tx.execute(
                "DELETE FROM mount_observations WHERE observed_at < ?1",
                [&cutoff],
            )?,
            software_checks: tx.execute(
                "DELETE FROM software_checks WHERE checked_at < ?1",
                [&cutoff],
            )?,
            issues: tx.execute(
                "DELETE FROM issues WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
                [&cutoff],
            )?,
            queued: tx.execute(
                "DELETE FROM off_hours_queue WHERE sent_at IS NOT NULL AND sent_at < ?1",
                [&cutoff],
            )?,
            hosts: 0,
        };
        if aggressive {
            stats.issues += tx.execute(
                "DELETE FROM issues WHERE resolved_at IS NULL AND last_seen < ?1",
                [&cutoff],
            )?;
            stats.queued +=
                tx.execute("DELETE FROM off_hours_queue WHERE queued_at < ?1", [&cutoff])?;
            stats.hosts =
                tx.execute("DELETE FROM host_status WHERE last_checked < ?1", [&cutoff])?;
        }
        tx.commit()?;

        if aggressive {
            conn.execute_batch("VACUUM;")?;
        }
        if stats.total() > 0 {
            info!(cutoff = %cutoff, aggressive, removed = stats.total(), "purged old records");
        } else {
            debug!(cutoff = %cutoff, "nothing to purge");
        }
        Ok(stats)
    }

    fn open_issues(&self, workstation: &str) -> Result<Vec<IssueRecord>, StoreError> {
        self.query_issues("workstation = ?1 AND resolved_at IS NULL", params![workstation])
    }

    fn unresolved_issues(&self) -> Result<Vec<IssueRecord>, StoreError> {
        self.query_issues("resolved_at IS NULL", params![])
    }

    fn host_statuses(&self) -> Result<Vec<HostStatusRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT workstation, online, connectivity, active_users, last_checked, last_seen,
                    last_successful_check, consecutive_failures
             FROM host_status ORDER BY workstation",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, u32>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(workstation, online, connectivity, users, checked, seen, success, failures)| {
                Ok(HostStatusRecord {
                    workstation,
                    online,
                    connectivity: parse_enum::<Connectivity>("host_status", &connectivity)?,
                    active_users: users,
                    last_checked: parse_ts("host_status", &checked)?,
                    last_seen: parse_opt_ts("host_status", seen)?,
                    last_successful_check: parse_opt_ts("host_status", success)?,
                    consecutive_failures: failures,
                })
            })
            .collect()
    }

    fn pending_off_hours(&self) -> Result<Vec<QueuedIssue>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workstation, kind, severity, description, mount_point,
                    detected_at, queued_at
             FROM off_hours_queue WHERE sent_at IS NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, workstation, kind, severity, description, mount_point, detected, queued)| {
                Ok(QueuedIssue {
                    id,
                    workstation,
                    kind: parse_enum::<IssueKind>("off_hours_queue", &kind)?,
                    severity: parse_enum::<Severity>("off_hours_queue", &severity)?,
                    description,
                    mount_point,
                    detected_at: parse_ts("off_hours_queue", &detected)?,
                    queued_at: parse_ts("off_hours_queue", &queued)?,
                })
            })
            .collect()
    }

    fn recent_failures(&self, since: DateTime<Utc>) -> Result<Vec<RecentFailures>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT workstation, COUNT(*), COUNT(DISTINCT mount_point), MAX(observed_at)
             FROM mount_observations
             WHERE observed_at >= ?1 AND status NOT IN {}
             GROUP BY workstation ORDER BY COUNT(*) DESC, workstation",
            HEALTHY_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([ts(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(workstation, failures, affected_mounts, latest)| {
                Ok(RecentFailures {
                    workstation,
                    failures,
                    affected_mounts,
                    latest: parse_ts("mount_observations", &latest)?,
                })
            })
            .collect()
    }

    fn reliability(&self, since: DateTime<Utc>) -> Result<Vec<HostReliability>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT workstation, COUNT(*), SUM(CASE WHEN status IN {} THEN 1 ELSE 0 END)
             FROM mount_observations WHERE observed_at >= ?1
             GROUP BY workstation ORDER BY workstation",
            HEALTHY_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([ts(since)], |row| {
                Ok(HostReliability {
                    workstation: row.get(0)?,
                    total_checks: row.get(1)?,
                    successful: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn software_summary(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SoftwareAvailability>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mount_point, artifact, COUNT(*), SUM(accessible)
             FROM software_checks WHERE checked_at >= ?1
             GROUP BY mount_point, artifact ORDER BY mount_point, artifact",
        )?;
        let rows = stmt
            .query_map([ts(since)], |row| {
                Ok(SoftwareAvailability {
                    mount_point: row.get(0)?,
                    artifact: row.get(1)?,
                    checks: row.get(2)?,
                    available: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn mount_history(
        &self,
        workstation: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MountHistoryEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT observed_at, mount_point, source, status FROM mount_observations
             WHERE workstation = ?1 AND observed_at >= ?2
             ORDER BY observed_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![workstation, ts(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(observed, mount_point, source, status)| {
                Ok(MountHistoryEntry {
                    observed_at: parse_ts("mount_observations", &observed)?,
                    mount_point,
                    source,
                    status: parse_enum::<MountStatus>("mount_observations", &status)?,
                })
            })
            .collect()
    }

    fn retention_override(&self) -> Result<Option<RetentionOverride>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT retention_secs, aggressive, updated_at
                 FROM retention_override WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(secs, aggressive, updated)| {
            let secs = u64::try_from(secs).map_err(|_| {
                corrupt("retention_override", format!("negative retention {}", secs))
            })?;
            Ok(RetentionOverride {
                retention: Duration::from_secs(secs),
                aggressive,
                updated_at: parse_ts("retention_override", &updated)?,
            })
        })
        .transpose()
    }

    fn set_retention_override(
        &self,
        retention: Duration,
        aggressive: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let secs = i64::try_from(retention.as_secs())
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                StoreError::Invalid(format!("retention of {:?} is out of range", retention))
            })?;
        window_start(at, retention)?;
        self.conn.lock().execute(
            "INSERT INTO retention_override (id, retention_secs, aggressive, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                retention_secs = excluded.retention_secs,
                aggressive = excluded.aggressive,
                updated_at = excluded.updated_at",
            params![secs, aggressive, ts(at)],
        )?;
        info!(retention_secs = secs, aggressive, "retention override saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn data_failure(detected: &str) -> Issue {
        Issue::new(
            "evan",
            IssueKind::MountFailure,
            Severity::Critical,
            "/data is not mounted",
            at(detected),
        )
        .with_mount_point("/data")
    }

    fn count(store: &SqliteStore, table: &str) -> i64 {
        store
            .conn
            .lock()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn repeated_detections_bump_one_open_row() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert_eq!(store.upsert_issue(&data_failure("2026-10-16T01:00:00Z")).unwrap(), 1);
        assert_eq!(store.upsert_issue(&data_failure("2026-10-16T02:00:00Z")).unwrap(), 2);
        assert_eq!(store.upsert_issue(&data_failure("2026-10-16T03:00:00Z")).unwrap(), 3);

        let open = store.open_issues("evan").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].occurrences, 3);
        assert_eq!(open[0].first_seen, at("2026-10-16T01:00:00Z"));
        assert_eq!(open[0].last_seen, at("2026-10-16T03:00:00Z"));
        assert_eq!(open[0].kind(), IssueKind::MountFailure);
    }

    #[test]
    fn resolve_only_closes_existing_open_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let issue = data_failure("2026-10-16T01:00:00Z");

        assert!(!store.resolve_issue(&issue.key(), at("2026-10-16T01:30:00Z")).unwrap());
        assert_eq!(count(&store, "issues"), 0);

        store.upsert_issue(&issue).unwrap();
        assert!(store.resolve_issue(&issue.key(), at("2026-10-16T02:00:00Z")).unwrap());
        assert!(store.open_issues("evan").unwrap().is_empty());

        // A recurrence opens a fresh row
        assert_eq!(store.upsert_issue(&data_failure("2026-10-16T05:00:00Z")).unwrap(), 1);
        assert_eq!(count(&store, "issues"), 2);
    }

    #[test]
    fn host_status_tracks_failures_and_last_seen() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut update = HostStatusUpdate {
            workstation: "sarah".into(),
            checked_at: at("2026-10-16T01:00:00Z"),
            online: true,
            connectivity: Connectivity::Connected,
            active_users: 1,
            healthy: true,
        };
        store.update_host_status(&update).unwrap();

        update.checked_at = at("2026-10-16T02:00:00Z");
        update.online = false;
        update.connectivity = Connectivity::Unreachable;
        update.healthy = false;
        store.update_host_status(&update).unwrap();
        update.checked_at = at("2026-10-16T03:00:00Z");
        store.update_host_status(&update).unwrap();

        let status = &store.host_statuses().unwrap()[0];
        assert!(!status.online);
        assert_eq!(status.connectivity, Connectivity::Unreachable);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_checked, at("2026-10-16T03:00:00Z"));
        assert_eq!(status.last_seen, Some(at("2026-10-16T01:00:00Z")));
        assert_eq!(status.last_successful_check, Some(at("2026-10-16T01:00:00Z")));
    }

    #[test]
    fn flushed_entries_leave_the_pending_queue() {
        let store = SqliteStore::open_in_memory().unwrap();
        let queue = |detected: &str, queued: &str| {
            store
                .enqueue_off_hours_issue(&data_failure(detected), at(queued))
                .unwrap()
        };
        let first = queue("2026-10-16T01:00:00Z", "2026-10-16T01:00:05Z");
        let second = queue("2026-10-16T02:00:00Z", "2026-10-16T02:00:05Z");

        assert_eq!(store.pending_off_hours().unwrap().len(), 2);
        let flushed = store
            .mark_off_hours_flushed(&[first, second], at("2026-10-16T07:00:00Z"))
            .unwrap();
        assert_eq!(flushed, 2);
        assert!(store.pending_off_hours().unwrap().is_empty());
        assert_eq!(store.mark_off_hours_flushed(&[first], at("2026-10-16T08:00:00Z")).unwrap(), 0);
    }

    #[test]
    fn purge_keeps_open_issues_unless_aggressive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = at("2026-10-01T00:00:00Z");
        let now = at("2026-10-16T00:00:00Z");

        store
            .record_mount_observation("evan", "/data", MountStatus::NotMounted, None, old)
            .unwrap();
        store
            .record_mount_observation("evan", "/data", MountStatus::Mounted, None, now)
            .unwrap();
        store
            .record_software_check(
                "evan",
                &SoftwareCheck {
                    mount_point: "/usr/local/chem.sw".into(),
                    artifact: "orca".into(),
                    accessible: true,
                },
                old,
            )
            .unwrap();
        store.upsert_issue(&data_failure("2026-10-01T00:00:00Z")).unwrap();

        let retention = Duration::from_secs(72 * 3600);
        let stats = store.purge_older_than(retention, false, now).unwrap();
        assert_eq!(stats.observations, 1);
        assert_eq!(stats.software_checks, 1);
        assert_eq!(stats.issues, 0);
        assert_eq!(store.unresolved_issues().unwrap().len(), 1);

        let stats = store.purge_older_than(retention, true, now).unwrap();
        assert_eq!(stats.issues, 1);
        assert!(store.unresolved_issues().unwrap().is_empty());
        assert_eq!(count(&store, "mount_observations"), 1);
    }

    #[test]
    fn purge_rejects_a_retention_beyond_the_calendar() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = at("2026-10-16T00:00:00Z");
        store
            .record_mount_observation("evan", "/data", MountStatus::Mounted, None, now)
            .unwrap();

        let huge = humantime::parse_duration("300000y").unwrap();
        let err = store.purge_older_than(huge, true, now).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        let err = store.purge_older_than(Duration::from_secs(u64::MAX), false, now).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(count(&store, "mount_observations"), 1);
    }

    fn observe(store: &SqliteStore, host: &str, mount: &str, status: MountStatus, when: &str) {
        store
            .record_mount_observation(host, mount, status, Some("nas:/export"), at(when))
            .unwrap();
    }

    #[test]
    fn failure_and_reliability_summaries_count_unhealthy_observations() {
        let store = SqliteStore::open_in_memory().unwrap();
        observe(&store, "evan", "/data", MountStatus::Mounted, "2026-10-15T01:00:00Z");
        observe(&store, "evan", "/data", MountStatus::NotMounted, "2026-10-15T02:00:00Z");
        observe(&store, "evan", "/scratch", MountStatus::DirectoryMissing, "2026-10-15T03:00:00Z");
        observe(&store, "evan", "/data", MountStatus::NewlyMounted, "2026-10-15T04:00:00Z");
        observe(&store, "sarah", "/data", MountStatus::Mounted, "2026-10-15T01:00:00Z");
        // Outside the window
        observe(&store, "sarah", "/data", MountStatus::NotMounted, "2026-10-01T01:00:00Z");

        let since = at("2026-10-14T00:00:00Z");
        let recent = store.recent_failures(since).unwrap();
        assert_eq!(
            recent,
            vec![RecentFailures {
                workstation: "evan".into(),
                failures: 2,
                affected_mounts: 2,
                latest: at("2026-10-15T03:00:00Z"),
            }]
        );

        let reliability = store.reliability(since).unwrap();
        assert_eq!(reliability.len(), 2);
        assert_eq!(reliability[0].workstation, "evan");
        assert_eq!((reliability[0].successful, reliability[0].total_checks), (2, 4));
        assert_eq!(reliability[0].success_rate(), 50.0);
        assert_eq!(reliability[1].success_rate(), 100.0);
    }

    #[test]
    fn software_summary_groups_by_artifact() {
        let store = SqliteStore::open_in_memory().unwrap();
        let check = |artifact: &str, accessible: bool, when: &str| {
            let check = SoftwareCheck {
                mount_point: "/usr/local/chem.sw".into(),
                artifact: artifact.into(),
                accessible,
            };
            store.record_software_check("evan", &check, at(when)).unwrap();
        };
        check("orca", true, "2026-10-15T01:00:00Z");
        check("orca", false, "2026-10-15T02:00:00Z");
        check("gaussian", true, "2026-10-15T01:00:00Z");

        let summary = store.software_summary(at("2026-10-14T00:00:00Z")).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].artifact, "gaussian");
        assert_eq!(summary[0].availability(), 100.0);
        assert_eq!((summary[1].available, summary[1].checks), (1, 2));
    }

    #[test]
    fn mount_history_lists_newest_first_with_devices() {
        let store = SqliteStore::open_in_memory().unwrap();
        observe(&store, "evan", "/data", MountStatus::NotMounted, "2026-10-15T01:00:00Z");
        observe(&store, "evan", "/data", MountStatus::NewlyMounted, "2026-10-15T02:00:00Z");
        observe(&store, "sarah", "/data", MountStatus::Mounted, "2026-10-15T02:00:00Z");

        let history = store.mount_history("evan", at("2026-10-14T00:00:00Z")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, MountStatus::NewlyMounted);
        assert_eq!(history[0].source.as_deref(), Some("nas:/export"));
        assert_eq!(history[1].observed_at, at("2026-10-15T01:00:00Z"));
    }

    #[test]
    fn retention_override_is_a_single_replaceable_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.retention_override().unwrap(), None);

        let week = Duration::from_secs(7 * 24 * 3600);
        store.set_retention_override(week, false, at("2026-10-15T00:00:00Z")).unwrap();
        store
            .set_retention_override(Duration::from_secs(3600), true, at("2026-10-16T00:00:00Z"))
            .unwrap();

        let saved = store.retention_override().unwrap().unwrap();
        assert_eq!(saved.retention, Duration::from_secs(3600));
        assert!(saved.aggressive);
        assert_eq!(saved.updated_at, at("2026-10-16T00:00:00Z"));
        assert_eq!(count(&store, "retention_override"), 1);

        let huge = humantime::parse_duration("300000y").unwrap();
        assert!(store.set_retention_override(huge, false, at("2026-10-16T00:00:00Z")).is_err());
        let zero = store.set_retention_override(Duration::ZERO, false, at("2026-10-16T00:00:00Z"));
        assert!(zero.is_err());
    }

    #[test]
    fn file_backed_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("mountwatch.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_issue(&data_failure("2026-10-16T01:00:00Z")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.upsert_issue(&data_failure("2026-10-16T02:00:00Z")).unwrap(), 2);
    }
}
