//! Workstation Monitor: one cycle over the fleet.
//!
//! Per host the steps run strictly in order:
//! `ping -> census -> mount -av -> classify -> remount -> software -> finalize`.
//! An unreachable host stops after the ping. Hosts run concurrently in a
//! bounded pool; each has its own time budget and the whole cycle has a
//! deadline, after which unfinished hosts are reported as unreachable.

use crate::classifier::{self, artifact_path, Classification};
use crate::config::{HostConfig, MonitorConfig, MonitorSettings};
use crate::health::HealthTracker;
use crate::models::{
    Connectivity, HostCycleReport, Issue, IssueKind, NotificationDecision, Severity, SoftwareCheck,
};
use crate::notify::{DispatchOutcome, NotificationScheduler};
use crate::remediation::{RemediationEngine, RemediationPolicy};
use crate::store::{self, HostStatusUpdate, IssueRecord, StateStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use mountwatch_probe::{ProbeOutcome, RemoteProber};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Subject of the `CommandError` raised when the software check itself fails
pub const SOFTWARE_CHECK_SCOPE: &str = "software";

/// What one cycle produced
#[derive(Debug)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    /// Sorted by workstation name
    pub reports: Vec<HostCycleReport>,
    pub decision: NotificationDecision,
    pub dispatch: DispatchOutcome,
    pub duration: Duration,
}

pub struct WorkstationMonitor {
    settings: MonitorSettings,
    hosts: Vec<HostConfig>,
    prober: Arc<dyn RemoteProber>,
    store: Arc<dyn StateStore>,
    scheduler: Arc<NotificationScheduler>,
    remediation: RemediationEngine,
    health: HealthTracker,
}

impl WorkstationMonitor {
    pub fn new(
        config: &MonitorConfig,
        prober: Arc<dyn RemoteProber>,
        store: Arc<dyn StateStore>,
        scheduler: Arc<NotificationScheduler>,
    ) -> Self {
        let remediation = RemediationEngine::new(
            prober.clone(),
            RemediationPolicy {
                attempt_fix: config.monitor.attempt_fix,
            },
        );
        Self {
            settings: config.monitor.clone(),
            hosts: config.workstations.clone(),
            prober,
            store,
            scheduler,
            remediation,
            health: HealthTracker::new(),
        }
    }

    pub fn scheduler(&self) -> &Arc<NotificationScheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run one cycle, deciding delivery from the current local time
    pub async fn run_cycle(&self) -> CycleOutcome {
        let decision = self.scheduler.decision_at(Utc::now());
        self.run_cycle_decided(decision).await
    }

    pub async fn run_cycle_decided(&self, decision: NotificationDecision) -> CycleOutcome {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        async move {
            let started = Instant::now();
            info!(hosts = self.hosts.len(), "cycle started");

            let reports = self.check_fleet().await;
            for report in &reports {
                self.finalize(report);
            }

            let dispatch = self
                .scheduler
                .dispatch_with(&reports, decision, Utc::now())
                .await;
            debug!(?dispatch, "notifications handled");

            let (retention, aggressive) = self.retention();
            match self.store.purge_older_than(retention, aggressive, Utc::now()) {
                Ok(stats) => debug!(removed = stats.total(), "retention purge done"),
                Err(e) => error!(error = %e, "retention purge failed"),
            }

            let duration = started.elapsed();
            self.health.record_cycle(&reports, duration);
            match serde_json::to_string(&self.health.get_health()) {
                Ok(snapshot) => info!(health = %snapshot, "cycle finished"),
                Err(e) => warn!(error = %e, "cannot serialize health snapshot"),
            }

            CycleOutcome {
                cycle_id,
                reports,
                decision,
                dispatch,
                duration,
            }
        }
        .instrument(span)
        .await
    }

    /// Retention in force for the periodic purge
    pub fn retention(&self) -> (Duration, bool) {
        store::effective_retention(
            self.store.as_ref(),
            self.settings.retention,
            self.settings.aggressive_cleanup,
        )
    }

    async fn check_fleet(&self) -> Vec<HostCycleReport> {
        let deadline = tokio::time::Instant::now() + self.settings.cycle_deadline;
        let mut reports: Vec<HostCycleReport> = Vec::with_capacity(self.hosts.len());

        let collect = async {
            let mut checks = stream::iter(self.hosts.iter())
                .map(|host| self.check_host_bounded(host))
                .buffer_unordered(self.settings.max_concurrent_hosts);
            while let Some(report) = checks.next().await {
                reports.push(report);
            }
        };
        if tokio::time::timeout_at(deadline, collect).await.is_err() {
            let done: HashSet<String> = reports.iter().map(|r| r.workstation.clone()).collect();
            let now = Utc::now();
            let reason = format!(
                "cycle deadline of {} reached before the host was checked",
                humantime::format_duration(self.settings.cycle_deadline)
            );
            for host in self.hosts.iter().filter(|h| !done.contains(&h.name)) {
                warn!(workstation = %host.name, "cycle deadline reached");
                reports.push(HostCycleReport::timed_out(&host.name, now, &reason));
            }
        }

        reports.sort_by(|a, b| a.workstation.cmp(&b.workstation));
        reports
    }

    async fn check_host_bounded(&self, host: &HostConfig) -> HostCycleReport {
        let started_at = Utc::now();
        let span = info_span!("host", workstation = %host.name);
        match tokio::time::timeout(self.settings.host_timeout, self.check_host(host))
            .instrument(span)
            .await
        {
            Ok(report) => report,
            Err(_) => {
                warn!(workstation = %host.name, "host check timed out");
                HostCycleReport::timed_out(
                    &host.name,
                    started_at,
                    &format!(
                        "host check exceeded {}",
                        humantime::format_duration(self.settings.host_timeout)
                    ),
                )
            }
        }
    }

    /// Probe, classify and remediate one host. Never touches the store.
    pub async fn check_host(&self, host: &HostConfig) -> HostCycleReport {
        let now = Utc::now();
        let name = host.name.as_str();
        let mut report = HostCycleReport::new(name, now);

        if !self.prober.probe_reachable(name).await {
            info!("host did not answer ping");
            report.connectivity = Connectivity::Unreachable;
            report.issues.push(Issue::new(
                name,
                IssueKind::Connectivity,
                Severity::Warning,
                "Host did not answer ping",
                now,
            ));
            return report;
        }
        report.online = true;

        // None when the census failed: remediation needs a positive answer
        let users_active = match self.prober.probe_active_users(name).await {
            Ok(census) => {
                report.active_users = census.count;
                report.user_sample = census.sample;
                Some(census.count)
            }
            Err(e) => {
                warn!(error = %e, "user census failed");
                None
            }
        };

        let outcome = self.prober.probe_mounts(name).await;
        report.connectivity = match outcome {
            ProbeOutcome::ConnectivityFailure { .. } => Connectivity::SshFailed,
            _ => Connectivity::Connected,
        };

        let Classification {
            mounts,
            sources,
            issues,
        } = classifier::classify(&outcome, &host.expected_mounts(), name, now);
        report.mounts = mounts;
        report.mount_sources = sources;
        report.issues = issues;

        self.remediate_mounts(&mut report, users_active, now).await;

        if report.connectivity == Connectivity::Connected {
            self.check_software(host, &mut report, now).await;
        }

        debug!(
            connectivity = %report.connectivity,
            issues = report.open_issues().count(),
            "host checked"
        );
        report
    }

    async fn remediate_mounts(
        &self,
        report: &mut HostCycleReport,
        users_active: Option<u32>,
        now: DateTime<Utc>,
    ) {
        let attempt_fix = self.remediation.policy().attempt_fix;
        let name = report.workstation.clone();

        for issue in report.issues.iter_mut() {
            if issue.kind != IssueKind::MountFailure {
                continue;
            }
            let users = match users_active {
                Some(users) => users,
                None => {
                    if attempt_fix {
                        report.actions_taken.push(format!(
                            "Remediation skipped for {}: user census unavailable",
                            issue.mount_point.as_deref().unwrap_or("mount")
                        ));
                    }
                    continue;
                }
            };

            let outcome = self.remediation.remediate(&name, issue, users, now).await;
            if outcome.attempted || (attempt_fix && users > 0) {
                report.actions_taken.push(outcome.action);
            }
            if let (Some(mount_point), Some(status)) =
                (issue.mount_point.as_ref(), outcome.refreshed)
            {
                report.mounts.insert(mount_point.clone(), status);
            }
        }
    }

    /// Check every configured artifact under the mounts that are healthy now,
    /// in a single round trip.
    async fn check_software(
        &self,
        host: &HostConfig,
        report: &mut HostCycleReport,
        now: DateTime<Utc>,
    ) {
        let mut wanted: Vec<(String, String, String)> = Vec::new();
        for (mount, artifacts) in &host.software {
            let healthy = report.mounts.get(mount).map(|s| s.is_healthy()).unwrap_or(false);
            if !healthy {
                continue;
            }
            for artifact in artifacts {
                wanted.push((mount.clone(), artifact.clone(), artifact_path(mount, artifact)));
            }
        }
        if wanted.is_empty() {
            return;
        }

        let paths: Vec<String> = wanted.iter().map(|(_, _, path)| path.clone()).collect();
        match self.prober.probe_directory_exists(&host.name, &paths).await {
            Ok(found) => {
                report.software = wanted
                    .into_iter()
                    .map(|(mount_point, artifact, path)| SoftwareCheck {
                        accessible: found.get(&path).copied().unwrap_or(false),
                        mount_point,
                        artifact,
                    })
                    .collect();
                let missing = classifier::software_issues(&host.name, &report.software, now);
                report.issues.extend(missing);
            }
            Err(e) => {
                warn!(error = %e, "software check failed");
                report.issues.push(
                    Issue::new(
                        host.name.as_str(),
                        IssueKind::CommandError,
                        Severity::Warning,
                        format!("software check failed: {}", e),
                        now,
                    )
                    .with_scope(SOFTWARE_CHECK_SCOPE),
                );
            }
        }
    }

    /// Persist one report and resolve stored issues it shows fixed.
    /// Store failures are logged; the next cycle retries.
    pub fn finalize(&self, report: &HostCycleReport) {
        let name = report.workstation.as_str();
        let at = report.timestamp;

        if let Err(e) = self.store.update_host_status(&HostStatusUpdate {
            workstation: name.to_string(),
            checked_at: at,
            online: report.online,
            connectivity: report.connectivity,
            active_users: report.active_users,
            healthy: report.is_healthy(),
        }) {
            error!(workstation = name, error = %e, "failed to update host status");
        }

        for (mount_point, status) in &report.mounts {
            let source = report.mount_sources.get(mount_point).map(String::as_str);
            if let Err(e) = self
                .store
                .record_mount_observation(name, mount_point, *status, source, at)
            {
                error!(
                    workstation = name,
                    mount_point,
                    error = %e,
                    "failed to record mount observation"
                );
            }
        }
        for check in &report.software {
            if let Err(e) = self.store.record_software_check(name, check, at) {
                error!(workstation = name, error = %e, "failed to record software check");
            }
        }

        for issue in &report.issues {
            match self.store.upsert_issue(issue) {
                Ok(occurrences) => {
                    debug!(workstation = name, kind = %issue.kind, occurrences, "issue recorded")
                }
                Err(e) => {
                    error!(
                        workstation = name,
                        kind = %issue.kind,
                        error = %e,
                        "failed to record issue"
                    );
                    continue;
                }
            }
            if let Some(resolved_at) = issue.resolved_at {
                if let Err(e) = self.store.resolve_issue(&issue.key(), resolved_at) {
                    error!(
                        workstation = name,
                        kind = %issue.kind,
                        error = %e,
                        "failed to resolve issue"
                    );
                }
            }
        }

        let still_open: BTreeSet<_> = report.open_issues().map(|i| i.key()).collect();
        let stored = match self.store.open_issues(name) {
            Ok(stored) => stored,
            Err(e) => {
                error!(workstation = name, error = %e, "failed to load open issues");
                return;
            }
        };
        for record in stored {
            if still_open.contains(&record.key) || !verified_fixed(&record, report) {
                continue;
            }
            match self.store.resolve_issue(&record.key, at) {
                Ok(true) => info!(
                    workstation = name,
                    kind = %record.kind(),
                    subject = %record.key.subject,
                    occurrences = record.occurrences,
                    "issue resolved"
                ),
                Ok(false) => {}
                Err(e) => error!(workstation = name, error = %e, "failed to resolve issue"),
            }
        }
    }
}

/// Whether this cycle re-verified the condition behind a stored open issue.
/// Conditions that were not evaluated (mounts of an offline host, say) do
/// not count.
fn verified_fixed(record: &IssueRecord, report: &HostCycleReport) -> bool {
    let connected = report.connectivity == Connectivity::Connected;
    match record.kind() {
        // Only a software check that ran and answered clears its own failure
        IssueKind::CommandError if record.key.subject == SOFTWARE_CHECK_SCOPE => {
            connected && !report.software.is_empty()
        }
        IssueKind::Connectivity | IssueKind::CommandError => connected,
        IssueKind::MountFailure => {
            connected
                && record
                    .mount_point
                    .as_ref()
                    .and_then(|mp| report.mounts.get(mp))
                    .map(|status| status.is_healthy())
                    .unwrap_or(false)
        }
        IssueKind::SoftwareMissing => report.software.iter().any(|check| {
            check.accessible
                && Some(&check.mount_point) == record.mount_point.as_ref()
                && Some(&check.artifact) == record.artifact.as_ref()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueKey;
    use mountwatch_probe::MountStatus;

    fn record(kind: IssueKind, mount_point: Option<&str>, artifact: Option<&str>) -> IssueRecord {
        let now = Utc::now();
        IssueRecord {
            id: 1,
            key: IssueKey {
                workstation: "evan".into(),
                kind,
                subject: String::new(),
            },
            severity: Severity::Critical,
            description: String::new(),
            mount_point: mount_point.map(String::from),
            artifact: artifact.map(String::from),
            first_seen: now,
            last_seen: now,
            occurrences: 1,
            remediation_attempted: false,
            resolved_at: None,
        }
    }

    fn connected() -> HostCycleReport {
        let mut report = HostCycleReport::new("evan", Utc::now());
        report.online = true;
        report.connectivity = Connectivity::Connected;
        report
    }

    #[test]
    fn mount_issue_fixed_only_when_mount_healthy() {
        let issue = record(IssueKind::MountFailure, Some("/data"), None);
        let mut report = connected();
        assert!(!verified_fixed(&issue, &report));

        report.mounts.insert("/data".into(), MountStatus::NotMounted);
        assert!(!verified_fixed(&issue, &report));

        report.mounts.insert("/data".into(), MountStatus::Mounted);
        assert!(verified_fixed(&issue, &report));
    }

    #[test]
    fn offline_host_verifies_nothing() {
        let mut offline = HostCycleReport::timed_out("evan", Utc::now(), "no ping");
        offline.mounts.insert("/data".into(), MountStatus::Mounted);

        assert!(!verified_fixed(&record(IssueKind::Connectivity, None, None), &offline));
        assert!(!verified_fixed(&record(IssueKind::MountFailure, Some("/data"), None), &offline));
        assert!(!verified_fixed(&record(IssueKind::CommandError, None, None), &offline));
    }

    #[test]
    fn software_check_error_needs_a_software_check() {
        let mut issue = record(IssueKind::CommandError, None, None);
        issue.key.subject = SOFTWARE_CHECK_SCOPE.into();
        let mut report = connected();
        assert!(!verified_fixed(&issue, &report));

        report.software.push(SoftwareCheck {
            mount_point: "/usr/local/chem.sw".into(),
            artifact: "orca".into(),
            accessible: false,
        });
        assert!(verified_fixed(&issue, &report));

        // The mount check's own error clears on any connected cycle
        assert!(verified_fixed(&record(IssueKind::CommandError, None, None), &connected()));
    }

    #[test]
    fn software_issue_fixed_when_artifact_found() {
        let issue = record(IssueKind::SoftwareMissing, Some("/usr/local/chem.sw"), Some("orca"));
        let mut report = connected();
        report.software.push(SoftwareCheck {
            mount_point: "/usr/local/chem.sw".into(),
            artifact: "gaussian".into(),
            accessible: true,
        });
        assert!(!verified_fixed(&issue, &report));

        report.software.push(SoftwareCheck {
            mount_point: "/usr/local/chem.sw".into(),
            artifact: "orca".into(),
            accessible: true,
        });
        assert!(verified_fixed(&issue, &report));
    }
}
