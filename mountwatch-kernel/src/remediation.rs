//! Automatic remount of failed mounts, gated by safety policy.

use crate::models::{Issue, IssueKind};
use chrono::{DateTime, Utc};
use mountwatch_probe::{MountStatus, ProbeOutcome, RemoteProber};
use std::sync::Arc;
use tracing::{info, warn};

pub const REMOUNT_SUCCESS_ACTION: &str = "Auto-remounted successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationPolicy {
    pub attempt_fix: bool,
}

/// Why an issue was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    /// Only mount failures can be fixed by a remount
    WrongKind(IssueKind),
    Disabled,
    UsersActive(u32),
}

impl RemediationPolicy {
    pub fn eligibility(&self, issue: &Issue, users_active: u32) -> Result<(), Ineligible> {
        if issue.kind != IssueKind::MountFailure {
            return Err(Ineligible::WrongKind(issue.kind));
        }
        if !self.attempt_fix {
            return Err(Ineligible::Disabled);
        }
        if users_active > 0 {
            return Err(Ineligible::UsersActive(users_active));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationOutcome {
    pub attempted: bool,
    pub succeeded: bool,
    pub action: String,
    /// Status of the mount after the re-check, when one ran
    pub refreshed: Option<MountStatus>,
}

impl RemediationOutcome {
    fn skipped(action: String) -> Self {
        Self {
            attempted: false,
            succeeded: false,
            action,
            refreshed: None,
        }
    }
}

pub struct RemediationEngine {
    prober: Arc<dyn RemoteProber>,
    policy: RemediationPolicy,
}

impl RemediationEngine {
    pub fn new(prober: Arc<dyn RemoteProber>, policy: RemediationPolicy) -> Self {
        Self { prober, policy }
    }

    pub fn policy(&self) -> RemediationPolicy {
        self.policy
    }

    /// Try to repair `issue` in place. Resolves it when the re-check shows
    /// its mount healthy; otherwise it stays open with the attempt recorded.
    pub async fn remediate(
        &self,
        host: &str,
        issue: &mut Issue,
        users_active: u32,
        now: DateTime<Utc>,
    ) -> RemediationOutcome {
        let mount_point = issue.mount_point.clone();
        let target = mount_point.as_deref().unwrap_or("all mounts");

        if let Err(reason) = self.policy.eligibility(issue, users_active) {
            let action = match reason {
                Ineligible::WrongKind(kind) => format!("No remediation for {} issues", kind),
                Ineligible::Disabled => format!("Remediation disabled, {} left as is", target),
                Ineligible::UsersActive(n) => {
                    format!("Remediation skipped for {}: {} active user session(s)", target, n)
                }
            };
            return RemediationOutcome::skipped(action);
        }

        issue.remediation_attempted = true;
        info!(host, mount_point = target, "attempting remount");

        if !self.prober.probe_remount(host, mount_point.as_deref()).await {
            return RemediationOutcome {
                attempted: true,
                succeeded: false,
                action: format!("Remount of {} failed", target),
                refreshed: None,
            };
        }

        let refreshed = match self.prober.probe_mounts(host).await {
            ProbeOutcome::Success { observations } => mount_point.as_deref().map(|mp| {
                observations
                    .iter()
                    .rev()
                    .find(|o| o.mount_point == mp)
                    .map(|o| o.status)
                    .unwrap_or(MountStatus::NotMounted)
            }),
            ProbeOutcome::ConnectivityFailure { message } => {
                warn!(host, %message, "re-check after remount could not reach host");
                None
            }
            ProbeOutcome::CommandFailure { exit_code, .. } => {
                warn!(host, exit_code, "re-check after remount failed");
                None
            }
        };

        match refreshed {
            Some(status) if status.is_healthy() => {
                issue.resolve(now);
                info!(host, mount_point = target, "remount verified");
                RemediationOutcome {
                    attempted: true,
                    succeeded: true,
                    action: REMOUNT_SUCCESS_ACTION.to_string(),
                    refreshed,
                }
            }
            Some(status) => RemediationOutcome {
                attempted: true,
                succeeded: false,
                action: format!("Remounted {} but re-check reports {}", target, status),
                refreshed,
            },
            None => RemediationOutcome {
                attempted: true,
                succeeded: false,
                action: format!("Remounted {} but could not re-check it", target),
                refreshed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use async_trait::async_trait;
    use mountwatch_probe::{parse_mount_output, ProbeError, UserCensus};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Remount answer plus one canned `mount -av` output; counts remounts.
    struct ScriptedProber {
        remount_ok: bool,
        recheck_stdout: &'static str,
        remounts: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedProber {
        fn new(remount_ok: bool, recheck_stdout: &'static str) -> Arc<Self> {
            Arc::new(Self {
                remount_ok,
                recheck_stdout,
                remounts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteProber for ScriptedProber {
        async fn probe_reachable(&self, _host: &str) -> bool {
            true
        }

        async fn probe_mounts(&self, _host: &str) -> ProbeOutcome {
            parse_mount_output(self.recheck_stdout, "", 0)
        }

        async fn probe_directory_exists(
            &self,
            _host: &str,
            _paths: &[String],
        ) -> Result<BTreeMap<String, bool>, ProbeError> {
            Ok(BTreeMap::new())
        }

        async fn probe_active_users(&self, _host: &str) -> Result<UserCensus, ProbeError> {
            Ok(UserCensus::default())
        }

        async fn probe_remount(&self, _host: &str, mount_point: Option<&str>) -> bool {
            self.remounts.lock().push(mount_point.map(String::from));
            self.remount_ok
        }
    }

    fn data_issue() -> Issue {
        Issue::new(
            "evan",
            IssueKind::MountFailure,
            Severity::Critical,
            "/data is not mounted",
            Utc::now(),
        )
        .with_mount_point("/data")
    }

    fn engine(prober: Arc<ScriptedProber>, attempt_fix: bool) -> RemediationEngine {
        RemediationEngine::new(prober, RemediationPolicy { attempt_fix })
    }

    #[tokio::test]
    async fn successful_remount_resolves_issue() {
        let prober = ScriptedProber::new(true, "/data : successfully mounted\n");
        let mut issue = data_issue();

        let outcome = engine(prober.clone(), true)
            .remediate("evan", &mut issue, 0, Utc::now())
            .await;

        assert!(outcome.attempted && outcome.succeeded);
        assert_eq!(outcome.action, REMOUNT_SUCCESS_ACTION);
        assert_eq!(outcome.refreshed, Some(MountStatus::NewlyMounted));
        assert!(!issue.is_open());
        assert!(issue.remediation_attempted);
        assert_eq!(*prober.remounts.lock(), [Some("/data".to_string())]);
    }

    #[tokio::test]
    async fn recheck_still_failing_leaves_issue_open() {
        let prober = ScriptedProber::new(true, "/boot : already mounted\n");
        let mut issue = data_issue();

        let outcome = engine(prober, true).remediate("evan", &mut issue, 0, Utc::now()).await;

        assert!(outcome.attempted);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.refreshed, Some(MountStatus::NotMounted));
        assert!(issue.is_open());
        assert!(issue.remediation_attempted);
    }

    #[tokio::test]
    async fn failed_remount_skips_recheck() {
        let prober = ScriptedProber::new(false, "/data : already mounted\n");
        let mut issue = data_issue();

        let outcome = engine(prober, true).remediate("evan", &mut issue, 0, Utc::now()).await;

        assert!(outcome.attempted && !outcome.succeeded);
        assert_eq!(outcome.refreshed, None);
        assert!(issue.is_open());
    }

    #[tokio::test]
    async fn never_remediates_with_users_logged_in() {
        let prober = ScriptedProber::new(true, "/data : successfully mounted\n");
        let engine = engine(prober.clone(), true);

        for kind in [
            IssueKind::MountFailure,
            IssueKind::Connectivity,
            IssueKind::SoftwareMissing,
            IssueKind::CommandError,
        ] {
            for _ in 0..2 {
                let mut issue = data_issue();
                issue.kind = kind;
                let outcome = engine.remediate("evan", &mut issue, 3, Utc::now()).await;
                assert!(!outcome.attempted);
                assert!(!issue.remediation_attempted);
            }
        }
        assert!(prober.remounts.lock().is_empty());
    }

    #[test]
    fn eligibility_rules() {
        let on = RemediationPolicy { attempt_fix: true };
        let off = RemediationPolicy { attempt_fix: false };
        let mut issue = data_issue();

        assert_eq!(on.eligibility(&issue, 0), Ok(()));
        assert_eq!(off.eligibility(&issue, 0), Err(Ineligible::Disabled));
        assert_eq!(on.eligibility(&issue, 2), Err(Ineligible::UsersActive(2)));

        issue.kind = IssueKind::Connectivity;
        assert_eq!(
            on.eligibility(&issue, 0),
            Err(Ineligible::WrongKind(IssueKind::Connectivity))
        );
    }
}
