//! Issue taxonomy and per-host cycle reports

use chrono::{DateTime, Utc};
use mountwatch_probe::MountStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Host could not be asked (ping/ssh/timeout). Cannot verify, not broken.
    Connectivity,
    /// Expected mount absent or broken. Verified broken.
    MountFailure,
    SoftwareMissing,
    /// Probe ran but the remote command failed for a non-transport reason.
    CommandError,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::Connectivity => "connectivity",
            IssueKind::MountFailure => "mount_failure",
            IssueKind::SoftwareMissing => "software_missing",
            IssueKind::CommandError => "command_error",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connectivity" => Ok(IssueKind::Connectivity),
            "mount_failure" => Ok(IssueKind::MountFailure),
            "software_missing" => Ok(IssueKind::SoftwareMissing),
            "command_error" => Ok(IssueKind::CommandError),
            other => Err(format!("unknown issue kind: {}", other)),
        }
    }
}

/// Identity of an issue across cycles: same key, same ledger row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct IssueKey {
    pub workstation: String,
    pub kind: IssueKind,
    /// Mount point, `mount/artifact` for software, empty for host-wide issues
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub workstation: String,
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub mount_point: Option<String>,
    /// Artifact name for `SoftwareMissing`
    pub artifact: Option<String>,
    /// Names the probe behind a host-wide issue, so issues from different
    /// probes keep separate ledger rows
    pub scope: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub remediation_attempted: bool,
}

impl Issue {
    pub fn new(
        workstation: impl Into<String>,
        kind: IssueKind,
        severity: Severity,
        description: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workstation: workstation.into(),
            kind,
            severity,
            description: description.into(),
            mount_point: None,
            artifact: None,
            scope: None,
            detected_at,
            resolved_at: None,
            remediation_attempted: false,
        }
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(at);
        }
    }

    pub fn key(&self) -> IssueKey {
        let subject = match (&self.mount_point, &self.artifact) {
            (Some(mount), Some(artifact)) => {
                format!("{}/{}", mount.trim_end_matches('/'), artifact)
            }
            (Some(mount), None) => mount.clone(),
            (None, Some(artifact)) => artifact.clone(),
            (None, None) => self.scope.clone().unwrap_or_default(),
        };
        IssueKey {
            workstation: self.workstation.clone(),
            kind: self.kind,
            subject,
        }
    }
}

/// How far the monitor got talking to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connected,
    SshFailed,
    Unreachable,
    Unknown,
}

impl Connectivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Connectivity::Connected => "connected",
            Connectivity::SshFailed => "ssh_failed",
            Connectivity::Unreachable => "unreachable",
            Connectivity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Connectivity::Connected),
            "ssh_failed" => Ok(Connectivity::SshFailed),
            "unreachable" => Ok(Connectivity::Unreachable),
            "unknown" => Ok(Connectivity::Unknown),
            other => Err(format!("unknown connectivity: {}", other)),
        }
    }
}

/// Result of checking one software artifact through a healthy mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftwareCheck {
    pub mount_point: String,
    pub artifact: String,
    pub accessible: bool,
}

/// Everything learned about one host in one cycle. Built once, then only read.
#[derive(Debug, Clone, Serialize)]
pub struct HostCycleReport {
    pub workstation: String,
    pub timestamp: DateTime<Utc>,
    pub online: bool,
    pub connectivity: Connectivity,
    pub active_users: u32,
    pub user_sample: Vec<String>,
    pub mounts: BTreeMap<String, MountStatus>,
    /// Device behind a mount point, when the mount check named one
    pub mount_sources: BTreeMap<String, String>,
    pub software: Vec<SoftwareCheck>,
    pub issues: Vec<Issue>,
    pub actions_taken: Vec<String>,
}

impl HostCycleReport {
    pub fn new(workstation: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            workstation: workstation.into(),
            timestamp,
            online: false,
            connectivity: Connectivity::Unknown,
            active_users: 0,
            user_sample: Vec::new(),
            mounts: BTreeMap::new(),
            mount_sources: BTreeMap::new(),
            software: Vec::new(),
            issues: Vec::new(),
            actions_taken: Vec::new(),
        }
    }

    /// Report for a host the monitor gave up on (probe budget or cycle deadline)
    pub fn timed_out(workstation: &str, timestamp: DateTime<Utc>, reason: &str) -> Self {
        let mut report = Self::new(workstation, timestamp);
        report.connectivity = Connectivity::Unreachable;
        report.issues.push(Issue::new(
            workstation,
            IssueKind::Connectivity,
            Severity::Warning,
            reason,
            timestamp,
        ));
        report
    }

    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_open())
    }

    pub fn has_open_issues(&self) -> bool {
        self.open_issues().next().is_some()
    }

    pub fn has_critical(&self) -> bool {
        self.open_issues().any(|i| i.severity == Severity::Critical)
    }

    /// Online and nothing left open
    pub fn is_healthy(&self) -> bool {
        self.online && self.connectivity == Connectivity::Connected && !self.has_open_issues()
    }

    pub fn cannot_verify(&self) -> bool {
        self.open_issues().any(|i| i.kind == IssueKind::Connectivity)
    }

    pub fn verified_broken(&self) -> bool {
        self.open_issues().any(|i| i.kind == IssueKind::MountFailure)
    }
}

/// Whether a cycle's issues go out now or wait for the off-hours summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationDecision {
    pub deliver_now: bool,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    SuppressionDisabled,
    WorkingHours,
    OffHoursWindow,
    Weekend,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionReason::SuppressionDisabled => "suppression disabled",
            DecisionReason::WorkingHours => "outside off-hours window",
            DecisionReason::OffHoursWindow => "inside off-hours window",
            DecisionReason::Weekend => "weekend rule",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-16T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn issue_keys_distinguish_subjects() {
        let mount = Issue::new("adam", IssueKind::MountFailure, Severity::Critical, "x", now())
            .with_mount_point("/data");
        let software = Issue::new("adam", IssueKind::SoftwareMissing, Severity::Warning, "y", now())
            .with_mount_point("/usr/local/chem.sw/")
            .with_artifact("orca");
        let host = Issue::new("adam", IssueKind::Connectivity, Severity::Warning, "z", now());
        let scoped = Issue::new("adam", IssueKind::CommandError, Severity::Warning, "w", now())
            .with_scope("software");

        assert_eq!(mount.key().subject, "/data");
        assert_eq!(software.key().subject, "/usr/local/chem.sw/orca");
        assert_eq!(host.key().subject, "");
        assert_eq!(scoped.key().subject, "software");
        let plain = Issue::new("adam", IssueKind::CommandError, Severity::Warning, "v", now());
        assert_ne!(scoped.key(), plain.key());
    }

    #[test]
    fn resolve_is_sticky() {
        let mut issue = Issue::new("evan", IssueKind::MountFailure, Severity::Critical, "x", now());
        assert!(issue.is_open());

        issue.resolve(now());
        let first = issue.resolved_at;
        issue.resolve(now() + chrono::Duration::hours(1));
        assert_eq!(issue.resolved_at, first);
        assert!(!issue.is_open());
    }

    #[test]
    fn enum_strings_parse_back() {
        for kind in [
            IssueKind::Connectivity,
            IssueKind::MountFailure,
            IssueKind::SoftwareMissing,
            IssueKind::CommandError,
        ] {
            assert_eq!(kind.as_str().parse::<IssueKind>(), Ok(kind));
        }
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("ssh_failed".parse::<Connectivity>(), Ok(Connectivity::SshFailed));
        assert!(Severity::Critical > Severity::Warning);
    }

    #[test]
    fn timed_out_report_is_cannot_verify() {
        let report = HostCycleReport::timed_out("sarah", now(), "cycle deadline exceeded");
        assert!(!report.online);
        assert!(report.cannot_verify());
        assert!(!report.verified_broken());
        assert!(!report.has_critical());
    }
}
