//! Maps probe outcomes onto the issue taxonomy.
//!
//! Pure functions: nothing here talks to a host or the store.

use crate::models::{Issue, IssueKind, Severity, SoftwareCheck};
use chrono::{DateTime, Utc};
use mountwatch_probe::{MountStatus, ProbeOutcome};
use std::collections::{BTreeMap, BTreeSet};

/// Mount statuses and issues derived from one mount probe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Status of every observed or expected mount point. Empty unless the
    /// probe succeeded.
    pub mounts: BTreeMap<String, MountStatus>,
    /// Device behind a mount point, when the output named one
    pub sources: BTreeMap<String, String>,
    pub issues: Vec<Issue>,
}

impl Classification {
    pub fn mount_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.kind == IssueKind::MountFailure)
    }

    pub fn healthy_mounts(&self) -> impl Iterator<Item = &str> {
        self.mounts
            .iter()
            .filter(|(_, status)| status.is_healthy())
            .map(|(mount, _)| mount.as_str())
    }
}

pub fn classify(
    outcome: &ProbeOutcome,
    expected_mounts: &BTreeSet<String>,
    workstation: &str,
    now: DateTime<Utc>,
) -> Classification {
    match outcome {
        ProbeOutcome::ConnectivityFailure { message } => Classification {
            issues: vec![Issue::new(
                workstation,
                IssueKind::Connectivity,
                Severity::Warning,
                message.clone(),
                now,
            )],
            ..Default::default()
        },
        ProbeOutcome::CommandFailure { exit_code, stderr } => {
            let detail = stderr.trim();
            let description = if detail.is_empty() {
                format!("mount check exited with code {}", exit_code)
            } else {
                format!("mount check exited with code {}: {}", exit_code, detail)
            };
            Classification {
                issues: vec![Issue::new(
                    workstation,
                    IssueKind::CommandError,
                    Severity::Warning,
                    description,
                    now,
                )],
                ..Default::default()
            }
        }
        ProbeOutcome::Success { observations } => {
            let mut mounts: BTreeMap<String, MountStatus> = observations
                .iter()
                .map(|o| (o.mount_point.clone(), o.status))
                .collect();

            let sources = observations
                .iter()
                .filter_map(|o| Some((o.mount_point.clone(), o.source.clone()?)))
                .collect();

            let mut issues = Vec::new();
            for mount in expected_mounts {
                let status = *mounts
                    .entry(mount.clone())
                    .or_insert(MountStatus::NotMounted);
                let seen = observed(observations, mount);
                if let Some(issue) = mount_failure(workstation, mount, status, seen, now) {
                    issues.push(issue);
                }
            }
            Classification {
                mounts,
                sources,
                issues,
            }
        }
    }
}

fn observed(observations: &[mountwatch_probe::MountObservation], mount: &str) -> bool {
    observations.iter().any(|o| o.mount_point == mount)
}

fn mount_failure(
    workstation: &str,
    mount: &str,
    status: MountStatus,
    observed: bool,
    now: DateTime<Utc>,
) -> Option<Issue> {
    let description = match status {
        MountStatus::Mounted | MountStatus::NewlyMounted => return None,
        _ if !observed => format!("{} is missing from the mount check output", mount),
        MountStatus::NotMounted => format!("{} is not mounted", mount),
        MountStatus::DirectoryMissing => format!("{}: mount point directory does not exist", mount),
        MountStatus::Unknown => format!("{} reported an unrecognised mount state", mount),
    };
    Some(
        Issue::new(workstation, IssueKind::MountFailure, Severity::Critical, description, now)
            .with_mount_point(mount),
    )
}

/// One `SoftwareMissing` issue per artifact that was not found
pub fn software_issues(
    workstation: &str,
    checks: &[SoftwareCheck],
    now: DateTime<Utc>,
) -> Vec<Issue> {
    checks
        .iter()
        .filter(|c| !c.accessible)
        .map(|c| {
            Issue::new(
                workstation,
                IssueKind::SoftwareMissing,
                Severity::Warning,
                format!("{} not accessible under {}", c.artifact, c.mount_point),
                now,
            )
            .with_mount_point(c.mount_point.clone())
            .with_artifact(c.artifact.clone())
        })
        .collect()
}

/// Path of `artifact` below `mount_point`
pub fn artifact_path(mount_point: &str, artifact: &str) -> String {
    format!("{}/{}", mount_point.trim_end_matches('/'), artifact.trim_start_matches('/'))
}
