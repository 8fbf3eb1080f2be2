//! Plain-text renderings for operators: the cycle report, the immediate
//! alert and the off-hours summary.

use crate::models::{HostCycleReport, Issue, IssueKind, Severity};
use crate::store::{
    HostReliability, MountHistoryEntry, QueuedIssue, RecentFailures, SoftwareAvailability,
};
use chrono::{DateTime, Local, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

const RULE_WIDTH: usize = 70;

/// Subject and body of one outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "CRITICAL",
        Severity::Warning => "WARNING",
    }
}

/// Fleet totals for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub total: usize,
    pub online: usize,
    pub cannot_verify: usize,
    pub verified_broken: usize,
    pub with_issues: usize,
    pub critical_hosts: usize,
}

impl CycleSummary {
    pub fn of(reports: &[HostCycleReport]) -> Self {
        Self {
            total: reports.len(),
            online: reports.iter().filter(|r| r.online).count(),
            cannot_verify: reports.iter().filter(|r| r.cannot_verify()).count(),
            verified_broken: reports.iter().filter(|r| r.verified_broken()).count(),
            with_issues: reports.iter().filter(|r| r.has_open_issues()).count(),
            critical_hosts: reports.iter().filter(|r| r.has_critical()).count(),
        }
    }

    pub fn offline(&self) -> usize {
        self.total - self.online
    }
}

pub fn render_cycle_report(
    reports: &[HostCycleReport],
    generated_at: DateTime<Utc>,
    control_host: &str,
) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let summary = CycleSummary::of(reports);
    let mut out = String::new();

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "NAS Workstation Mount Status Report");
    let _ = writeln!(out, "Generated: {}", local(generated_at));
    let _ = writeln!(out, "Control Host: {}", control_host);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out);
    let _ = writeln!(out, "SUMMARY:");
    let _ = writeln!(out, "  Total Workstations: {}", summary.total);
    let _ = writeln!(out, "  Online: {}", summary.online);
    let _ = writeln!(out, "  Offline: {}", summary.offline());
    let _ = writeln!(out, "  Cannot Verify: {}", summary.cannot_verify);
    let _ = writeln!(out, "  Verified Broken: {}", summary.verified_broken);
    let _ = writeln!(out, "  With Issues: {}", summary.with_issues);
    let _ = writeln!(out);

    let attention: Vec<&HostCycleReport> = reports
        .iter()
        .filter(|r| r.has_open_issues() || !r.actions_taken.is_empty())
        .collect();

    if summary.with_issues == 0 {
        let _ = writeln!(out, "All workstations have healthy NAS mounts");
    }
    if !attention.is_empty() {
        let _ = writeln!(out, "WORKSTATIONS NEEDING ATTENTION:");
        let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
        for report in attention {
            render_host(&mut out, report);
        }
    }

    let _ = writeln!(out);
    let _ = write!(out, "{}", rule);
    out
}

fn render_host(out: &mut String, report: &HostCycleReport) {
    let _ = writeln!(out);
    let _ = writeln!(out, "{}:", report.workstation);
    let _ = writeln!(out, "  Online: {}", report.online);
    let _ = writeln!(out, "  Connectivity: {}", report.connectivity);
    if report.online {
        if report.user_sample.is_empty() {
            let _ = writeln!(out, "  Active Users: {}", report.active_users);
        } else {
            let _ = writeln!(
                out,
                "  Active Users: {} ({})",
                report.active_users,
                report.user_sample.join(", ")
            );
        }
    }

    let unhealthy: Vec<_> = report.mounts.iter().filter(|(_, s)| !s.is_healthy()).collect();
    if !unhealthy.is_empty() {
        let _ = writeln!(out, "  Mounts:");
        for (mount, status) in unhealthy {
            match report.mount_sources.get(mount) {
                Some(source) => {
                    let _ = writeln!(out, "    - {} ({}): {}", mount, source, status);
                }
                None => {
                    let _ = writeln!(out, "    - {}: {}", mount, status);
                }
            }
        }
    }

    let open: Vec<&Issue> = report.open_issues().collect();
    if !open.is_empty() {
        let _ = writeln!(out, "  Issues:");
        for issue in open {
            let verdict = match issue.kind {
                IssueKind::Connectivity => " (cannot verify)",
                IssueKind::MountFailure => " (verified broken)",
                _ => "",
            };
            let _ = writeln!(
                out,
                "    - [{}] {}{}",
                severity_label(issue.severity),
                issue.description,
                verdict
            );
        }
    }

    if !report.actions_taken.is_empty() {
        let _ = writeln!(out, "  Actions Taken:");
        for action in &report.actions_taken {
            let _ = writeln!(out, "    - {}", action);
        }
    }
}

/// Immediate alert for the open issues in `reports`; `None` when there is
/// nothing open.
pub fn render_alert(
    reports: &[HostCycleReport],
    prefix: &str,
    generated_at: DateTime<Utc>,
    control_host: &str,
) -> Option<Message> {
    let affected: Vec<&HostCycleReport> = reports.iter().filter(|r| r.has_open_issues()).collect();
    if affected.is_empty() {
        return None;
    }
    let critical = reports
        .iter()
        .flat_map(|r| r.open_issues())
        .filter(|i| i.severity == Severity::Critical)
        .count();

    let subject = format!(
        "{} NAS mount issues on {} workstation(s) ({} critical)",
        prefix,
        affected.len(),
        critical
    );

    let mut body = String::new();
    let sections = [("CRITICAL ISSUES", Severity::Critical), ("WARNINGS", Severity::Warning)];
    for (title, severity) in sections {
        let mut section = String::new();
        for report in &affected {
            let issues: Vec<&Issue> =
                report.open_issues().filter(|i| i.severity == severity).collect();
            if issues.is_empty() {
                continue;
            }
            let _ = writeln!(section, "{}:", report.workstation);
            for issue in issues {
                let _ = writeln!(section, "  - {}", issue.description);
            }
        }
        if !section.is_empty() {
            let _ = writeln!(body, "{}:", title);
            body.push_str(&section);
            body.push('\n');
        }
    }
    body.push_str(&render_cycle_report(reports, generated_at, control_host));

    Some(Message { subject, body })
}

/// Queued entries grouped by workstation and kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryGroup {
    pub workstation: String,
    pub kind: IssueKind,
    pub severity: Severity,
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub descriptions: BTreeSet<String>,
}

pub fn group_queued(queued: &[QueuedIssue]) -> Vec<SummaryGroup> {
    let mut groups: BTreeMap<(String, IssueKind), SummaryGroup> = BTreeMap::new();
    for entry in queued {
        let group = groups
            .entry((entry.workstation.clone(), entry.kind))
            .or_insert_with(|| SummaryGroup {
                workstation: entry.workstation.clone(),
                kind: entry.kind,
                severity: entry.severity,
                occurrences: 0,
                first_seen: entry.detected_at,
                last_seen: entry.detected_at,
                descriptions: BTreeSet::new(),
            });
        group.occurrences += 1;
        group.severity = group.severity.max(entry.severity);
        group.first_seen = group.first_seen.min(entry.detected_at);
        group.last_seen = group.last_seen.max(entry.detected_at);
        group.descriptions.insert(entry.description.clone());
    }
    groups.into_values().collect()
}

/// Off-hours summary; `None` when the queue is empty
pub fn render_summary(queued: &[QueuedIssue], prefix: &str) -> Option<Message> {
    if queued.is_empty() {
        return None;
    }
    let groups = group_queued(queued);
    let hosts: BTreeSet<&str> = groups.iter().map(|g| g.workstation.as_str()).collect();

    let subject = format!(
        "{} Off-hours summary: {} issue group(s) on {} workstation(s)",
        prefix,
        groups.len(),
        hosts.len()
    );

    let mut body = String::new();
    let _ = writeln!(body, "Issues detected while alerts were suppressed");
    let _ = writeln!(body, "{}", "=".repeat(RULE_WIDTH));
    let mut current: Option<&str> = None;
    for group in &groups {
        if current != Some(group.workstation.as_str()) {
            let _ = writeln!(body);
            let _ = writeln!(body, "{}:", group.workstation);
            current = Some(group.workstation.as_str());
        }
        let _ = writeln!(
            body,
            "  [{}] {}: {} occurrence(s), first {}, last {}",
            severity_label(group.severity),
            group.kind,
            group.occurrences,
            local(group.first_seen),
            local(group.last_seen)
        );
        for description in &group.descriptions {
            let _ = writeln!(body, "    - {}", description);
        }
    }

    Some(Message { subject, body })
}

pub fn render_recent_failures(rows: &[RecentFailures], hours: u32) -> String {
    if rows.is_empty() {
        return format!("No mount failures in the last {} hour(s).", hours);
    }
    let mut out = format!("Mount failures in the last {} hour(s):\n", hours);
    let _ = writeln!(
        out,
        "{:<20} {:>8} {:>7}  {}",
        "WORKSTATION", "FAILURES", "MOUNTS", "LATEST"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<20} {:>8} {:>7}  {}",
            row.workstation,
            row.failures,
            row.affected_mounts,
            local(row.latest)
        );
    }
    out
}

pub fn render_reliability(rows: &[HostReliability], days: u32) -> String {
    if rows.is_empty() {
        return format!("No mount checks in the last {} day(s).", days);
    }
    let mut out = format!("Mount reliability over the last {} day(s):\n", days);
    let _ = writeln!(
        out,
        "{:<20} {:>7} {:>10} {:>8}",
        "WORKSTATION", "CHECKS", "SUCCESSFUL", "RATE"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<20} {:>7} {:>10} {:>7.1}%",
            row.workstation,
            row.total_checks,
            row.successful,
            row.success_rate()
        );
    }
    out
}

pub fn render_software_summary(rows: &[SoftwareAvailability], days: u32) -> String {
    if rows.is_empty() {
        return format!("No software checks in the last {} day(s).", days);
    }
    let mut out = format!("Software availability over the last {} day(s):\n", days);
    let _ = writeln!(
        out,
        "{:<24} {:<20} {:>7} {:>9} {:>8}",
        "MOUNT", "ARTIFACT", "CHECKS", "AVAILABLE", "RATE"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<24} {:<20} {:>7} {:>9} {:>7.1}%",
            row.mount_point,
            row.artifact,
            row.checks,
            row.available,
            row.availability()
        );
    }
    out
}

pub fn render_mount_history(workstation: &str, rows: &[MountHistoryEntry], hours: u32) -> String {
    if rows.is_empty() {
        return format!("No mount observations for {} in the last {} hour(s).", workstation, hours);
    }
    let mut out = format!("Mount history for {} over the last {} hour(s):\n", workstation, hours);
    for row in rows {
        let _ = writeln!(
            out,
            "{}  {:<24} {:<16} {}",
            local(row.observed_at),
            row.mount_point,
            row.status.as_str(),
            row.source.as_deref().unwrap_or("-")
        );
    }
    out
}
