use chrono::Utc;
use mountwatch_devkit::{ConfigBuilder, ProbeCall, TestHarness};
use mountwatch_kernel::remediation::REMOUNT_SUCCESS_ACTION;
use mountwatch_kernel::store::StateStore;
use mountwatch_kernel::{Connectivity, DispatchOutcome, FlushOutcome, IssueKind, Severity};
use mountwatch_probe::{MountStatus, ProbeError};

fn single_host(name: &str, mounts: &[&str]) -> TestHarness {
    TestHarness::new(ConfigBuilder::new().workstation(name, mounts).build()).unwrap()
}

#[tokio::test]
async fn adam_healthy_host_has_no_issues() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("adam", &["/usr/local/chem.sw", "/boot"])
            .build(),
    )
    .unwrap();
    harness
        .prober
        .mount_output("adam", "/usr/local/chem.sw : already mounted\n/boot : already mounted\n");

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert!(report.online);
    assert_eq!(report.connectivity, Connectivity::Connected);
    assert!(report.issues.is_empty());
    assert_eq!(report.mounts["/usr/local/chem.sw"], MountStatus::Mounted);
    assert_eq!(report.mounts["/boot"], MountStatus::Mounted);
    assert_eq!(outcome.dispatch, DispatchOutcome::NothingToReport);
    harness.assert_mail_count(0).unwrap();
}

#[tokio::test]
async fn sarah_offline_stops_after_ping() {
    let harness = single_host("sarah", &["/data"]);
    harness.prober.unreachable("sarah");

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert!(!report.online);
    assert_eq!(report.connectivity, Connectivity::Unreachable);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::Connectivity);
    assert_eq!(report.issues[0].severity, Severity::Warning);
    assert!(report.actions_taken.is_empty());
    assert_eq!(
        harness.prober.calls_for("sarah"),
        [ProbeCall::Reachable("sarah".into())]
    );

    let status = &harness.store.host_statuses().unwrap()[0];
    assert!(!status.online);
    assert_eq!(status.consecutive_failures, 1);
}

#[tokio::test]
async fn evan_missing_data_is_remounted_and_resolved() {
    let harness = single_host("evan", &["/boot", "/data"]);
    harness
        .prober
        .mount_output("evan", "/boot : already mounted\n")
        .mount_output("evan", "/boot : already mounted\n/data : successfully mounted\n")
        .remount_succeeds("evan", true);

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert_eq!(report.issues.len(), 1);
    let issue = &report.issues[0];
    assert_eq!(issue.kind, IssueKind::MountFailure);
    assert_eq!(issue.mount_point.as_deref(), Some("/data"));
    assert!(issue.remediation_attempted);
    assert!(issue.resolved_at.is_some());
    assert_eq!(report.actions_taken, [REMOUNT_SUCCESS_ACTION]);
    assert_eq!(report.mounts["/data"], MountStatus::NewlyMounted);
    assert_eq!(harness.prober.remounts("evan"), [Some("/data".to_string())]);

    // Resolved in the same cycle: nothing open, nothing to alert about
    assert!(harness.open_issues("evan").unwrap().is_empty());
    assert_eq!(outcome.dispatch, DispatchOutcome::NothingToReport);
}

#[tokio::test]
async fn failed_remount_stays_open_and_counts_up() {
    let harness = single_host("evan", &["/data"]);
    harness.prober.mount_output("evan", "").remount_succeeds("evan", false);

    harness.cycle().await;
    let outcome = harness.cycle().await;

    let report = &outcome.reports[0];
    assert!(report.issues[0].is_open());
    assert!(report.issues[0].remediation_attempted);
    assert_eq!(report.actions_taken, ["Remount of /data failed"]);

    let open = harness.open_issues("evan").unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].occurrences, 2);
    assert!(open[0].remediation_attempted);
    assert_eq!(harness.mailer.count(), 2);
    assert!(harness.mailer.last().unwrap().subject.contains("(1 critical)"));
}

#[tokio::test]
async fn logged_in_users_block_remediation() {
    let harness = single_host("evan", &["/data"]);
    harness
        .prober
        .mount_output("evan", "/data : mount failed\n")
        .users("evan", &["alice", "bob"])
        .remount_succeeds("evan", true);

    for _ in 0..3 {
        let outcome = harness.cycle().await;
        let report = &outcome.reports[0];
        assert_eq!(report.active_users, 2);
        assert!(report.issues.iter().all(|i| !i.remediation_attempted));
    }
    assert!(harness.prober.remounts("evan").is_empty());
}

#[tokio::test]
async fn failed_census_blocks_remediation() {
    let harness = single_host("evan", &["/data"]);
    harness
        .prober
        .mount_output("evan", "")
        .census_fails("evan", ProbeError::Command { exit_code: 1, stderr: "who: failed".into() })
        .remount_succeeds("evan", true);

    let outcome = harness.cycle().await;
    assert!(harness.prober.remounts("evan").is_empty());
    assert_eq!(
        outcome.reports[0].actions_taken,
        ["Remediation skipped for /data: user census unavailable"]
    );
}

#[tokio::test]
async fn ssh_failure_never_yields_mount_failures() {
    let harness = single_host("fred", &["/data", "/boot"]);
    harness.prober.mount_result(
        "fred",
        255,
        "",
        "ssh: connect to host fred port 22: Connection refused",
    );

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert!(report.online);
    assert_eq!(report.connectivity, Connectivity::SshFailed);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::Connectivity);
    assert!(!report.issues.iter().any(|i| i.kind == IssueKind::MountFailure));
    assert!(harness.prober.remounts("fred").is_empty());
}

#[tokio::test]
async fn software_checked_only_under_healthy_mounts() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("adam", &["/usr/local/chem.sw", "/opt/apps"])
            .software("/usr/local/chem.sw", &["gaussian", "orca"])
            .software("/opt/apps", &["matlab"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness
        .prober
        .mount_output("adam", "/usr/local/chem.sw : already mounted\n/opt/apps : mount failed\n")
        .missing_path("adam", "/usr/local/chem.sw/orca");

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    let kinds: Vec<_> = report.issues.iter().map(|i| (i.kind, i.severity)).collect();
    assert_eq!(
        kinds,
        [
            (IssueKind::MountFailure, Severity::Critical),
            (IssueKind::SoftwareMissing, Severity::Warning)
        ]
    );
    assert_eq!(report.software.len(), 2);
    assert!(report.software.iter().all(|c| c.mount_point == "/usr/local/chem.sw"));

    let probed: Vec<_> = harness
        .prober
        .calls_for("adam")
        .into_iter()
        .filter_map(|c| match c {
            ProbeCall::Directories(_, paths) => Some(paths),
            _ => None,
        })
        .collect();
    assert_eq!(
        probed,
        [vec!["/usr/local/chem.sw/gaussian".to_string(), "/usr/local/chem.sw/orca".to_string()]]
    );
}

#[tokio::test]
async fn externally_fixed_mount_resolves_next_cycle() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("evan", &["/data"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness
        .prober
        .mount_output("evan", "/data : mount failed\n")
        .mount_output("evan", "/data : already mounted\n");

    harness.cycle().await;
    assert_eq!(harness.open_issues("evan").unwrap().len(), 1);

    let outcome = harness.cycle().await;
    assert!(outcome.reports[0].issues.is_empty());
    assert!(harness.open_issues("evan").unwrap().is_empty());
}

#[tokio::test]
async fn offline_cycle_leaves_mount_issues_alone() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("evan", &["/data"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness.prober.mount_output("evan", "");
    harness.cycle().await;

    harness.prober.unreachable("evan");
    harness.cycle().await;

    let kinds: Vec<_> = harness
        .open_issues("evan")
        .unwrap()
        .into_iter()
        .map(|r| r.kind())
        .collect();
    assert_eq!(kinds, [IssueKind::MountFailure, IssueKind::Connectivity]);
}

#[tokio::test]
async fn suppressed_criticals_are_summarized_once() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("adam", &["/data"])
            .workstation("bob", &["/data"])
            .workstation("carl", &["/data"])
            .workstation("dina", &["/data"])
            .workstation("evan", &["/data"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    for host in ["adam", "bob", "carl"] {
        harness.prober.mount_output(host, "/data : already mounted\n");
    }
    for host in ["dina", "evan"] {
        harness.prober.mount_output(host, "/data : mount failed\n");
    }

    let outcome = harness.suppressed_cycle().await;
    let names: Vec<_> = outcome.reports.iter().map(|r| r.workstation.as_str()).collect();
    assert_eq!(names, ["adam", "bob", "carl", "dina", "evan"]);
    assert_eq!(outcome.dispatch, DispatchOutcome::Queued { issues: 2 });
    harness.assert_mail_count(0).unwrap();
    assert_eq!(harness.store.pending_off_hours().unwrap().len(), 2);

    let flushed = harness.scheduler.flush_summary(Utc::now()).await.unwrap();
    assert_eq!(flushed, FlushOutcome::Sent { groups: 2, entries: 2 });
    harness.assert_mail_count(1).unwrap();
    let summary = harness.mailer.last().unwrap();
    assert_eq!(
        summary.subject,
        "[mountwatch] Off-hours summary: 2 issue group(s) on 2 workstation(s)"
    );
    assert!(summary.body.contains("dina:"));
    assert!(summary.body.contains("evan:"));
    assert!(summary.body.contains("mount_failure: 1 occurrence(s)"));

    assert_eq!(harness.scheduler.flush_summary(Utc::now()).await.unwrap(), FlushOutcome::Empty);
    harness.assert_mail_count(1).unwrap();
}

#[tokio::test]
async fn failed_summary_delivery_keeps_entries_queued() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("evan", &["/data"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness.prober.mount_output("evan", "");
    harness.suppressed_cycle().await;
    harness.suppressed_cycle().await;

    harness.mailer.set_failing(true);
    let failed = harness.scheduler.flush_summary(Utc::now()).await.unwrap();
    assert!(matches!(failed, FlushOutcome::DeliveryFailed { .. }));
    assert_eq!(harness.store.pending_off_hours().unwrap().len(), 2);

    harness.mailer.set_failing(false);
    let sent = harness.scheduler.flush_summary(Utc::now()).await.unwrap();
    assert_eq!(sent, FlushOutcome::Sent { groups: 1, entries: 2 });
    assert!(harness.mailer.last().unwrap().body.contains("mount_failure: 2 occurrence(s)"));
}

#[tokio::test]
async fn immediate_alert_groups_by_host() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("dina", &["/data"])
            .workstation("sarah", &["/data"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness.prober.mount_output("dina", "/data : mount failed\n");
    harness.prober.unreachable("sarah");

    let outcome = harness.cycle().await;
    assert_eq!(outcome.dispatch, DispatchOutcome::Sent { hosts: 2, issues: 2 });

    let alert = harness.mailer.last().unwrap();
    assert_eq!(
        alert.subject,
        "[mountwatch] NAS mount issues on 2 workstation(s) (1 critical)"
    );
    assert_eq!(alert.recipients, ["ops@example.org"]);
    let critical = alert.body.find("CRITICAL ISSUES:").unwrap();
    let warnings = alert.body.find("WARNINGS:").unwrap();
    assert!(critical < warnings);
    assert!(alert.body.contains("Cannot Verify: 1"));
    assert!(alert.body.contains("Verified Broken: 1"));
}

#[tokio::test(start_paused = true)]
async fn slow_host_times_out_without_blocking_fleet() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("adam", &["/boot"])
            .workstation("slow", &["/boot"])
            .host_timeout(std::time::Duration::from_secs(5))
            .build(),
    )
    .unwrap();
    harness.prober.mount_output("adam", "/boot : already mounted\n");
    harness.prober.delay("slow", std::time::Duration::from_secs(60));

    let outcome = harness.cycle().await;
    assert_eq!(outcome.reports.len(), 2);
    assert!(outcome.reports[0].issues.is_empty());

    let slow = &outcome.reports[1];
    assert_eq!(slow.workstation, "slow");
    assert_eq!(slow.connectivity, Connectivity::Unreachable);
    assert_eq!(slow.issues[0].kind, IssueKind::Connectivity);
    assert!(slow.issues[0].description.contains("host check exceeded"));
}

#[tokio::test(start_paused = true)]
async fn cycle_deadline_reports_unfinished_hosts() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("a", &["/boot"])
            .workstation("b", &["/boot"])
            .max_concurrent_hosts(1)
            .host_timeout(std::time::Duration::from_secs(600))
            .cycle_deadline(std::time::Duration::from_secs(30))
            .build(),
    )
    .unwrap();
    harness.prober.delay("a", std::time::Duration::from_secs(20));
    harness.prober.delay("b", std::time::Duration::from_secs(20));

    let outcome = harness.cycle().await;
    let names: Vec<_> = outcome.reports.iter().map(|r| r.workstation.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert!(outcome
        .reports
        .iter()
        .any(|r| r.issues.iter().any(|i| i.description.contains("cycle deadline"))));
}

#[tokio::test]
async fn broken_fstab_is_a_single_command_error() {
    let harness = single_host("evan", &["/boot", "/data"]);
    harness
        .prober
        .mount_result("evan", 1, "", "mount: /etc/fstab: parse error at line 7\n")
        .remount_succeeds("evan", true);

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert_eq!(report.connectivity, Connectivity::Connected);
    let kinds: Vec<_> = report.issues.iter().map(|i| (i.kind, i.severity)).collect();
    assert_eq!(kinds, [(IssueKind::CommandError, Severity::Warning)]);
    assert!(report.mounts.is_empty());
    assert!(harness.prober.remounts("evan").is_empty());
    assert!(report.actions_taken.is_empty());
}

#[tokio::test]
async fn stderr_failures_add_to_reported_mounts() {
    let harness = single_host("evan", &["/boot", "/data"]);
    harness.prober.mount_result(
        "evan",
        32,
        "/boot : already mounted\n",
        "mount: /data: mount point does not exist.\n",
    );

    let outcome = harness.cycle().await;
    let report = &outcome.reports[0];

    assert_eq!(report.mounts["/boot"], MountStatus::Mounted);
    assert_eq!(report.mounts["/data"], MountStatus::DirectoryMissing);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, IssueKind::MountFailure);
    assert_eq!(report.issues[0].mount_point.as_deref(), Some("/data"));
}

#[tokio::test]
async fn software_check_error_waits_for_a_successful_check() {
    let harness = TestHarness::new(
        ConfigBuilder::new()
            .workstation("evan", &["/usr/local/chem.sw"])
            .software("/usr/local/chem.sw", &["orca"])
            .attempt_fix(false)
            .build(),
    )
    .unwrap();
    harness
        .prober
        .mount_output("evan", "/usr/local/chem.sw : already mounted\n")
        .mount_output("evan", "/usr/local/chem.sw : mount failed\n")
        .mount_output("evan", "/usr/local/chem.sw : already mounted\n")
        .directory_check_fails(
            "evan",
            ProbeError::Command {
                exit_code: 1,
                stderr: "bash: test: permission denied".into(),
            },
        );

    let open_kinds = || -> Vec<(IssueKind, String)> {
        harness
            .open_issues("evan")
            .unwrap()
            .into_iter()
            .map(|r| (r.kind(), r.key.subject))
            .collect()
    };

    harness.cycle().await;
    assert_eq!(open_kinds(), [(IssueKind::CommandError, "software".to_string())]);

    // Connected, but the unhealthy mount means no software check ran
    let outcome = harness.cycle().await;
    assert!(outcome.reports[0].software.is_empty());
    assert_eq!(
        open_kinds(),
        [
            (IssueKind::CommandError, "software".to_string()),
            (IssueKind::MountFailure, "/usr/local/chem.sw".to_string()),
        ]
    );

    harness.prober.directory_check_recovers("evan");
    let outcome = harness.cycle().await;
    assert!(outcome.reports[0].software.iter().all(|c| c.accessible));
    assert!(open_kinds().is_empty());
}

#[tokio::test]
async fn mount_devices_reach_the_history() {
    let harness = single_host("evan", &["/data"]);
    harness.prober.mount_output(
        "evan",
        "mount: nas01:/export/data mounted on /data.\n/data : successfully mounted\n",
    );

    harness.cycle().await;

    let since = Utc::now() - chrono::Duration::hours(1);
    let history = harness.store.mount_history("evan", since).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MountStatus::NewlyMounted);
    assert_eq!(history[0].source.as_deref(), Some("nas01:/export/data"));
}
