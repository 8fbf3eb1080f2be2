//! Remote probes against one workstation
//!
//! Each probe is a single timeout-bounded command. Transport problems are
//! always surfaced (as a `ConnectivityFailure` outcome or
//! `ProbeError::Transport`), never folded into "no issue".

use crate::execution::{CommandOutput, CommandRunner, LocalRunner};
use crate::observation::{ProbeError, ProbeOutcome, UserCensus};
use crate::parser::{self, looks_like_transport_error};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Probe operations the monitor needs from a workstation.
#[async_trait]
pub trait RemoteProber: Send + Sync {
    /// Cheap reachability check (single echo request).
    async fn probe_reachable(&self, host: &str) -> bool;

    /// Verify fstab mounts with `mount -av`.
    async fn probe_mounts(&self, host: &str) -> ProbeOutcome;

    /// Check that each path exists on the host, in one round trip.
    async fn probe_directory_exists(
        &self,
        host: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, bool>, ProbeError>;

    /// Count logged-in sessions.
    async fn probe_active_users(&self, host: &str) -> Result<UserCensus, ProbeError>;

    /// Remount one mount point, or everything in fstab when `None`.
    async fn probe_remount(&self, host: &str, mount_point: Option<&str>) -> bool;
}

/// Timeouts and connection options for [`SshProber`]
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub ssh_options: Vec<String>,
    pub ssh_timeout: Duration,
    pub ping_timeout: Duration,
    pub software_timeout: Duration,
    pub remount_timeout: Duration,
    pub user_sample: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ssh_options: [
                "-o",
                "ConnectTimeout=10",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                "-o",
                "PasswordAuthentication=no",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ssh_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            software_timeout: Duration::from_secs(10),
            remount_timeout: Duration::from_secs(60),
            user_sample: 3,
        }
    }
}

/// Probes workstations over `ssh`, reachability over `ping`
pub struct SshProber {
    runner: Arc<dyn CommandRunner>,
    settings: ProbeSettings,
}

impl SshProber {
    pub fn new(settings: ProbeSettings) -> Self {
        Self::with_runner(Arc::new(LocalRunner::new()), settings)
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, settings: ProbeSettings) -> Self {
        Self { runner, settings }
    }

    fn ssh_command(&self, host: &str, remote: impl Into<String>) -> Vec<String> {
        let mut command = Vec::with_capacity(self.settings.ssh_options.len() + 3);
        command.push("ssh".to_string());
        command.extend(self.settings.ssh_options.iter().cloned());
        command.push(host.to_string());
        command.push(remote.into());
        command
    }

    async fn ssh(&self, host: &str, remote: impl Into<String>, timeout: Duration) -> CommandOutput {
        let command = self.ssh_command(host, remote);
        self.runner.run(&command, timeout).await
    }
}

/// Remote shell snippet answering `OK <path>` or `MISSING <path>` per path
fn directory_check_script(paths: &[String]) -> String {
    paths
        .iter()
        .map(|path| {
            let quoted = shell_words::quote(path);
            format!("if test -e {q}; then echo OK {q}; else echo MISSING {q}; fi", q = quoted)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn probe_error(output: &CommandOutput) -> ProbeError {
    let stderr = output.stderr.trim().to_string();
    if output.is_transport_failure() || looks_like_transport_error(&stderr) {
        ProbeError::Transport(if stderr.is_empty() {
            format!("exit {}", output.exit_code)
        } else {
            stderr
        })
    } else {
        ProbeError::Command {
            exit_code: output.exit_code,
            stderr,
        }
    }
}

#[async_trait]
impl RemoteProber for SshProber {
    async fn probe_reachable(&self, host: &str) -> bool {
        let wait_secs = self.settings.ping_timeout.as_secs().max(1);
        let command: Vec<String> = vec![
            "ping".into(),
            "-c".into(),
            "1".into(),
            "-W".into(),
            wait_secs.to_string(),
            host.into(),
        ];

        // Leave ping its own -W window before the hard timeout fires.
        let output = self
            .runner
            .run(&command, self.settings.ping_timeout + Duration::from_secs(1))
            .await;
        debug!(host, exit_code = output.exit_code, "ping finished");
        output.success()
    }

    async fn probe_mounts(&self, host: &str) -> ProbeOutcome {
        let output = self.ssh(host, "mount -av", self.settings.ssh_timeout).await;
        debug!(
            host,
            exit_code = output.exit_code,
            elapsed_ms = output.execution_time_ms as u64,
            "mount -av finished"
        );
        parser::parse_mount_output(&output.stdout, &output.stderr, output.exit_code)
    }

    async fn probe_directory_exists(
        &self,
        host: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, bool>, ProbeError> {
        if paths.is_empty() {
            return Ok(BTreeMap::new());
        }

        let output = self
            .ssh(host, directory_check_script(paths), self.settings.software_timeout)
            .await;
        if !output.success() {
            return Err(probe_error(&output));
        }
        parser::parse_directory_checks(&output.stdout, paths)
    }

    async fn probe_active_users(&self, host: &str) -> Result<UserCensus, ProbeError> {
        let output = self.ssh(host, "who", self.settings.ssh_timeout).await;
        if !output.success() {
            return Err(probe_error(&output));
        }
        Ok(parser::parse_user_census(&output.stdout, self.settings.user_sample))
    }

    async fn probe_remount(&self, host: &str, mount_point: Option<&str>) -> bool {
        let remote = match mount_point {
            Some(mount_point) => format!("sudo mount {}", shell_words::quote(mount_point)),
            None => "sudo mount -a".to_string(),
        };

        let output = self.ssh(host, remote, self.settings.remount_timeout).await;
        if output.success() {
            info!(host, mount_point = mount_point.unwrap_or("all"), "remount succeeded");
            true
        } else {
            warn!(
                host,
                mount_point = mount_point.unwrap_or("all"),
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "remount failed"
            );
            false
        }
    }
}
