/*!
Builders for a valid `MonitorConfig` in tests
*/

use mountwatch_kernel::config::{MonitorSettings, NotificationSettings};
use mountwatch_kernel::{HostConfig, MonitorConfig, SuppressionPolicy};
use mountwatch_probe::ProbeSettings;
use std::path::PathBuf;
use std::time::Duration;

pub struct ConfigBuilder {
    config: MonitorConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Remediation on, suppression off, one recipient, no workstations
    pub fn new() -> Self {
        Self {
            config: MonitorConfig {
                monitor: MonitorSettings {
                    interval: Duration::from_secs(3600),
                    host_timeout: Duration::from_secs(180),
                    cycle_deadline: Duration::from_secs(900),
                    max_concurrent_hosts: 8,
                    attempt_fix: true,
                    database: PathBuf::from(":memory:"),
                    retention: Duration::from_secs(72 * 3600),
                    aggressive_cleanup: false,
                },
                probe: ProbeSettings::default(),
                notifications: NotificationSettings {
                    enabled: true,
                    from: "mountwatch@example.org".into(),
                    recipients: vec!["ops@example.org".into()],
                    smtp_server: "localhost".into(),
                    smtp_port: 25,
                    smtp_user: None,
                    smtp_password: None,
                    subject_prefix: "[mountwatch]".into(),
                },
                suppression: SuppressionPolicy {
                    enabled: false,
                    ..SuppressionPolicy::default()
                },
                workstations: Vec::new(),
            },
        }
    }

    pub fn workstation(mut self, name: &str, mounts: &[&str]) -> Self {
        self.config.workstations.push(HostConfig::new(name, mounts));
        self
    }

    /// Require `artifacts` under `mount` on every workstation expecting it
    pub fn software(mut self, mount: &str, artifacts: &[&str]) -> Self {
        for host in self.config.workstations.iter_mut() {
            if host.mounts.iter().any(|m| m == mount) {
                host.software
                    .insert(mount.to_string(), artifacts.iter().map(|a| a.to_string()).collect());
            }
        }
        self
    }

    pub fn attempt_fix(mut self, attempt_fix: bool) -> Self {
        self.config.monitor.attempt_fix = attempt_fix;
        self
    }

    pub fn suppression(mut self, policy: SuppressionPolicy) -> Self {
        self.config.suppression = policy;
        self
    }

    pub fn host_timeout(mut self, timeout: Duration) -> Self {
        self.config.monitor.host_timeout = timeout;
        self
    }

    pub fn cycle_deadline(mut self, deadline: Duration) -> Self {
        self.config.monitor.cycle_deadline = deadline;
        self
    }

    pub fn max_concurrent_hosts(mut self, n: usize) -> Self {
        self.config.monitor.max_concurrent_hosts = n;
        self
    }

    pub fn build(self) -> MonitorConfig {
        self.config
    }
}
