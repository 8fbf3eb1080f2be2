//! Configuration document: TOML on disk, validated once into [`MonitorConfig`].

use mountwatch_probe::ProbeSettings;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

pub const CONFIG_ENV: &str = "MOUNTWATCH_CONFIG";
pub const SMTP_PASSWORD_ENV: &str = "MOUNTWATCH_SMTP_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("no config path given and no user config directory available")]
    NoConfigDir,
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

// Raw document, as written by operators

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    monitor: RawMonitor,
    #[serde(default)]
    ssh: RawSsh,
    #[serde(default)]
    notifications: RawNotifications,
    #[serde(default)]
    suppression: RawSuppression,
    #[serde(default)]
    software: Vec<RawSoftware>,
    #[serde(default)]
    workstations: Vec<RawWorkstation>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMonitor {
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_host_timeout")]
    host_timeout: String,
    #[serde(default = "default_cycle_deadline")]
    cycle_deadline: String,
    #[serde(default = "default_concurrency")]
    max_concurrent_hosts: usize,
    #[serde(default = "default_true")]
    attempt_fix: bool,
    database: PathBuf,
    #[serde(default = "default_retention")]
    retention: String,
    #[serde(default)]
    aggressive_cleanup: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawSsh {
    options: Vec<String>,
    timeout: String,
    ping_timeout: String,
    software_timeout: String,
    remount_timeout: String,
    user_sample: usize,
}

impl Default for RawSsh {
    fn default() -> Self {
        let defaults = ProbeSettings::default();
        Self {
            options: defaults.ssh_options,
            timeout: "30s".into(),
            ping_timeout: "5s".into(),
            software_timeout: "10s".into(),
            remount_timeout: "60s".into(),
            user_sample: defaults.user_sample,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawNotifications {
    enabled: bool,
    from: Option<String>,
    recipients: Vec<String>,
    smtp_server: String,
    smtp_port: u16,
    smtp_user: Option<String>,
    subject_prefix: String,
}

impl Default for RawNotifications {
    fn default() -> Self {
        Self {
            enabled: true,
            from: None,
            recipients: Vec::new(),
            smtp_server: "localhost".into(),
            smtp_port: 25,
            smtp_user: None,
            subject_prefix: "[mountwatch]".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawSuppression {
    enabled: bool,
    off_hours_start: u32,
    off_hours_end: u32,
    weekend: bool,
}

impl Default for RawSuppression {
    fn default() -> Self {
        let policy = SuppressionPolicy::default();
        Self {
            enabled: policy.enabled,
            off_hours_start: policy.off_hours_start,
            off_hours_end: policy.off_hours_end,
            weekend: policy.weekend,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSoftware {
    mount: String,
    artifacts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkstation {
    host: String,
    mounts: Vec<String>,
    #[serde(default)]
    software: BTreeMap<String, Vec<String>>,
}

fn default_interval() -> String {
    "1h".into()
}
fn default_host_timeout() -> String {
    "3m".into()
}
fn default_cycle_deadline() -> String {
    "15m".into()
}
fn default_retention() -> String {
    "72h".into()
}
fn default_concurrency() -> usize {
    8
}
fn default_true() -> bool {
    true
}

// Validated configuration

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    pub probe: ProbeSettings,
    pub notifications: NotificationSettings,
    pub suppression: SuppressionPolicy,
    pub workstations: Vec<HostConfig>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub host_timeout: Duration,
    pub cycle_deadline: Duration,
    pub max_concurrent_hosts: usize,
    pub attempt_fix: bool,
    pub database: PathBuf,
    pub retention: Duration,
    pub aggressive_cleanup: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub from: String,
    pub recipients: Vec<String>,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    /// Filled from `MOUNTWATCH_SMTP_PASSWORD`, never from the document
    pub smtp_password: Option<String>,
    pub subject_prefix: String,
}

/// Off-hours window in local hours, half-open `[start, end)`, wrapping past
/// midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppressionPolicy {
    pub enabled: bool,
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    /// Friday 18:00 through Monday 06:00
    pub weekend: bool,
}

impl Default for SuppressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            off_hours_start: 22,
            off_hours_end: 6,
            weekend: false,
        }
    }
}

/// One workstation and what must be true on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub name: String,
    /// Expected mount points, in configured order
    pub mounts: Vec<String>,
    /// Mount point -> artifacts that must be reachable through it
    pub software: BTreeMap<String, Vec<String>>,
}

impl HostConfig {
    pub fn new(name: impl Into<String>, mounts: &[&str]) -> Self {
        Self {
            name: name.into(),
            mounts: mounts.iter().map(|m| m.to_string()).collect(),
            software: BTreeMap::new(),
        }
    }

    pub fn expected_mounts(&self) -> BTreeSet<String> {
        self.mounts.iter().cloned().collect()
    }
}

impl MonitorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let smtp_password = std::env::var(SMTP_PASSWORD_ENV).ok().filter(|p| !p.is_empty());
        validate(raw, smtp_password)
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.workstations.iter().find(|h| h.name == name)
    }
}

/// Read and validate the config file at `path`
pub async fn load(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    MonitorConfig::from_toml_str(&text)
}

/// `$MOUNTWATCH_CONFIG`, else `<config dir>/mountwatch/config.toml`
pub fn default_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("mountwatch").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

fn duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let parsed = humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid(key, format!("{:?}: {}", value, e)))?;
    if parsed.is_zero() {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(parsed)
}

/// Longest retention accepted; a cutoff further back leaves the calendar
pub const MAX_RETENTION: Duration = Duration::from_secs(3650 * 24 * 3600);

pub fn retention(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let parsed = duration(key, value)?;
    if parsed > MAX_RETENTION {
        return Err(ConfigError::invalid(
            key,
            format!("{:?} exceeds {}", value, humantime::format_duration(MAX_RETENTION)),
        ));
    }
    Ok(parsed)
}

fn hour(key: &str, value: u32) -> Result<u32, ConfigError> {
    if value > 23 {
        return Err(ConfigError::invalid(key, format!("{} is not an hour (0-23)", value)));
    }
    Ok(value)
}

fn validate(raw: RawConfig, smtp_password: Option<String>) -> Result<MonitorConfig, ConfigError> {
    let monitor = MonitorSettings {
        interval: duration("monitor.interval", &raw.monitor.interval)?,
        host_timeout: duration("monitor.host_timeout", &raw.monitor.host_timeout)?,
        cycle_deadline: duration("monitor.cycle_deadline", &raw.monitor.cycle_deadline)?,
        max_concurrent_hosts: raw.monitor.max_concurrent_hosts,
        attempt_fix: raw.monitor.attempt_fix,
        database: raw.monitor.database,
        retention: retention("monitor.retention", &raw.monitor.retention)?,
        aggressive_cleanup: raw.monitor.aggressive_cleanup,
    };
    if monitor.max_concurrent_hosts == 0 {
        return Err(ConfigError::invalid("monitor.max_concurrent_hosts", "must be at least 1"));
    }
    if monitor.database.as_os_str().is_empty() {
        return Err(ConfigError::invalid("monitor.database", "must not be empty"));
    }

    let probe = ProbeSettings {
        ssh_options: raw.ssh.options,
        ssh_timeout: duration("ssh.timeout", &raw.ssh.timeout)?,
        ping_timeout: duration("ssh.ping_timeout", &raw.ssh.ping_timeout)?,
        software_timeout: duration("ssh.software_timeout", &raw.ssh.software_timeout)?,
        remount_timeout: duration("ssh.remount_timeout", &raw.ssh.remount_timeout)?,
        user_sample: raw.ssh.user_sample,
    };

    let notifications = validate_notifications(raw.notifications, smtp_password)?;

    let suppression = SuppressionPolicy {
        enabled: raw.suppression.enabled,
        off_hours_start: hour("suppression.off_hours_start", raw.suppression.off_hours_start)?,
        off_hours_end: hour("suppression.off_hours_end", raw.suppression.off_hours_end)?,
        weekend: raw.suppression.weekend,
    };

    let workstations = validate_workstations(raw.workstations, &raw.software)?;

    Ok(MonitorConfig {
        monitor,
        probe,
        notifications,
        suppression,
        workstations,
    })
}

fn validate_notifications(
    raw: RawNotifications,
    smtp_password: Option<String>,
) -> Result<NotificationSettings, ConfigError> {
    if raw.enabled && raw.recipients.is_empty() {
        return Err(ConfigError::invalid(
            "notifications.recipients",
            "at least one recipient is required when notifications are enabled",
        ));
    }
    for recipient in &raw.recipients {
        recipient
            .parse::<lettre::Address>()
            .map_err(|e| {
                ConfigError::invalid("notifications.recipients", format!("{}: {}", recipient, e))
            })?;
    }

    let from = match raw.from {
        Some(from) => from,
        None => format!("mountwatch@{}", gethostname::gethostname().to_string_lossy()),
    };
    if raw.enabled {
        from.parse::<lettre::message::Mailbox>()
            .map_err(|e| ConfigError::invalid("notifications.from", format!("{}: {}", from, e)))?;
    }

    Ok(NotificationSettings {
        enabled: raw.enabled,
        from,
        recipients: raw.recipients,
        smtp_server: raw.smtp_server,
        smtp_port: raw.smtp_port,
        smtp_user: raw.smtp_user,
        smtp_password,
        subject_prefix: raw.subject_prefix,
    })
}

fn validate_workstations(
    raw: Vec<RawWorkstation>,
    fleet_software: &[RawSoftware],
) -> Result<Vec<HostConfig>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::invalid("workstations", "no workstations configured"));
    }

    for entry in fleet_software {
        if !entry.mount.starts_with('/') {
            return Err(ConfigError::invalid(
                "software.mount",
                format!("{} is not an absolute path", entry.mount),
            ));
        }
    }

    let mut seen = BTreeSet::new();
    let mut hosts = Vec::with_capacity(raw.len());
    for ws in raw {
        let host = ws.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::invalid("workstations.host", "empty host name"));
        }
        if !seen.insert(host.clone()) {
            return Err(ConfigError::invalid(
                "workstations.host",
                format!("duplicate host {}", host),
            ));
        }

        let mut mounts: Vec<String> = Vec::with_capacity(ws.mounts.len());
        for mount in ws.mounts {
            if !mount.starts_with('/') {
                return Err(ConfigError::invalid(
                    format!("workstations.{}.mounts", host),
                    format!("{} is not an absolute path", mount),
                ));
            }
            if !mounts.contains(&mount) {
                mounts.push(mount);
            }
        }

        let mut software: BTreeMap<String, Vec<String>> = fleet_software
            .iter()
            .filter(|s| mounts.contains(&s.mount))
            .map(|s| (s.mount.clone(), s.artifacts.clone()))
            .collect();
        for (mount, artifacts) in ws.software {
            if !mounts.contains(&mount) {
                return Err(ConfigError::invalid(
                    format!("workstations.{}.software", host),
                    format!("{} is not one of the host's mounts", mount),
                ));
            }
            software.insert(mount, artifacts);
        }
        software.retain(|_, artifacts| !artifacts.is_empty());

        hosts.push(HostConfig {
            name: host,
            mounts,
            software,
        });
    }
    Ok(hosts)
}
