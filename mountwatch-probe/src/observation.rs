//! Typed results of workstation probes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of one mount point as reported by `mount -av`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    /// Was already mounted before the probe ran
    Mounted,
    /// Was not mounted, `mount -av` mounted it
    NewlyMounted,
    NotMounted,
    DirectoryMissing,
    Unknown,
}

impl MountStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, MountStatus::Mounted | MountStatus::NewlyMounted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MountStatus::Mounted => "mounted",
            MountStatus::NewlyMounted => "newly_mounted",
            MountStatus::NotMounted => "not_mounted",
            MountStatus::DirectoryMissing => "directory_missing",
            MountStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mounted" => Ok(MountStatus::Mounted),
            "newly_mounted" => Ok(MountStatus::NewlyMounted),
            "not_mounted" => Ok(MountStatus::NotMounted),
            "directory_missing" => Ok(MountStatus::DirectoryMissing),
            "unknown" => Ok(MountStatus::Unknown),
            other => Err(format!("unknown mount status: {}", other)),
        }
    }
}

/// One mount point seen in a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountObservation {
    pub mount_point: String,
    /// Device or NFS source when the output carries one
    pub source: Option<String>,
    pub status: MountStatus,
}

impl MountObservation {
    pub fn new(mount_point: impl Into<String>, status: MountStatus) -> Self {
        Self {
            mount_point: mount_point.into(),
            source: None,
            status,
        }
    }
}

/// Outcome of a mount verification probe.
///
/// Kept as three variants all the way to the classifier: "could not ask" and
/// "asked and got an error" are different conditions from "asked and the
/// mount is missing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    ConnectivityFailure { message: String },
    CommandFailure { exit_code: i32, stderr: String },
    Success { observations: Vec<MountObservation> },
}

impl ProbeOutcome {
    pub fn observations(&self) -> &[MountObservation] {
        match self {
            ProbeOutcome::Success { observations } => observations,
            _ => &[],
        }
    }

    /// Status reported for one mount point, only meaningful on success
    pub fn status_of(&self, mount_point: &str) -> Option<MountStatus> {
        self.observations()
            .iter()
            .find(|o| o.mount_point == mount_point)
            .map(|o| o.status)
    }
}

/// Logged-in sessions on a workstation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserCensus {
    /// Number of sessions (`who` lines)
    pub count: u32,
    /// First distinct user names, in output order
    pub sample: Vec<String>,
}

/// Failure of a probe that returns structured data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("cannot reach host: {0}")]
    Transport(String),
    #[error("remote command exited with {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },
    #[error("unexpected probe output: {0}")]
    Output(String),
}
