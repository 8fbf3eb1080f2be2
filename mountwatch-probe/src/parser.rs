//! Parsing of raw probe output
//!
//! Turns the text printed by `mount -av`, `who` and the directory check
//! script into typed records. No policy here: an expected mount that is
//! absent from the output is simply absent from the result.

use crate::execution::{EXIT_TIMEOUT, EXIT_UNREACHABLE};
use crate::observation::{MountObservation, MountStatus, ProbeError, ProbeOutcome, UserCensus};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Separator between target and status in `mount -av` lines
const MOUNT_SEPARATOR: &str = " : ";

/// Parse the output of `mount -av` into a [`ProbeOutcome`].
///
/// Transport exit codes win over any output. Otherwise each
/// `"<mount_point> : <status>"` line becomes an observation; when a mount
/// point appears more than once the last line wins (a remount re-probe
/// appends fresh lines). Zero observations with exit 0 is a success with an
/// empty list, never "all healthy".
pub fn parse_mount_output(stdout: &str, stderr: &str, exit_code: i32) -> ProbeOutcome {
    if exit_code == EXIT_UNREACHABLE || exit_code == EXIT_TIMEOUT {
        return ProbeOutcome::ConnectivityFailure {
            message: transport_message(stderr, exit_code),
        };
    }

    let mut observations = ObservationSet::default();

    let mut sources = Vec::new();
    for line in stdout.lines() {
        if let Some((source, target)) = parse_mounted_on_line(line) {
            sources.push((source, target));
            continue;
        }
        let Some((target, status_text)) = line.split_once(MOUNT_SEPARATOR) else {
            continue;
        };
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        if let Some(status) = classify_status_text(status_text) {
            observations.upsert(MountObservation::new(target, status));
        }
    }

    // Per-target failures go to stderr. They only count once `mount` got as
    // far as walking fstab, and only for targets stdout did not mention.
    if !observations.is_empty() {
        let reported: HashSet<String> = observations.mount_points().cloned().collect();
        for (target, status) in stderr.lines().filter_map(parse_mount_error_line) {
            if !reported.contains(&target) {
                observations.upsert(MountObservation::new(target, status));
            }
        }
    }

    for (source, target) in sources {
        observations.attach_source(&target, source);
    }

    let observations = observations.into_vec();
    if observations.is_empty() && exit_code != 0 {
        if looks_like_transport_error(stderr) {
            return ProbeOutcome::ConnectivityFailure {
                message: transport_message(stderr, exit_code),
            };
        }
        return ProbeOutcome::CommandFailure {
            exit_code,
            stderr: stderr.trim().to_string(),
        };
    }

    ProbeOutcome::Success { observations }
}

/// Map the status part of a `mount -av` line to a [`MountStatus`].
///
/// Returns `None` for lines `mount` explicitly ignored (swap, `noauto`...),
/// which are not observations at all.
pub fn classify_status_text(text: &str) -> Option<MountStatus> {
    let text = text.trim().to_ascii_lowercase();

    if text.contains("already mounted") {
        Some(MountStatus::Mounted)
    } else if text.contains("does not exist") {
        Some(MountStatus::DirectoryMissing)
    } else if text.contains("not mounted") || text.contains("fail") {
        Some(MountStatus::NotMounted)
    } else if text.contains("successfully mounted") || text.contains("mounted") {
        Some(MountStatus::NewlyMounted)
    } else if text.contains("ignored") {
        None
    } else {
        Some(MountStatus::Unknown)
    }
}

/// Best-effort fallback: does free-form stderr text look like the host was
/// never reached?
///
/// Only used when the exit code carries no transport signal. Substring
/// matching on error text is brittle; structured exit codes from the runner
/// are always preferred.
pub fn looks_like_transport_error(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "ssh:",
        "connection timed out",
        "connection refused",
        "connection closed",
        "no route to host",
        "could not resolve hostname",
        "host key verification failed",
        "permission denied (publickey",
        "timed out",
        "timeout",
    ];

    let lowered = stderr.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Parse `who` output: one session per line, user name in the first column.
pub fn parse_user_census(stdout: &str, sample_size: usize) -> UserCensus {
    let mut census = UserCensus::default();

    for user in stdout.lines().filter_map(|line| line.split_whitespace().next()) {
        census.count += 1;
        if census.sample.len() < sample_size && !census.sample.iter().any(|u| u == user) {
            census.sample.push(user.to_string());
        }
    }

    census
}

/// Parse the `OK <path>` / `MISSING <path>` lines of the directory check
/// script. Every requested path must be answered.
pub fn parse_directory_checks(
    stdout: &str,
    paths: &[String],
) -> Result<BTreeMap<String, bool>, ProbeError> {
    let mut answers = HashMap::new();

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("OK ") {
            answers.insert(path.trim().to_string(), true);
        } else if let Some(path) = line.strip_prefix("MISSING ") {
            answers.insert(path.trim().to_string(), false);
        }
    }

    paths
        .iter()
        .map(|path| match answers.get(path) {
            Some(found) => Ok((path.clone(), *found)),
            None => Err(ProbeError::Output(format!("no answer for {}", path))),
        })
        .collect()
}

/// `mount: /data: mount point does not exist.` -> (`/data`, DirectoryMissing)
///
/// Errors about mount's own configuration (`/etc/fstab: parse error`) are not
/// about a target and yield nothing.
fn parse_mount_error_line(line: &str) -> Option<(String, MountStatus)> {
    let rest = line.trim().strip_prefix("mount: ")?;
    let (target, reason) = rest.split_once(": ")?;
    if !target.starts_with('/') || target.starts_with("/etc/") {
        return None;
    }
    let reason = reason.to_ascii_lowercase();
    if reason.contains("parse error") || reason.contains("only root") {
        return None;
    }

    let status = if reason.contains("does not exist") {
        MountStatus::DirectoryMissing
    } else {
        MountStatus::NotMounted
    };
    Some((target.to_string(), status))
}

/// Verbose `mount` line naming the device: `mount: nas:/export/data mounted on /data.`
fn parse_mounted_on_line(line: &str) -> Option<(String, String)> {
    let rest = line.trim().strip_prefix("mount: ")?;
    let (source, target) = rest.split_once(" mounted on ")?;
    let target = target.trim().trim_end_matches('.');
    if source.is_empty() || !target.starts_with('/') {
        return None;
    }
    Some((source.trim().to_string(), target.to_string()))
}

fn transport_message(stderr: &str, exit_code: i32) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        match exit_code {
            EXIT_TIMEOUT => "probe timed out".to_string(),
            _ => format!("host unreachable (exit {})", exit_code),
        }
    } else {
        stderr.to_string()
    }
}

/// Observations in first-seen order, replaced in place on repeat
#[derive(Default)]
struct ObservationSet {
    items: Vec<MountObservation>,
    index: HashMap<String, usize>,
}

impl ObservationSet {
    fn upsert(&mut self, observation: MountObservation) {
        match self.index.get(&observation.mount_point) {
            Some(&i) => self.items[i] = observation,
            None => {
                self.index.insert(observation.mount_point.clone(), self.items.len());
                self.items.push(observation);
            }
        }
    }

    /// Record the device of `target`; a target seen only here was just mounted
    fn attach_source(&mut self, target: &str, source: String) {
        match self.index.get(target) {
            Some(&i) => self.items[i].source = Some(source),
            None => {
                let mut observation = MountObservation::new(target, MountStatus::NewlyMounted);
                observation.source = Some(source);
                self.upsert(observation);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn mount_points(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    fn into_vec(self) -> Vec<MountObservation> {
        self.items
    }
}
