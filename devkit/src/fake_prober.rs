/*!
Scripted `RemoteProber` for tests without ssh

Each host gets its own script: reachability, a queue of `mount -av` outputs
(the last one repeats), a user census, missing paths and remount answers.
Unscripted hosts answer ping, report no mounts and no users. Every call is
recorded for assertions.
*/

use async_trait::async_trait;
use mountwatch_probe::{parse_mount_output, ProbeError, ProbeOutcome, RemoteProber, UserCensus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCall {
    Reachable(String),
    Mounts(String),
    Directories(String, Vec<String>),
    Users(String),
    Remount(String, Option<String>),
}

impl ProbeCall {
    pub fn host(&self) -> &str {
        match self {
            ProbeCall::Reachable(h)
            | ProbeCall::Mounts(h)
            | ProbeCall::Directories(h, _)
            | ProbeCall::Users(h)
            | ProbeCall::Remount(h, _) => h,
        }
    }
}

#[derive(Debug, Clone)]
struct MountScript {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
struct HostScript {
    reachable: bool,
    mounts: VecDeque<MountScript>,
    census: Result<UserCensus, ProbeError>,
    missing: BTreeSet<String>,
    directory_error: Option<ProbeError>,
    remount_ok: bool,
    delay: Option<Duration>,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            reachable: true,
            mounts: VecDeque::new(),
            census: Ok(UserCensus::default()),
            missing: BTreeSet::new(),
            directory_error: None,
            remount_ok: false,
            delay: None,
        }
    }
}

#[derive(Default)]
pub struct FakeProber {
    scripts: Mutex<HashMap<String, HostScript>>,
    calls: Mutex<Vec<ProbeCall>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    fn script<F: FnOnce(&mut HostScript)>(&self, host: &str, edit: F) -> &Self {
        edit(self.scripts.lock().entry(host.to_string()).or_default());
        self
    }

    fn snapshot(&self, host: &str) -> HostScript {
        self.scripts.lock().get(host).cloned().unwrap_or_default()
    }

    fn record(&self, call: ProbeCall) {
        self.calls.lock().push(call);
    }

    pub fn unreachable(&self, host: &str) -> &Self {
        self.script(host, |s| s.reachable = false)
    }

    /// Queue one successful `mount -av` output
    pub fn mount_output(&self, host: &str, stdout: &str) -> &Self {
        self.mount_result(host, 0, stdout, "")
    }

    pub fn mount_result(&self, host: &str, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.script(host, |s| {
            s.mounts.push_back(MountScript {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            })
        })
    }

    pub fn users(&self, host: &str, names: &[&str]) -> &Self {
        let census = UserCensus {
            count: names.len() as u32,
            sample: names.iter().map(|n| n.to_string()).collect(),
        };
        self.script(host, |s| s.census = Ok(census))
    }

    pub fn census_fails(&self, host: &str, error: ProbeError) -> &Self {
        self.script(host, |s| s.census = Err(error))
    }

    pub fn missing_path(&self, host: &str, path: &str) -> &Self {
        self.script(host, |s| {
            s.missing.insert(path.to_string());
        })
    }

    pub fn directory_check_fails(&self, host: &str, error: ProbeError) -> &Self {
        self.script(host, |s| s.directory_error = Some(error))
    }

    pub fn directory_check_recovers(&self, host: &str) -> &Self {
        self.script(host, |s| s.directory_error = None)
    }

    pub fn remount_succeeds(&self, host: &str, ok: bool) -> &Self {
        self.script(host, |s| s.remount_ok = ok)
    }

    /// Make every probe of `host` sleep first
    pub fn delay(&self, host: &str, delay: Duration) -> &Self {
        self.script(host, |s| s.delay = Some(delay))
    }

    pub fn calls(&self) -> Vec<ProbeCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<ProbeCall> {
        self.calls.lock().iter().filter(|c| c.host() == host).cloned().collect()
    }

    pub fn mount_probes(&self, host: &str) -> usize {
        self.calls_for(host)
            .iter()
            .filter(|c| matches!(c, ProbeCall::Mounts(_)))
            .count()
    }

    pub fn remounts(&self, host: &str) -> Vec<Option<String>> {
        self.calls_for(host)
            .into_iter()
            .filter_map(|c| match c {
                ProbeCall::Remount(_, mount) => Some(mount),
                _ => None,
            })
            .collect()
    }

    async fn pause(&self, host: &str) {
        if let Some(delay) = self.snapshot(host).delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteProber for FakeProber {
    async fn probe_reachable(&self, host: &str) -> bool {
        self.record(ProbeCall::Reachable(host.to_string()));
        self.pause(host).await;
        self.snapshot(host).reachable
    }

    async fn probe_mounts(&self, host: &str) -> ProbeOutcome {
        self.record(ProbeCall::Mounts(host.to_string()));
        self.pause(host).await;

        let next = {
            let mut scripts = self.scripts.lock();
            let script = scripts.entry(host.to_string()).or_default();
            if script.mounts.len() > 1 {
                script.mounts.pop_front()
            } else {
                script.mounts.front().cloned()
            }
        };
        match next {
            Some(m) => parse_mount_output(&m.stdout, &m.stderr, m.exit_code),
            None => parse_mount_output("", "", 0),
        }
    }

    async fn probe_directory_exists(
        &self,
        host: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, bool>, ProbeError> {
        self.record(ProbeCall::Directories(host.to_string(), paths.to_vec()));
        self.pause(host).await;

        let script = self.snapshot(host);
        if let Some(error) = script.directory_error {
            return Err(error);
        }
        Ok(paths
            .iter()
            .map(|p| (p.clone(), !script.missing.contains(p)))
            .collect())
    }

    async fn probe_active_users(&self, host: &str) -> Result<UserCensus, ProbeError> {
        self.record(ProbeCall::Users(host.to_string()));
        self.pause(host).await;
        self.snapshot(host).census
    }

    async fn probe_remount(&self, host: &str, mount_point: Option<&str>) -> bool {
        self.record(ProbeCall::Remount(host.to_string(), mount_point.map(String::from)));
        self.pause(host).await;
        self.snapshot(host).remount_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mountwatch_probe::MountStatus;

    #[tokio::test]
    async fn mount_outputs_are_consumed_then_repeat() {
        let prober = FakeProber::new();
        prober
            .mount_output("evan", "/boot : already mounted\n")
            .mount_output("evan", "/data : successfully mounted\n");

        assert_eq!(prober.probe_mounts("evan").await.status_of("/data"), None);
        assert_eq!(
            prober.probe_mounts("evan").await.status_of("/data"),
            Some(MountStatus::NewlyMounted)
        );
        assert_eq!(
            prober.probe_mounts("evan").await.status_of("/data"),
            Some(MountStatus::NewlyMounted)
        );
        assert_eq!(prober.mount_probes("evan"), 3);
    }

    #[tokio::test]
    async fn unscripted_hosts_are_quiet_and_reachable() {
        let prober = FakeProber::new();
        assert!(prober.probe_reachable("adam").await);
        assert_eq!(prober.probe_active_users("adam").await.unwrap().count, 0);
        assert!(!prober.probe_remount("adam", None).await);
        assert_eq!(prober.remounts("adam"), [None]);
    }
}
