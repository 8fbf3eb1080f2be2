//! Cycle counters and process health for the daemon log

use crate::models::HostCycleReport;
use crate::report::CycleSummary;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
pub struct MonitorHealth {
    pub uptime_seconds: u64,
    pub cycles_completed: u64,
    pub last_cycle_ms: Option<u64>,
    pub hosts_checked: usize,
    pub hosts_online: usize,
    pub hosts_with_issues: usize,
    pub memory_usage_mb: f32,
}

#[derive(Debug, Default, Clone, Copy)]
struct LastCycle {
    duration: Duration,
    summary: CycleSummary,
}

/// Self-health of the monitor process
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    cycles: Arc<AtomicU64>,
    last: Arc<Mutex<Option<LastCycle>>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: Arc::new(AtomicU64::new(0)),
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn record_cycle(&self, reports: &[HostCycleReport], duration: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(LastCycle {
            duration,
            summary: CycleSummary::of(reports),
        });
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn get_health(&self) -> MonitorHealth {
        let last = *self.last.lock();
        let summary = last.map(|l| l.summary).unwrap_or_default();

        MonitorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cycles_completed: self.cycles_completed(),
            last_cycle_ms: last.map(|l| l.duration.as_millis() as u64),
            hosts_checked: summary.total,
            hosts_online: summary.online,
            hosts_with_issues: summary.with_issues,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

/// Resident set size from `/proc/self/status`; 0 where unavailable
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok());
                    if let Some(kb) = kb {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
