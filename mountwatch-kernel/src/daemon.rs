//! Fixed-interval cycle loop

use crate::monitor::{CycleOutcome, WorkstationMonitor};
use crate::notify::FlushOutcome;
use crate::report;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct Daemon {
    monitor: Arc<WorkstationMonitor>,
}

impl Daemon {
    pub fn new(monitor: Arc<WorkstationMonitor>) -> Self {
        Self { monitor }
    }

    /// One cycle. When alerts may go out again, whatever was queued while
    /// they were suppressed is summarized first.
    pub async fn run_once(&self) -> CycleOutcome {
        let outcome = self.monitor.run_cycle().await;
        if outcome.decision.deliver_now {
            self.flush_pending().await;
        }
        outcome
    }

    async fn flush_pending(&self) {
        let scheduler = self.monitor.scheduler();
        match scheduler.has_pending() {
            Ok(false) => {}
            Ok(true) => match scheduler.flush_summary(Utc::now()).await {
                Ok(FlushOutcome::Sent { groups, entries }) => {
                    info!(groups, entries, "flushed off-hours summary")
                }
                Ok(other) => info!(?other, "off-hours summary not sent"),
                Err(e) => error!(error = %e, "failed to flush off-hours summary"),
            },
            Err(e) => error!(error = %e, "failed to read off-hours queue"),
        }
    }

    /// Cycle every `interval` until Ctrl-C
    pub async fn run(&self) {
        let period = self.monitor.settings().interval;
        info!(interval = %humantime::format_duration(period), "monitor started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.run_once().await;
                    let text = report::render_cycle_report(
                        &outcome.reports,
                        Utc::now(),
                        self.monitor.scheduler().control_host(),
                    );
                    info!(
                        cycle_id = %outcome.cycle_id,
                        elapsed_ms = outcome.duration.as_millis() as u64,
                        "cycle report\n{}",
                        text
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
    }
}
