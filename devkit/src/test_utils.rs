/*!
Test harness for the monitor

Wires a `WorkstationMonitor` to a `FakeProber`, a `RecordingMailer` and an
in-memory SQLite store, and offers fixed notification decisions so tests do
not depend on the wall clock.
*/

use crate::fake_prober::FakeProber;
use crate::mailer_stub::RecordingMailer;
use anyhow::Result;
use mountwatch_kernel::store::{IssueRecord, SqliteStore, StateStore};
use mountwatch_kernel::{
    CycleOutcome, DecisionReason, MonitorConfig, NotificationDecision, NotificationScheduler,
    WorkstationMonitor,
};
use std::sync::Arc;

pub struct TestHarness {
    pub config: MonitorConfig,
    pub prober: Arc<FakeProber>,
    pub mailer: Arc<RecordingMailer>,
    pub store: Arc<SqliteStore>,
    pub scheduler: Arc<NotificationScheduler>,
    pub monitor: WorkstationMonitor,
}

impl TestHarness {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_store(config, SqliteStore::open_in_memory()?)
    }

    pub fn with_store(config: MonitorConfig, store: SqliteStore) -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let prober = Arc::new(FakeProber::new());
        let mailer = Arc::new(RecordingMailer::new());
        let store = Arc::new(store);
        let scheduler = Arc::new(NotificationScheduler::new(
            store.clone(),
            mailer.clone(),
            config.suppression,
            config.notifications.recipients.clone(),
            config.notifications.subject_prefix.clone(),
        ));
        let monitor =
            WorkstationMonitor::new(&config, prober.clone(), store.clone(), scheduler.clone());

        Ok(Self {
            config,
            prober,
            mailer,
            store,
            scheduler,
            monitor,
        })
    }

    pub fn deliver_now() -> NotificationDecision {
        NotificationDecision {
            deliver_now: true,
            reason: DecisionReason::WorkingHours,
        }
    }

    pub fn suppressed() -> NotificationDecision {
        NotificationDecision {
            deliver_now: false,
            reason: DecisionReason::OffHoursWindow,
        }
    }

    /// One cycle with alerts allowed
    pub async fn cycle(&self) -> CycleOutcome {
        self.monitor.run_cycle_decided(Self::deliver_now()).await
    }

    /// One cycle inside the off-hours window
    pub async fn suppressed_cycle(&self) -> CycleOutcome {
        self.monitor.run_cycle_decided(Self::suppressed()).await
    }

    pub fn open_issues(&self, host: &str) -> Result<Vec<IssueRecord>> {
        Ok(self.store.open_issues(host)?)
    }

    pub fn assert_mail_count(&self, expected: usize) -> Result<()> {
        let actual = self.mailer.count();
        if actual != expected {
            let subjects: Vec<String> = self.mailer.sent().into_iter().map(|m| m.subject).collect();
            anyhow::bail!("expected {} message(s), got {}: {:?}", expected, actual, subjects);
        }
        Ok(())
    }
}
