//! Mountwatch kernel: decides what workstation probe results mean, repairs
//! what it safely can, and tells operators without waking them up.

pub mod classifier;
pub mod config;
pub mod daemon;
pub mod health;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod remediation;
pub mod report;
pub mod store;

pub use config::{ConfigError, HostConfig, MonitorConfig, SuppressionPolicy};
pub use models::{
    Connectivity, DecisionReason, HostCycleReport, Issue, IssueKey, IssueKind, NotificationDecision,
    Severity, SoftwareCheck,
};
pub use monitor::{CycleOutcome, WorkstationMonitor};
pub use notify::{DispatchOutcome, FlushOutcome, Mailer, NotificationScheduler};
pub use store::{SqliteStore, StateStore, StoreError};
