//! Alert now, or queue for the off-hours summary.

use super::delivery::Mailer;
use crate::config::SuppressionPolicy;
use crate::models::{DecisionReason, HostCycleReport, NotificationDecision};
use crate::report::{self, CycleSummary};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc, Weekday};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Weekend rule: Friday from this hour...
const WEEKEND_START_HOUR: u32 = 18;
/// ...until Monday at this hour.
const WEEKEND_END_HOUR: u32 = 6;

impl SuppressionPolicy {
    fn in_window(&self, hour: u32) -> bool {
        let (start, end) = (self.off_hours_start, self.off_hours_end);
        if start < end {
            start <= hour && hour < end
        } else if start > end {
            hour >= start || hour < end
        } else {
            false
        }
    }

    fn in_weekend(&self, local: NaiveDateTime) -> bool {
        if !self.weekend {
            return false;
        }
        let hour = local.hour();
        match local.weekday() {
            Weekday::Fri => hour >= WEEKEND_START_HOUR,
            Weekday::Sat | Weekday::Sun => true,
            Weekday::Mon => hour < WEEKEND_END_HOUR,
            _ => false,
        }
    }

    pub fn decide(&self, local: NaiveDateTime) -> NotificationDecision {
        decide(local, self)
    }
}

/// Pure function of local wall-clock time and policy.
pub fn decide(local: NaiveDateTime, policy: &SuppressionPolicy) -> NotificationDecision {
    let (deliver_now, reason) = if !policy.enabled {
        (true, DecisionReason::SuppressionDisabled)
    } else if policy.in_weekend(local) {
        (false, DecisionReason::Weekend)
    } else if policy.in_window(local.hour()) {
        (false, DecisionReason::OffHoursWindow)
    } else {
        (true, DecisionReason::WorkingHours)
    };
    NotificationDecision { deliver_now, reason }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NothingToReport,
    Sent { hosts: usize, issues: usize },
    Queued { issues: usize },
    DeliveryFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Sent { groups: usize, entries: usize },
    /// Entries stay queued for the next flush
    DeliveryFailed { reason: String },
}

pub struct NotificationScheduler {
    store: Arc<dyn StateStore>,
    mailer: Arc<dyn Mailer>,
    policy: SuppressionPolicy,
    recipients: Vec<String>,
    subject_prefix: String,
    control_host: String,
    /// Serializes queueing against flushing
    gate: Mutex<()>,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        mailer: Arc<dyn Mailer>,
        policy: SuppressionPolicy,
        recipients: Vec<String>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            policy,
            recipients,
            subject_prefix: subject_prefix.into(),
            control_host: gethostname::gethostname().to_string_lossy().into_owned(),
            gate: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &SuppressionPolicy {
        &self.policy
    }

    pub fn control_host(&self) -> &str {
        &self.control_host
    }

    /// Decision for `now` in the local timezone
    pub fn decision_at(&self, now: DateTime<Utc>) -> NotificationDecision {
        decide(now.with_timezone(&Local).naive_local(), &self.policy)
    }

    pub async fn dispatch(
        &self,
        reports: &[HostCycleReport],
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let decision = self.decision_at(now);
        self.dispatch_with(reports, decision, now).await
    }

    /// Send or queue every open issue in `reports` according to `decision`
    pub async fn dispatch_with(
        &self,
        reports: &[HostCycleReport],
        decision: NotificationDecision,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let _guard = self.gate.lock().await;

        let summary = CycleSummary::of(reports);
        let issues = reports.iter().map(|r| r.open_issues().count()).sum::<usize>();
        if issues == 0 {
            return DispatchOutcome::NothingToReport;
        }

        if decision.deliver_now {
            let alert =
                report::render_alert(reports, &self.subject_prefix, now, &self.control_host);
            let message = match alert {
                Some(message) => message,
                None => return DispatchOutcome::NothingToReport,
            };
            return match self.mailer.send(&message.subject, &message.body, &self.recipients).await {
                Ok(()) => {
                    info!(
                        hosts = summary.with_issues,
                        critical_hosts = summary.critical_hosts,
                        issues,
                        "alert sent"
                    );
                    DispatchOutcome::Sent {
                        hosts: summary.with_issues,
                        issues,
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to send alert");
                    DispatchOutcome::DeliveryFailed { reason: e.to_string() }
                }
            };
        }

        let mut queued = 0;
        for issue in reports.iter().flat_map(|r| r.open_issues()) {
            match self.store.enqueue_off_hours_issue(issue, now) {
                Ok(_) => queued += 1,
                Err(e) => {
                    warn!(workstation = %issue.workstation, error = %e, "failed to queue issue")
                }
            }
        }
        info!(
            queued,
            critical_hosts = summary.critical_hosts,
            reason = %decision.reason,
            "alert suppressed, issues queued for summary"
        );
        DispatchOutcome::Queued { issues: queued }
    }

    pub fn has_pending(&self) -> Result<bool, StoreError> {
        Ok(!self.store.pending_off_hours()?.is_empty())
    }

    /// Send one summary of everything queued and not yet sent. Entries are
    /// marked sent only once the mailer accepted the message.
    pub async fn flush_summary(&self, now: DateTime<Utc>) -> Result<FlushOutcome, StoreError> {
        let _guard = self.gate.lock().await;

        let pending = self.store.pending_off_hours()?;
        let message = match report::render_summary(&pending, &self.subject_prefix) {
            Some(message) => message,
            None => return Ok(FlushOutcome::Empty),
        };
        let groups = report::group_queued(&pending).len();

        if let Err(e) = self.mailer.send(&message.subject, &message.body, &self.recipients).await {
            error!(error = %e, entries = pending.len(), "failed to send off-hours summary");
            return Ok(FlushOutcome::DeliveryFailed { reason: e.to_string() });
        }

        let ids: Vec<i64> = pending.iter().map(|q| q.id).collect();
        let marked = self.store.mark_off_hours_flushed(&ids, now)?;
        info!(groups, entries = marked, "off-hours summary sent");
        Ok(FlushOutcome::Sent {
            groups,
            entries: marked,
        })
    }
}
