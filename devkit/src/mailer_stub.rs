/*!
Recording `Mailer` for tests without an SMTP server
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mountwatch_kernel::notify::{DeliveryError, Mailer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every send fails and nothing is recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last(&self) -> Option<SentMessage> {
        self.sent.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Build("mailer told to fail".into()));
        }
        tracing::debug!(subject, "[mock] message recorded");
        self.sent.lock().push(SentMessage {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: recipients.to_vec(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}
