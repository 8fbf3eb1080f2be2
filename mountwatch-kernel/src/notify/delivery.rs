//! Delivery collaborator: something that can send a subject and body to a
//! list of recipients.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
    #[error("no recipients configured")]
    NoRecipients,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<(), DeliveryError>;
}

/// Logs messages instead of sending them. Used when notifications are
/// disabled.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<(), DeliveryError> {
        info!(
            subject,
            recipients = recipients.len(),
            lines = body.lines().count(),
            "notification (not sent)"
        );
        Ok(())
    }
}
