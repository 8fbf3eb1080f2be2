//! SMTP delivery through `lettre`

use super::delivery::{DeliveryError, Mailer};
use crate::config::NotificationSettings;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Port on which the relay is spoken to in plain text
const PLAIN_SMTP_PORT: u16 = 25;

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &NotificationSettings) -> Result<Self, DeliveryError> {
        let builder = if settings.smtp_port == PLAIN_SMTP_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_server)?
        };
        let mut builder = builder.port(settings.smtp_port);

        if let (Some(user), Some(password)) = (&settings.smtp_user, &settings.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: settings.from.parse()?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<(), DeliveryError> {
        if recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }

        let mut message = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in recipients {
            message = message.to(recipient.parse()?);
        }
        let message = message
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Build(e.to_string()))?;

        self.transport.send(message).await?;
        tracing::info!(subject, recipients = recipients.len(), "notification email sent");
        Ok(())
    }
}
