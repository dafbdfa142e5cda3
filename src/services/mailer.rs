//! Report delivery over authenticated SMTP submission.

use crate::config::MailConfig;
use crate::error::AppError;
use crate::types::{DeliveryReceipt, EmailMessage};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Delivers a composed report email.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends the message and waits for the relay's verdict.
    ///
    /// # Errors
    /// `AppError::Delivery` when the relay rejects the message,
    /// `AppError::Transport` on connection, TLS or timeout failures.
    async fn send_report(
        &self,
        message: &EmailMessage,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError>;
}

/// STARTTLS relay client, e.g. Gmail on port 587 with an app password.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    relay: String,
}

impl SmtpNotifier {
    /// Creates a notifier from validated mail settings.
    ///
    /// # Errors
    /// Returns an error if the relay host cannot be used for STARTTLS.
    pub fn from_config(config: &MailConfig, timeout: Duration) -> Result<Self, AppError> {
        let password = config
            .password
            .as_ref()
            .map(|p| p.expose().to_string())
            .unwrap_or_default();
        let creds = Credentials::new(config.username.clone(), password);

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| AppError::Transport(format!("failed to create SMTP transport: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            transport,
            relay: format!("{}:{}", config.smtp_host, config.smtp_port),
        })
    }
}

/// Builds the outgoing message. CC entries are kept in order, duplicates included.
///
/// # Errors
/// Returns `AppError::Config` if an address does not parse.
pub fn compose(message: &EmailMessage) -> Result<Message, AppError> {
    let from = Mailbox::new(
        Some(message.from_name.clone()).filter(|n| !n.trim().is_empty()),
        message
            .from_address
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("invalid sender address: {e}")))?,
    );

    let mut builder = Message::builder()
        .from(from)
        .to(parse_mailbox(&message.to)?)
        .subject(message.subject.clone())
        .header(ContentType::TEXT_PLAIN);
    for cc in &message.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }

    builder
        .body(message.body.clone())
        .map_err(|e| AppError::Config(format!("failed to build email: {e}")))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AppError> {
    address
        .trim()
        .parse()
        .map_err(|e| AppError::Config(format!("invalid address '{address}': {e}")))
}

/// Splits relay rejections (with a reply code) from connection-level failures.
fn classify(err: &lettre::transport::smtp::Error) -> AppError {
    match err.status() {
        Some(code) => AppError::Delivery {
            code: code.to_string(),
            message: err.to_string(),
        },
        None => AppError::Transport(err.to_string()),
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_report(
        &self,
        message: &EmailMessage,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let email = compose(message)?;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            result = self.transport.send(email) => result,
        };

        match result {
            Ok(response) => {
                let receipt = DeliveryReceipt {
                    code: response.code().to_string(),
                    message: response.first_line().map(ToString::to_string).unwrap_or_default(),
                };
                info!(
                    relay = %self.relay,
                    to = %message.to,
                    cc = message.cc.len(),
                    reply = %receipt,
                    "Report email accepted"
                );
                Ok(receipt)
            }
            Err(e) => {
                let err = classify(&e);
                error!(relay = %self.relay, error = %err, "Report email failed");
                Err(err)
            }
        }
    }
}
