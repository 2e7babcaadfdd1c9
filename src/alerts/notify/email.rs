//! SMTP email channel

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{metadata_text, Notifier};
use crate::alerts::checks::Alert;
use crate::error::{DecoyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address; defaults to the SMTP username
    pub from: Option<String>,
    pub recipients: Vec<String>,
    /// "starttls", "tls" or "none"
    pub tls: String,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            username: None,
            password: None,
            from: None,
            recipients: Vec::new(),
            tls: "starttls".to_string(),
            timeout_secs: 10,
        }
    }
}

impl EmailConfig {
    /// Enabled, with somewhere to send and a login to send with
    pub fn is_usable(&self) -> bool {
        self.enabled
            && !self.recipients.is_empty()
            && self.username.is_some()
            && self.password.is_some()
    }

    fn sender(&self) -> Option<&str> {
        self.from.as_deref().or(self.username.as_deref())
    }
}

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> anyhow::Result<Self> {
        let host = config.smtp_server.as_str();
        let mut builder = match config.tls.as_str() {
            "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            mode => {
                let params = TlsParameters::new(host.to_string())
                    .with_context(|| format!("Invalid SMTP host for TLS: {}", host))?;
                let tls = if mode == "tls" {
                    Tls::Wrapper(params)
                } else {
                    Tls::Required(params)
                };
                AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                    .with_context(|| format!("Invalid SMTP relay: {}", host))?
                    .tls(tls)
            }
        }
        .port(config.smtp_port)
        .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = config
            .sender()
            .context("Email alerts need notify.email.from or a username")?
            .parse::<Mailbox>()
            .context("Invalid sender address")?;

        let recipients = config
            .recipients
            .iter()
            .map(|r| {
                r.parse::<Mailbox>()
                    .with_context(|| format!("Invalid recipient address: {}", r))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            transport: builder.build(),
            from,
            recipients,
        })
    }

    fn error(reason: impl ToString) -> DecoyError {
        DecoyError::Notify {
            channel: "email".to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let subject = subject(alert);
        let body = body(alert);

        for recipient in &self.recipients {
            let message = Message::builder()
                .from(self.from.clone())
                .to(recipient.clone())
                .subject(subject.clone())
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())
                .map_err(Self::error)?;

            self.transport.send(message).await.map_err(Self::error)?;
        }

        Ok(())
    }
}

pub fn subject(alert: &Alert) -> String {
    format!("[HONEYPOT ALERT - {}] {}", alert.severity_label(), alert.subject)
}

pub fn body(alert: &Alert) -> String {
    format!(
        "Honeypot Alert - {}\n\n\
         Subject: {}\n\
         Timestamp: {}\n\
         Severity: {}\n\n\
         Message:\n{}\n\n\
         Metadata:\n{}\n\n\
         ---\n\
         Honeypot Alert System\n",
        alert.severity_label(),
        alert.subject,
        alert.timestamp.to_rfc3339(),
        alert.severity,
        alert.message,
        metadata_text(alert),
    )
}
