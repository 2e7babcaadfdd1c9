//! Slack incoming-webhook channel

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{metadata_text, Notifier};
use crate::alerts::checks::Alert;
use crate::error::{DecoyError, Result};
use crate::models::ThreatLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl SlackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.to_string(),
        })
    }

    fn error(reason: impl ToString) -> DecoyError {
        DecoyError::Notify {
            channel: "slack".to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.client
            .post(&self.webhook_url)
            .json(&payload(alert))
            .send()
            .await
            .map_err(Self::error)?
            .error_for_status()
            .map_err(Self::error)?;
        Ok(())
    }
}

pub fn severity_color(level: ThreatLevel) -> &'static str {
    match level {
        ThreatLevel::Low => "#36a64f",
        ThreatLevel::Medium => "#ff9500",
        ThreatLevel::High => "#ff0000",
        ThreatLevel::Critical => "#8b0000",
    }
}

/// Single-attachment message body
pub fn payload(alert: &Alert) -> Value {
    let mut fields = vec![
        json!({ "title": "Message", "value": alert.message, "short": false }),
        json!({ "title": "Timestamp", "value": alert.timestamp.to_rfc3339(), "short": true }),
        json!({ "title": "Severity", "value": alert.severity_label(), "short": true }),
    ];
    if !alert.metadata.is_null() {
        fields.push(json!({
            "title": "Metadata",
            "value": format!("```{}```", metadata_text(alert)),
            "short": false,
        }));
    }

    json!({
        "attachments": [{
            "color": severity_color(alert.severity),
            "title": format!("Honeypot Alert - {}", alert.severity_label()),
            "text": alert.subject,
            "fields": fields,
        }]
    })
}
