//! Alert delivery channels
//!
//! Each channel implements [`Notifier`]. [`NotifierSet`] fans one alert out
//! to every registered channel at once; a failing channel is logged and
//! never retried or allowed to hold up the others.

pub mod email;
pub mod slack;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::checks::Alert;
use crate::error::Result;

pub use email::{EmailConfig, EmailNotifier};
pub use slack::{SlackConfig, SlackNotifier};

/// Notification channel settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub slack: SlackConfig,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// All configured channels
#[derive(Default, Clone)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the channels enabled in `config`
    pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Self> {
        let mut set = Self::new();

        if config.email.is_usable() {
            set.register(Arc::new(EmailNotifier::new(config.email.clone())?));
        } else if config.email.enabled {
            info!("Email alerts enabled but SMTP credentials or recipients are missing");
        }

        if let Some(url) = &config.slack.webhook_url {
            set.register(Arc::new(SlackNotifier::new(url, config.slack.timeout())?));
        }

        Ok(set)
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.notifiers.iter().map(|n| n.name().to_string()).collect()
    }

    /// Send `alert` on every channel concurrently and wait for all of them.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let alert = Arc::new(alert.clone());
        let mut tasks = JoinSet::new();

        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let alert = alert.clone();
            tasks.spawn(async move {
                let result = notifier.notify(&alert).await;
                (notifier.name().to_string(), result)
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    info!("{} alert sent: {}", name, alert.subject);
                    report.delivered.push(name);
                }
                Ok((name, Err(e))) => {
                    error!("{}", e);
                    report.failed.push(name);
                }
                Err(e) => {
                    error!("Notifier task failed: {}", e);
                    report.failed.push("unknown".to_string());
                }
            }
        }

        report.delivered.sort();
        report.failed.sort();
        report
    }
}

/// Pretty-printed metadata, or `None` when there is nothing to show
pub(crate) fn metadata_text(alert: &Alert) -> String {
    match &alert.metadata {
        serde_json::Value::Null => "None".to_string(),
        value => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingNotifier;
    use super::*;
    use crate::alerts::checks::CheckKind;
    use chrono::Utc;
    use serde_json::json;

    fn alert() -> Alert {
        Alert::new(
            CheckKind::UniqueIps,
            "all",
            "Unusual IP Activity Detected",
            "Detected 60 unique IPs in the last hour (threshold: 50)".into(),
            json!({ "unique_ip_count": 60 }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let ok = RecordingNotifier::new("slack", false);
        let broken = RecordingNotifier::new("email", true);
        let mut set = NotifierSet::new();
        set.register(broken.clone());
        set.register(ok.clone());

        let report = set.dispatch(&alert()).await;
        assert_eq!(report.delivered, vec!["slack"]);
        assert_eq!(report.failed, vec!["email"]);
        assert_eq!(ok.count(), 1);
        assert_eq!(broken.count(), 1);
    }

    #[test]
    fn test_from_config_skips_unconfigured() {
        let set = NotifierSet::from_config(&NotifyConfig::default()).unwrap();
        assert!(set.is_empty());

        let mut config = NotifyConfig::default();
        config.slack.webhook_url = Some("https://hooks.slack.com/services/T/B/X".into());
        config.email.enabled = true;
        let set = NotifierSet::from_config(&config).unwrap();
        assert_eq!(set.names(), vec!["slack"]);
    }

    #[test]
    fn test_metadata_text() {
        let mut a = alert();
        assert!(metadata_text(&a).contains("\"unique_ip_count\": 60"));
        a.metadata = serde_json::Value::Null;
        assert_eq!(metadata_text(&a), "None");
    }
}
