//! The four threshold checks run on every alert cycle

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

use super::store::{EventFilter, EventStore, TimeWindow};
use super::AlertsConfig;
use crate::error::Result;
use crate::models::{AttackTag, ThreatLevel};

/// Dimension used by checks that aggregate across all sources
pub const ALL_DIMENSION: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    HighVolume,
    UniqueIps,
    BruteForce,
    IotBotnet,
}

impl CheckKind {
    /// Run order within one cycle
    pub const ALL: [CheckKind; 4] = [
        CheckKind::HighVolume,
        CheckKind::UniqueIps,
        CheckKind::BruteForce,
        CheckKind::IotBotnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::HighVolume => "high_volume",
            CheckKind::UniqueIps => "unique_ips",
            CheckKind::BruteForce => "brute_force",
            CheckKind::IotBotnet => "iot_botnet",
        }
    }

    pub fn severity(&self) -> ThreatLevel {
        match self {
            CheckKind::HighVolume | CheckKind::BruteForce => ThreatLevel::High,
            CheckKind::UniqueIps => ThreatLevel::Medium,
            CheckKind::IotBotnet => ThreatLevel::Critical,
        }
    }

    /// Query the store and build an alert for every aggregate over threshold.
    pub async fn evaluate(
        self,
        store: &dyn EventStore,
        config: &AlertsConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let window = TimeWindow::trailing(now, config.window_secs);
        let span = WindowPhrase::new(config.window_secs);
        let thresholds = &config.thresholds;

        let alerts = match self {
            CheckKind::HighVolume => {
                let filter = EventFilter::EventTypes(vec!["login_attempt", "connection", "command_execution"]);
                let count = store.count(&filter, window).await?;
                if count > thresholds.high_volume {
                    vec![Alert::new(
                        self,
                        ALL_DIMENSION,
                        "High Volume Attack Detected",
                        format!(
                            "Detected {} attacks in the last {} (threshold: {})",
                            count, span.last, thresholds.high_volume
                        ),
                        json!({ "attack_count": count, "timeframe": span.timeframe }),
                        now,
                    )]
                } else {
                    Vec::new()
                }
            }
            CheckKind::UniqueIps => {
                let count = store
                    .cardinality(&EventFilter::HasField("source_ip"), "source_ip", window)
                    .await?;
                if count > thresholds.unique_ips {
                    vec![Alert::new(
                        self,
                        ALL_DIMENSION,
                        "Unusual IP Activity Detected",
                        format!(
                            "Detected {} unique IPs in the last {} (threshold: {})",
                            count, span.last, thresholds.unique_ips
                        ),
                        json!({ "unique_ip_count": count, "timeframe": span.timeframe }),
                        now,
                    )]
                } else {
                    Vec::new()
                }
            }
            CheckKind::BruteForce => {
                let filter = EventFilter::EventTypes(vec!["login_attempt"]);
                let buckets = store
                    .terms(&filter, "source_ip", config.brute_force_top_n, window)
                    .await?;
                buckets
                    .into_iter()
                    .filter(|b| b.count > thresholds.brute_force)
                    .map(|b| {
                        Alert::new(
                            self,
                            &b.key,
                            "Brute Force Attack Detected",
                            format!(
                                "IP {} made {} login attempts in the last {} (threshold: {})",
                                b.key, b.count, span.last, thresholds.brute_force
                            ),
                            json!({
                                "source_ip": b.key,
                                "attempt_count": b.count,
                                "timeframe": span.timeframe,
                            }),
                            now,
                        )
                    })
                    .collect()
            }
            CheckKind::IotBotnet => {
                let filter = EventFilter::Tagged(AttackTag::IotBotnet);
                let count = store.count(&filter, window).await?;
                if count > thresholds.iot_botnet {
                    let top_ips: Vec<String> = store
                        .terms(&filter, "source_ip", config.iot_top_ips, window)
                        .await?
                        .into_iter()
                        .take(config.iot_report_ips)
                        .map(|b| b.key)
                        .collect();
                    vec![Alert::new(
                        self,
                        ALL_DIMENSION,
                        "IoT Botnet Activity Detected",
                        format!(
                            "Detected {} IoT botnet attempts in the last {} (threshold: {})\nTop IPs: {}",
                            count,
                            span.last,
                            thresholds.iot_botnet,
                            top_ips.join(", ")
                        ),
                        json!({
                            "iot_attempt_count": count,
                            "top_ips": top_ips,
                            "timeframe": span.timeframe,
                        }),
                        now,
                    )]
                } else {
                    Vec::new()
                }
            }
        };

        Ok(alerts)
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// "hour" / "1 hour" style descriptions of the query window
struct WindowPhrase {
    last: String,
    timeframe: String,
}

impl WindowPhrase {
    fn new(secs: u64) -> Self {
        let timeframe = if secs % 3600 == 0 {
            plural(secs / 3600, "hour")
        } else if secs % 60 == 0 {
            plural(secs / 60, "minute")
        } else {
            plural(secs, "second")
        };
        let last = match secs {
            3600 => "hour".to_string(),
            60 => "minute".to_string(),
            _ => timeframe.clone(),
        };
        Self { last, timeframe }
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// A threshold breach ready for dispatch
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub check: CheckKind,
    /// What the alert is about: `all`, or the offending source IP
    pub dimension: String,
    pub subject: String,
    pub message: String,
    pub severity: ThreatLevel,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        check: CheckKind,
        dimension: &str,
        subject: &str,
        message: String,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            check,
            dimension: dimension.to_string(),
            subject: subject.to_string(),
            message,
            severity: check.severity(),
            metadata,
            timestamp,
        }
    }

    /// Severity in upper case, as shown in subjects and titles
    pub fn severity_label(&self) -> String {
        self.severity.as_str().to_uppercase()
    }
}
