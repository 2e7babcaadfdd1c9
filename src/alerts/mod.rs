//! Scheduled threshold alerting over the event store
//!
//! The engine pulls trailing-window aggregates on a fixed cadence, raises an
//! [`Alert`] for every aggregate above its threshold, and dispatches each
//! condition at most once per UTC hour.

pub mod checks;
pub mod dedup;
pub mod notify;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::listener::wait_for_shutdown;
pub use checks::{Alert, CheckKind};
use dedup::{DedupCache, DedupKey};
use notify::NotifierSet;
use store::{ElasticsearchStore, EventStore};

/// Alert triggers; an aggregate must be strictly greater to fire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub high_volume: u64,
    pub unique_ips: u64,
    pub brute_force: u64,
    pub iot_botnet: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high_volume: 100,
            unique_ips: 50,
            brute_force: 20,
            iot_botnet: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub elasticsearch_url: String,
    pub index_pattern: String,
    pub timestamp_field: String,
    pub query_timeout_secs: u64,

    /// Trailing window every check aggregates over
    pub window_secs: u64,
    pub check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How often the scheduler wakes to see what is due
    pub poll_interval_secs: u64,
    /// Age at which dedup entries are purged
    pub dedup_retention_secs: u64,

    pub thresholds: Thresholds,

    /// Source IPs inspected by the brute force check
    pub brute_force_top_n: usize,
    /// Source IPs fetched for the IoT botnet alert
    pub iot_top_ips: usize,
    /// Source IPs named in the IoT botnet alert
    pub iot_report_ips: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            elasticsearch_url: "http://elasticsearch:9200".to_string(),
            index_pattern: "honeypot-logs-*".to_string(),
            timestamp_field: "@timestamp".to_string(),
            query_timeout_secs: 10,
            window_secs: 3600,
            check_interval_secs: 300,
            cleanup_interval_secs: 3600,
            poll_interval_secs: 60,
            dedup_retention_secs: 86_400,
            thresholds: Thresholds::default(),
            brute_force_top_n: 100,
            iot_top_ips: 10,
            iot_report_ips: 5,
        }
    }
}

impl AlertsConfig {
    /// Store backend for this configuration
    pub fn elasticsearch(&self) -> crate::error::Result<ElasticsearchStore> {
        ElasticsearchStore::new(
            &self.elasticsearch_url,
            &self.index_pattern,
            &self.timestamp_field,
            Duration::from_secs(self.query_timeout_secs),
        )
    }
}

/// Result of one check cycle
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub dispatched: Vec<Alert>,
    pub suppressed: usize,
    pub failed_checks: Vec<CheckKind>,
}

pub struct AlertEngine {
    config: AlertsConfig,
    store: Arc<dyn EventStore>,
    notifiers: NotifierSet,
    dedup: DedupCache,
}

impl AlertEngine {
    pub fn new(config: AlertsConfig, store: Arc<dyn EventStore>, notifiers: NotifierSet) -> Self {
        Self {
            config,
            store,
            notifiers,
            dedup: DedupCache::new(),
        }
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Run every check once as of `now`.
    ///
    /// A failing query skips only its own check for this cycle.
    pub async fn run_checks(&mut self, now: DateTime<Utc>) -> CycleSummary {
        info!("Running alert checks");
        let mut summary = CycleSummary::default();

        for check in CheckKind::ALL {
            let candidates = match check.evaluate(self.store.as_ref(), &self.config, now).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!("Alert check {} failed: {}", check, e);
                    summary.failed_checks.push(check);
                    continue;
                }
            };

            for alert in candidates {
                let key = DedupKey::new(alert.check, &alert.dimension, now);
                if self.dedup.contains(&key) {
                    debug!("Suppressing repeat {} alert for {}", alert.check, alert.dimension);
                    summary.suppressed += 1;
                    continue;
                }
                self.dispatch(&alert).await;
                self.dedup.record(key, now);
                summary.dispatched.push(alert);
            }
        }

        info!(
            "Alert checks completed: {} dispatched, {} suppressed",
            summary.dispatched.len(),
            summary.suppressed
        );
        summary
    }

    async fn dispatch(&self, alert: &Alert) {
        warn!(
            "ALERT [{}]: {} - {}",
            alert.severity_label(),
            alert.subject,
            alert.message
        );
        if self.notifiers.is_empty() {
            return;
        }
        let report = self.notifiers.dispatch(alert).await;
        if !report.failed.is_empty() {
            warn!(
                "Alert {:?} not delivered via {}",
                alert.subject,
                report.failed.join(", ")
            );
        }
    }

    /// Purge dedup entries past retention
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let removed = self.dedup.cleanup(now, self.config.dedup_retention_secs);
        info!("Cleaned up {} old alert records", removed);
        removed
    }

    /// Initial check, then checks and cleanup on their cadences until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Alert engine started: checks every {}s, notifiers [{}]",
            self.config.check_interval_secs,
            self.notifiers.names().join(", ")
        );

        let check_every = chrono::Duration::seconds(self.config.check_interval_secs as i64);
        let cleanup_every = chrono::Duration::seconds(self.config.cleanup_interval_secs as i64);

        let start = Utc::now();
        self.run_checks(start).await;
        let mut next_check = start + check_every;
        let mut next_cleanup = start + cleanup_every;

        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Alert engine stopping");
                    return;
                }
            }

            let now = Utc::now();
            if now >= next_check {
                self.run_checks(now).await;
                next_check = now + check_every;
            }
            if now >= next_cleanup {
                self.cleanup(now);
                next_cleanup = now + cleanup_every;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::notify::test_support::RecordingNotifier;
    use super::store::{MemoryStore, StoredEvent, TermCount, TimeWindow};
    use super::*;
    use crate::error::{DecoyError, Result};
    use crate::models::AttackTag;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 14, hour, minute, 0).unwrap()
    }

    fn brute_force_store(ip: &str, n: usize, now: DateTime<Utc>) -> MemoryStore {
        let store = MemoryStore::new();
        let t = now - ChronoDuration::minutes(2);
        store.extend((0..n).map(|_| StoredEvent::new(t, "login_attempt", ip)));
        store
    }

    fn engine(store: Arc<dyn EventStore>, notifier: Arc<RecordingNotifier>) -> AlertEngine {
        let mut notifiers = NotifierSet::new();
        notifiers.register(notifier);
        AlertEngine::new(AlertsConfig::default(), store, notifiers)
    }

    #[tokio::test]
    async fn test_same_hour_dispatches_once() {
        let store = Arc::new(brute_force_store("203.0.113.9", 25, at(10, 40)));
        let notifier = RecordingNotifier::new("slack", false);
        let mut engine = engine(store, notifier.clone());

        let first = engine.run_checks(at(10, 40)).await;
        assert_eq!(first.dispatched.len(), 1);
        assert_eq!(first.dispatched[0].check, CheckKind::BruteForce);

        let second = engine.run_checks(at(10, 45)).await;
        assert!(second.dispatched.is_empty());
        assert_eq!(second.suppressed, 1);
        assert_eq!(notifier.count(), 1);

        // same breach, next hour bucket
        let third = engine.run_checks(at(11, 0)).await;
        assert_eq!(third.dispatched.len(), 1);
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_drops_day_old_entries() {
        let store = Arc::new(brute_force_store("203.0.113.9", 25, at(3, 30)));
        let notifier = RecordingNotifier::new("email", false);
        let mut engine = engine(store, notifier);

        engine.run_checks(at(3, 30)).await;
        assert_eq!(engine.dedup().len(), 1);

        assert_eq!(engine.cleanup(at(3, 30) + ChronoDuration::hours(23)), 0);
        assert_eq!(engine.cleanup(at(3, 31) + ChronoDuration::hours(24)), 1);
        assert!(engine.dedup().is_empty());
    }

    #[tokio::test]
    async fn test_failed_notifier_still_records() {
        let store = Arc::new(brute_force_store("203.0.113.9", 25, at(8, 0)));
        let notifier = RecordingNotifier::new("email", true);
        let mut engine = engine(store, notifier.clone());

        let summary = engine.run_checks(at(8, 0)).await;
        assert_eq!(summary.dispatched.len(), 1);
        assert_eq!(notifier.count(), 1);

        // at-most-once: no retry next cycle
        engine.run_checks(at(8, 5)).await;
        assert_eq!(notifier.count(), 1);
    }

    /// Store whose count queries fail while the others succeed
    struct FlakyStore(MemoryStore);

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn count(&self, _filter: &store::EventFilter, _window: TimeWindow) -> Result<u64> {
            Err(DecoyError::Query("connection refused".into()))
        }

        async fn cardinality(
            &self,
            filter: &store::EventFilter,
            field: &str,
            window: TimeWindow,
        ) -> Result<u64> {
            self.0.cardinality(filter, field, window).await
        }

        async fn terms(
            &self,
            filter: &store::EventFilter,
            field: &str,
            size: usize,
            window: TimeWindow,
        ) -> Result<Vec<TermCount>> {
            self.0.terms(filter, field, size, window).await
        }
    }

    #[tokio::test]
    async fn test_query_error_skips_only_that_check() {
        let inner = brute_force_store("203.0.113.9", 25, at(12, 0));
        inner.push(StoredEvent::new(at(11, 59), "connection", "203.0.113.10").tagged(AttackTag::IotBotnet));
        let notifier = RecordingNotifier::new("slack", false);
        let mut engine = engine(Arc::new(FlakyStore(inner)), notifier.clone());

        let summary = engine.run_checks(at(12, 0)).await;
        assert_eq!(
            summary.failed_checks,
            vec![CheckKind::HighVolume, CheckKind::IotBotnet]
        );
        assert_eq!(summary.dispatched.len(), 1);
        assert_eq!(summary.dispatched[0].dimension, "203.0.113.9");
    }

    #[test]
    fn test_default_config() {
        let config = AlertsConfig::default();
        assert_eq!(config.thresholds.brute_force, 20);
        assert_eq!(config.check_interval_secs, 300);
        assert_eq!(config.dedup_retention_secs, 86_400);
        assert!(config.elasticsearch().is_ok());
    }
}
