//! Suppression of repeat alerts within an hour bucket

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use super::checks::CheckKind;

/// Identity of an alert condition: which check, on what, in which UTC hour
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub check: CheckKind,
    pub dimension: String,
    pub bucket: String,
}

impl DedupKey {
    pub fn new(check: CheckKind, dimension: &str, now: DateTime<Utc>) -> Self {
        Self {
            check,
            dimension: dimension.to_string(),
            bucket: hour_bucket(now),
        }
    }
}

/// `YYYYMMDDHH` in UTC
pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H").to_string()
}

/// Keys of dispatched alerts with their dispatch time
#[derive(Debug, Default)]
pub struct DedupCache {
    sent: HashMap<DedupKey, DateTime<Utc>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.sent.contains_key(key)
    }

    pub fn record(&mut self, key: DedupKey, dispatched_at: DateTime<Utc>) {
        self.sent.insert(key, dispatched_at);
    }

    /// Drop entries dispatched more than `retention_secs` before `now`.
    /// Returns how many were removed.
    pub fn cleanup(&mut self, now: DateTime<Utc>, retention_secs: u64) -> usize {
        let cutoff = now - ChronoDuration::seconds(retention_secs as i64);
        let before = self.sent.len();
        self.sent.retain(|_, sent_at| *sent_at >= cutoff);
        before - self.sent.len()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_bucket_format() {
        assert_eq!(hour_bucket(at(7, 59)), "2024030907");
        assert_eq!(
            DedupKey::new(CheckKind::BruteForce, "10.0.0.1", at(7, 0)),
            DedupKey::new(CheckKind::BruteForce, "10.0.0.1", at(7, 45))
        );
        assert_ne!(
            DedupKey::new(CheckKind::BruteForce, "10.0.0.1", at(7, 59)),
            DedupKey::new(CheckKind::BruteForce, "10.0.0.1", at(8, 0))
        );
    }

    #[test]
    fn test_cleanup_retention() {
        let mut cache = DedupCache::new();
        let old = DedupKey::new(CheckKind::HighVolume, "all", at(1, 0));
        let fresh = DedupKey::new(CheckKind::HighVolume, "all", at(20, 0));
        cache.record(old.clone(), at(1, 0));
        cache.record(fresh.clone(), at(20, 0));

        let next_day = at(1, 0) + ChronoDuration::hours(24) + ChronoDuration::seconds(1);
        assert_eq!(cache.cleanup(next_day, 86_400), 1);
        assert!(!cache.contains(&old));
        assert!(cache.contains(&fresh));
        assert_eq!(cache.len(), 1);
    }
}
