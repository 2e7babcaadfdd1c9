//! Aggregate queries over stored honeypot events
//!
//! The alerting engine only needs three aggregates over a trailing window:
//! a filtered count, the cardinality of a field, and the top values of a
//! field. [`ElasticsearchStore`] answers them with one `_search` request each;
//! [`MemoryStore`] answers them from a vector for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{DecoyError, Result};
use crate::models::AttackTag;

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of `secs` seconds ending at `now`
    pub fn trailing(now: DateTime<Utc>, secs: u64) -> Self {
        Self {
            start: now - ChronoDuration::seconds(secs as i64),
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Document filter applied in addition to the time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Any document
    All,
    /// `event_type` is one of these
    EventTypes(Vec<&'static str>),
    /// `attack_types` contains this tag
    Tagged(AttackTag),
    /// The field is present
    HasField(&'static str),
}

/// One bucket of a terms aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermCount {
    pub key: String,
    pub count: u64,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Number of matching documents
    async fn count(&self, filter: &EventFilter, window: TimeWindow) -> Result<u64>;

    /// Approximate number of distinct values of `field` in matching documents
    async fn cardinality(&self, filter: &EventFilter, field: &str, window: TimeWindow) -> Result<u64>;

    /// Top `size` values of `field` by document count, largest first
    async fn terms(
        &self,
        filter: &EventFilter,
        field: &str,
        size: usize,
        window: TimeWindow,
    ) -> Result<Vec<TermCount>>;
}

/// Elasticsearch `_search` backend
pub struct ElasticsearchStore {
    client: reqwest::Client,
    base_url: String,
    index: String,
    timestamp_field: String,
}

impl ElasticsearchStore {
    pub fn new(base_url: &str, index: &str, timestamp_field: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DecoyError::Query(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            timestamp_field: timestamp_field.to_string(),
        })
    }

    fn search_url(&self) -> String {
        format!("{}/{}/_search", self.base_url, self.index)
    }

    /// Bool query for the window plus the filter
    pub fn query(&self, filter: &EventFilter, window: TimeWindow) -> Value {
        let mut range = serde_json::Map::new();
        range.insert(
            self.timestamp_field.clone(),
            json!({
                "gte": window.start.to_rfc3339(),
                "lt": window.end.to_rfc3339(),
            }),
        );
        let mut must = vec![json!({ "range": Value::Object(range) })];

        match filter {
            EventFilter::All => {}
            EventFilter::EventTypes(types) => must.push(json!({ "terms": { "event_type": types } })),
            EventFilter::Tagged(tag) => must.push(json!({ "term": { "attack_types": tag.as_str() } })),
            EventFilter::HasField(field) => must.push(json!({ "exists": { "field": field } })),
        }

        json!({ "bool": { "must": must } })
    }

    async fn search(&self, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.search_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| DecoyError::Query(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DecoyError::Query(format!(
                "search returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DecoyError::Query(format!("invalid search response: {}", e)))
    }
}

#[async_trait]
impl EventStore for ElasticsearchStore {
    async fn count(&self, filter: &EventFilter, window: TimeWindow) -> Result<u64> {
        let body = json!({
            "size": 0,
            "track_total_hits": true,
            "query": self.query(filter, window),
        });
        let response = self.search(body).await?;
        parse_total_hits(&response)
    }

    async fn cardinality(&self, filter: &EventFilter, field: &str, window: TimeWindow) -> Result<u64> {
        let body = json!({
            "size": 0,
            "query": self.query(filter, window),
            "aggs": { "distinct": { "cardinality": { "field": field } } },
        });
        let response = self.search(body).await?;
        response
            .pointer("/aggregations/distinct/value")
            .and_then(Value::as_u64)
            .ok_or_else(|| DecoyError::Query("missing cardinality aggregation".into()))
    }

    async fn terms(
        &self,
        filter: &EventFilter,
        field: &str,
        size: usize,
        window: TimeWindow,
    ) -> Result<Vec<TermCount>> {
        let body = json!({
            "size": 0,
            "query": self.query(filter, window),
            "aggs": { "top": { "terms": { "field": field, "size": size } } },
        });
        let response = self.search(body).await?;
        parse_term_buckets(&response)
    }
}

/// `hits.total` is an object on ES 7+ and a bare number before that
fn parse_total_hits(response: &Value) -> Result<u64> {
    let total = response
        .pointer("/hits/total")
        .ok_or_else(|| DecoyError::Query("missing hits.total".into()))?;
    total
        .get("value")
        .and_then(Value::as_u64)
        .or_else(|| total.as_u64())
        .ok_or_else(|| DecoyError::Query("unreadable hits.total".into()))
}

fn parse_term_buckets(response: &Value) -> Result<Vec<TermCount>> {
    let buckets = response
        .pointer("/aggregations/top/buckets")
        .and_then(Value::as_array)
        .ok_or_else(|| DecoyError::Query("missing terms aggregation".into()))?;

    Ok(buckets
        .iter()
        .filter_map(|bucket| {
            let key = match bucket.get("key_as_string").or_else(|| bucket.get("key"))? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let count = bucket.get("doc_count")?.as_u64()?;
            Some(TermCount { key, count })
        })
        .collect())
}

/// A stored event reduced to the fields the checks look at
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub source_ip: Option<String>,
    pub attack_types: Vec<AttackTag>,
}

impl StoredEvent {
    pub fn new(timestamp: DateTime<Utc>, event_type: &str, source_ip: &str) -> Self {
        Self {
            timestamp,
            event_type: event_type.to_string(),
            source_ip: Some(source_ip.to_string()),
            attack_types: Vec::new(),
        }
    }

    pub fn tagged(mut self, tag: AttackTag) -> Self {
        self.attack_types.push(tag);
        self
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "source_ip" => self.source_ip.clone(),
            "event_type" => Some(self.event_type.clone()),
            _ => None,
        }
    }

    fn matches(&self, filter: &EventFilter) -> bool {
        match filter {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.iter().any(|t| *t == self.event_type),
            EventFilter::Tagged(tag) => self.attack_types.contains(tag),
            EventFilter::HasField(field) => self.field(field).is_some(),
        }
    }
}

/// In-process store with the same aggregate semantics
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: StoredEvent) {
        self.events.lock().push(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = StoredEvent>) {
        self.events.lock().extend(events);
    }

    fn matching(&self, filter: &EventFilter, window: TimeWindow) -> Vec<StoredEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| window.contains(e.timestamp) && e.matches(filter))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn count(&self, filter: &EventFilter, window: TimeWindow) -> Result<u64> {
        Ok(self.matching(filter, window).len() as u64)
    }

    async fn cardinality(&self, filter: &EventFilter, field: &str, window: TimeWindow) -> Result<u64> {
        let distinct: HashSet<String> = self
            .matching(filter, window)
            .iter()
            .filter_map(|e| e.field(field))
            .collect();
        Ok(distinct.len() as u64)
    }

    async fn terms(
        &self,
        filter: &EventFilter,
        field: &str,
        size: usize,
        window: TimeWindow,
    ) -> Result<Vec<TermCount>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for event in self.matching(filter, window) {
            if let Some(value) = event.field(field) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }

        let mut buckets: Vec<TermCount> = counts
            .into_iter()
            .map(|(key, count)| TermCount { key, count })
            .collect();
        buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        buckets.truncate(size);
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_query_shape() {
        let store = ElasticsearchStore::new(
            "http://elasticsearch:9200/",
            "honeypot-logs-*",
            "@timestamp",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(store.search_url(), "http://elasticsearch:9200/honeypot-logs-*/_search");

        let window = TimeWindow::trailing(now(), 3600);
        let query = store.query(&EventFilter::Tagged(AttackTag::IotBotnet), window);
        let must = query.pointer("/bool/must").unwrap().as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(
            must[0].pointer("/range/@timestamp/gte").unwrap(),
            "2024-05-01T11:30:00+00:00"
        );
        assert_eq!(must[1], json!({ "term": { "attack_types": "iot_botnet" } }));
    }

    #[test]
    fn test_parse_responses() {
        assert_eq!(parse_total_hits(&json!({ "hits": { "total": { "value": 42 } } })).unwrap(), 42);
        assert_eq!(parse_total_hits(&json!({ "hits": { "total": 7 } })).unwrap(), 7);
        assert!(parse_total_hits(&json!({})).is_err());

        let response = json!({
            "aggregations": { "top": { "buckets": [
                { "key": "198.51.100.7", "doc_count": 30 },
                { "key": 3232235777u64, "key_as_string": "192.168.1.1", "doc_count": 4 },
            ] } }
        });
        let buckets = parse_term_buckets(&response).unwrap();
        assert_eq!(buckets[0], TermCount { key: "198.51.100.7".into(), count: 30 });
        assert_eq!(buckets[1].key, "192.168.1.1");
    }

    #[tokio::test]
    async fn test_memory_store_aggregates() {
        let store = MemoryStore::new();
        let t = now() - ChronoDuration::minutes(10);
        store.extend([
            StoredEvent::new(t, "login_attempt", "10.0.0.1"),
            StoredEvent::new(t, "login_attempt", "10.0.0.1"),
            StoredEvent::new(t, "connection", "10.0.0.2").tagged(AttackTag::IotBotnet),
            // outside the window
            StoredEvent::new(now() - ChronoDuration::hours(2), "login_attempt", "10.0.0.3"),
        ]);
        let window = TimeWindow::trailing(now(), 3600);

        let logins = EventFilter::EventTypes(vec!["login_attempt"]);
        assert_eq!(store.count(&logins, window).await.unwrap(), 2);
        assert_eq!(store.count(&EventFilter::Tagged(AttackTag::IotBotnet), window).await.unwrap(), 1);
        assert_eq!(
            store
                .cardinality(&EventFilter::HasField("source_ip"), "source_ip", window)
                .await
                .unwrap(),
            2
        );

        let top = store.terms(&EventFilter::All, "source_ip", 1, window).await.unwrap();
        assert_eq!(top, vec![TermCount { key: "10.0.0.1".into(), count: 2 }]);
    }
}
