//! Event sink
//!
//! Decoys hand events to an [`Emitter`], which pushes them onto a bounded
//! queue without waiting. A single forwarder task drains the queue and
//! delivers every event, as one JSON object, to each configured target.
//! Local targets are written inline; webhook posts run in the background
//! under a cap, so a slow collector never delays the files.
//! - HTTP webhook (Logstash HTTP input)
//! - Per-service JSONL file
//! - Stdout
//!
//! Delivery is best-effort. A failed target is logged and the event is
//! dropped for that target; nothing is retried or buffered.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{DecoyError, Result};
use crate::models::{Event, Service};

/// Sink output target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkTarget {
    /// POST each event to an HTTP endpoint
    Webhook { url: String },
    /// Append each event to `{dir}/{service}.log`
    File { dir: PathBuf },
    /// Print each event (for debugging)
    Stdout,
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Output targets
    #[serde(default = "default_targets")]
    pub targets: Vec<SinkTarget>,

    /// Events queued between decoys and the forwarder
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Per-request timeout for the webhook target
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Webhook posts allowed in flight before further posts are dropped
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_targets() -> Vec<SinkTarget> {
    vec![
        SinkTarget::Webhook {
            url: "http://logstash:5000".to_string(),
        },
        SinkTarget::File {
            dir: PathBuf::from("/var/log/honeypot"),
        },
    ]
}

fn default_queue_size() -> usize {
    1024
}

fn default_timeout() -> u64 {
    5
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            queue_size: default_queue_size(),
            timeout_secs: default_timeout(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Handle for creating per-service emitters
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Bare queue with no forwarder attached; the caller owns the receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emitter(&self, service: Service) -> Emitter {
        Emitter {
            service,
            tx: self.tx.clone(),
        }
    }
}

/// Event emission shared by every decoy, bound to one service name.
#[derive(Clone)]
pub struct Emitter {
    service: Service,
    tx: mpsc::Sender<Event>,
}

impl Emitter {
    pub fn service(&self) -> Service {
        self.service
    }

    /// Queue an event for forwarding. Never blocks; a full queue drops it.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "Event queue full, dropping {} event from {}",
                    event.event_type(),
                    event.source_ip
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event forwarder stopped, dropping {} event", self.service);
            }
        }
    }
}

/// Forwards queued events to the configured targets
pub struct EventSink {
    config: SinkConfig,
    http_client: Option<reqwest::Client>,
}

impl EventSink {
    pub fn new(config: SinkConfig) -> Result<Self> {
        let http_client = if config
            .targets
            .iter()
            .any(|t| matches!(t, SinkTarget::Webhook { .. }))
        {
            Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Spawn the forwarder. It exits once every sender has been dropped
    /// and the queue is drained.
    pub fn start(self) -> (EventSender, JoinHandle<()>) {
        let (sender, rx) = EventSender::channel(self.config.queue_size);
        let handle = tokio::spawn(self.run(rx));
        (sender, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<Event>) {
        info!(
            "Event forwarder started with {} target(s)",
            self.config.targets.len()
        );
        let slots = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();
        let mut forwarded: u64 = 0;

        while let Some(event) = rx.recv().await {
            if let Some(line) = serialize(&event) {
                self.write_local(&event, &line).await;
                self.spawn_webhooks(&event, &line, &slots, &mut in_flight);
            }
            while in_flight.try_join_next().is_some() {}
            forwarded += 1;
        }

        while in_flight.join_next().await.is_some() {}
        info!("Event forwarder stopped after {} events", forwarded);
    }

    /// Deliver one event to every target, waiting for the webhooks
    pub async fn submit(&self, event: &Event) {
        let Some(line) = serialize(event) else {
            return;
        };
        self.write_local(event, &line).await;

        let Some(client) = &self.http_client else {
            return;
        };
        for url in self.webhook_urls() {
            if let Err(e) = post_event(client, url, line.clone()).await {
                error!("Failed to forward {} event: {}", event.event_type(), e);
            }
        }
    }

    /// File and stdout targets, in order
    async fn write_local(&self, event: &Event, line: &str) {
        for target in &self.config.targets {
            let result = match target {
                SinkTarget::File { dir } => write_to_file(dir, event.service, line).await,
                SinkTarget::Stdout => {
                    println!("{}", line);
                    Ok(())
                }
                SinkTarget::Webhook { .. } => continue,
            };
            if let Err(e) = result {
                error!("Failed to write {} event: {}", event.event_type(), e);
            }
        }
    }

    /// Post to every webhook in the background. With every slot taken the
    /// post is dropped so a stalled collector cannot back up the queue.
    fn spawn_webhooks(
        &self,
        event: &Event,
        line: &str,
        slots: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) {
        let Some(client) = &self.http_client else {
            return;
        };
        for url in self.webhook_urls() {
            let permit = match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "Webhook {} saturated, dropping {} event from {}",
                        url,
                        event.event_type(),
                        event.source_ip
                    );
                    continue;
                }
            };
            let client = client.clone();
            let url = url.to_string();
            let body = line.to_string();
            let event_type = event.event_type();
            in_flight.spawn(async move {
                if let Err(e) = post_event(&client, &url, body).await {
                    error!("Failed to forward {} event: {}", event_type, e);
                }
                drop(permit);
            });
        }
    }

    fn webhook_urls(&self) -> impl Iterator<Item = &str> {
        self.config.targets.iter().filter_map(|t| match t {
            SinkTarget::Webhook { url } => Some(url.as_str()),
            _ => None,
        })
    }
}

fn serialize(event: &Event) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(line) => Some(line),
        Err(e) => {
            error!("Failed to serialize {} event: {}", event.event_type(), e);
            None
        }
    }
}

/// POST one event to a webhook
async fn post_event(client: &reqwest::Client, url: &str, body: String) -> Result<()> {
    let resp = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(DecoyError::SinkUnavailable(format!(
            "webhook returned {}",
            resp.status()
        )));
    }

    Ok(())
}

/// Append one JSON line to the service's log file
async fn write_to_file(dir: &Path, service: Service, line: &str) -> Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.log", service));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;

    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;

    Ok(())
}
