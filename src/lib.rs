pub mod alerts;
pub mod classify;
pub mod config;
pub mod decoy;
pub mod error;
pub mod listener;
pub mod models;
pub mod sink;
pub mod tracker;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use alerts::notify::NotifierSet;
use alerts::AlertEngine;
use classify::HttpClassifier;
use config::Config;
use decoy::ftp::FtpDecoy;
use decoy::http::HttpDecoy;
use decoy::ssh::SshDecoy;
use decoy::telnet::TelnetDecoy;
use decoy::Decoy;
use listener::{ConnectionLimiter, Listener, ListenerContext};
use models::Service;
use sink::{EventSender, EventSink};
use tracker::ActivityTracker;

/// Build the handler for one service
pub fn build_decoy(
    service: Service,
    config: &Config,
    classifier: Arc<HttpClassifier>,
    tracker: Arc<ActivityTracker>,
) -> Result<Arc<dyn Decoy>> {
    let decoys = &config.decoys;
    let decoy: Arc<dyn Decoy> = match service {
        Service::Ftp => Arc::new(FtpDecoy::new(decoys.ftp.clone(), tracker)),
        Service::Http => Arc::new(HttpDecoy::new(&decoys.http, classifier, tracker)),
        Service::Ssh => Arc::new(SshDecoy::new(&decoys.ssh, tracker)?),
        Service::Telnet => Arc::new(TelnetDecoy::new(&decoys.telnet, tracker)),
    };
    Ok(decoy)
}

/// Bound listeners for a set of services, not yet accepting
pub struct Fleet {
    listeners: Vec<(Service, Listener)>,
}

impl Fleet {
    /// Bind every requested service. Any bind failure aborts.
    pub async fn bind(
        config: &Config,
        services: &[Service],
        sender: EventSender,
        tracker: Arc<ActivityTracker>,
    ) -> Result<Self> {
        let classifier = Arc::new(HttpClassifier::new().context("Failed to build HTTP classifier")?);
        let ctx = ListenerContext {
            sender,
            tracker: tracker.clone(),
            limiter: Arc::new(ConnectionLimiter::new(
                config.limits.max_connections,
                config.limits.max_per_ip,
            )),
        };

        let mut listeners = Vec::new();
        for &service in services {
            let decoy = build_decoy(service, config, classifier.clone(), tracker.clone())
                .with_context(|| format!("Failed to set up {} decoy", service))?;
            let settings = config.decoys.listener(service);
            let listener = Listener::bind(decoy, &settings, ctx.clone()).await?;
            listeners.push((service, listener));
        }

        Ok(Self { listeners })
    }

    pub fn local_addrs(&self) -> Vec<(Service, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|(service, l)| l.local_addr().ok().map(|addr| (*service, addr)))
            .collect()
    }

    pub fn local_addr(&self, service: Service) -> Option<SocketAddr> {
        self.local_addrs()
            .into_iter()
            .find(|(s, _)| *s == service)
            .map(|(_, addr)| addr)
    }

    /// Start every accept loop
    pub fn spawn(self, shutdown: watch::Receiver<bool>, grace: Duration) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|(_, listener)| tokio::spawn(listener.run(shutdown.clone(), grace)))
            .collect()
    }
}

/// The decoy fleet plus its forwarder and periodic statistics
pub struct Daemon {
    config: Config,
    services: Vec<Service>,
}

impl Daemon {
    /// Run every decoy enabled in `config`
    pub fn new(config: Config) -> Self {
        let services = Service::ALL
            .into_iter()
            .filter(|s| config.decoys.listener(*s).enabled)
            .collect();
        Self { config, services }
    }

    /// Restrict to the given services, enabled or not
    pub fn only(mut self, services: Vec<Service>) -> Self {
        self.services = services;
        self
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Run until Ctrl-C or SIGTERM, then drain within the grace period
    pub async fn run(self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("No decoys enabled");
        }

        let tracker = Arc::new(ActivityTracker::new());
        let sink = EventSink::new(self.config.sink.clone()).context("Failed to start event sink")?;
        let (sender, forwarder) = sink.start();

        let fleet = Fleet::bind(&self.config, &self.services, sender, tracker.clone()).await?;
        let grace = self.config.limits.shutdown_grace();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listeners = fleet.spawn(shutdown_rx.clone(), grace);

        info!(
            "honeywatch sensor {} running {} decoy(s)",
            self.config.general.sensor_name,
            self.services.len()
        );

        let stats = tokio::spawn(stats_loop(
            tracker.clone(),
            Duration::from_secs(self.config.limits.stats_interval_secs.max(1)),
            shutdown_rx,
        ));

        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);

        for handle in listeners {
            let _ = handle.await;
        }
        let _ = stats.await;

        // Listeners held the last senders; the forwarder ends once drained.
        match tokio::time::timeout(grace, forwarder).await {
            Ok(_) => info!("Event forwarder drained"),
            Err(_) => warn!("Event forwarder still busy after {:?}, exiting", grace),
        }

        tracker.log_summary();
        info!("Daemon stopped");
        Ok(())
    }
}

/// Run the alerting engine until Ctrl-C or SIGTERM
pub async fn run_alerts(config: &Config) -> Result<()> {
    let engine = alert_engine(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    task.await.context("Alert engine task failed")?;
    Ok(())
}

/// Engine backed by the configured Elasticsearch and notifiers
pub fn alert_engine(config: &Config) -> Result<AlertEngine> {
    config.validate_alerts().context("Invalid configuration")?;
    let store = config
        .alerts
        .elasticsearch()
        .context("Failed to set up event store client")?;
    let notifiers = NotifierSet::from_config(&config.notify).context("Failed to set up notifiers")?;
    Ok(AlertEngine::new(config.alerts.clone(), Arc::new(store), notifiers))
}

async fn stats_loop(tracker: Arc<ActivityTracker>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => tracker.log_summary(),
            _ = listener::wait_for_shutdown(&mut shutdown) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_services_follow_config() {
        let mut config = Config::default();
        config.decoys.ssh.enabled = false;
        let daemon = Daemon::new(config.clone());
        assert_eq!(
            daemon.services(),
            &[Service::Ftp, Service::Http, Service::Telnet]
        );

        let daemon = Daemon::new(config).only(vec![Service::Ssh]);
        assert_eq!(daemon.services(), &[Service::Ssh]);
    }

    #[tokio::test]
    async fn test_fleet_binds_ephemeral_ports() {
        let mut config = Config::default();
        for service in Service::ALL {
            let localhost = "127.0.0.1".parse().unwrap();
            match service {
                Service::Ftp => {
                    config.decoys.ftp.bind = localhost;
                    config.decoys.ftp.port = 0;
                }
                Service::Http => {
                    config.decoys.http.bind = localhost;
                    config.decoys.http.port = 0;
                }
                Service::Ssh => {
                    config.decoys.ssh.bind = localhost;
                    config.decoys.ssh.port = 0;
                }
                Service::Telnet => {
                    config.decoys.telnet.bind = localhost;
                    config.decoys.telnet.port = 0;
                }
            }
        }
        let (sender, _rx) = EventSender::channel(16);
        let fleet = Fleet::bind(&config, &Service::ALL, sender, Arc::new(ActivityTracker::new()))
            .await
            .unwrap();

        let addrs = fleet.local_addrs();
        assert_eq!(addrs.len(), 4);
        assert!(addrs.iter().all(|(_, a)| a.port() != 0));
        assert!(fleet.local_addr(Service::Ssh).is_some());
    }

    #[test]
    fn test_alert_engine_rejects_out_of_range_window() {
        let mut config = Config::default();
        config.alerts.window_secs = 10_000_000_000_000_000;
        let err = alert_engine(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("alerts.window_secs"));
    }
}
