use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alerts::notify::NotifyConfig;
use crate::alerts::AlertsConfig;
use crate::models::Service;
use crate::sink::{SinkConfig, SinkTarget};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub decoys: DecoysConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/honeywatch/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("honeywatch/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LOG_LEVEL") {
            self.general.log_level = v;
        }

        // Event sink. LOGSTASH_PORT is the Beats input, not the HTTP input.
        let logstash_host = lookup("LOGSTASH_HOST");
        let logstash_port = lookup("LOGSTASH_HTTP_PORT");
        if logstash_host.is_some() || logstash_port.is_some() {
            let host = logstash_host.unwrap_or_else(|| "logstash".to_string());
            let port = logstash_port.unwrap_or_else(|| DEFAULT_LOGSTASH_HTTP_PORT.to_string());
            let url = format!("http://{}:{}", host, port);
            let mut replaced = false;
            for target in self.sink.targets.iter_mut() {
                if let SinkTarget::Webhook { url: existing } = target {
                    *existing = url.clone();
                    replaced = true;
                }
            }
            if !replaced {
                self.sink.targets.push(SinkTarget::Webhook { url });
            }
        }

        // Event store and thresholds
        if let Some(v) = lookup("ELASTICSEARCH_HOST") {
            self.alerts.elasticsearch_url = v;
        }
        let thresholds = &mut self.alerts.thresholds;
        for (key, slot) in [
            ("ALERT_THRESHOLD_HIGH_VOLUME", &mut thresholds.high_volume),
            ("ALERT_THRESHOLD_UNIQUE_IPS", &mut thresholds.unique_ips),
            ("ALERT_THRESHOLD_BRUTE_FORCE", &mut thresholds.brute_force),
            ("ALERT_THRESHOLD_IOT_BOTNET", &mut thresholds.iot_botnet),
        ] {
            if let Some(v) = lookup(key) {
                if let Ok(n) = v.trim().parse() {
                    *slot = n;
                }
            }
        }

        // Email
        let email = &mut self.notify.email;
        if let Some(v) = lookup("SMTP_SERVER") {
            email.smtp_server = v;
        }
        if let Some(v) = lookup("SMTP_PORT") {
            if let Ok(port) = v.trim().parse() {
                email.smtp_port = port;
            }
        }
        if let Some(v) = lookup("SMTP_USERNAME") {
            email.username = Some(v);
        }
        if let Some(v) = lookup("SMTP_PASSWORD") {
            email.password = Some(v);
        }
        if let Some(v) = lookup("ALERT_EMAIL") {
            email.recipients = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            email.enabled = !email.recipients.is_empty();
        }

        // Slack
        if let Some(v) = lookup("SLACK_WEBHOOK_URL") {
            if !v.trim().is_empty() {
                self.notify.slack.webhook_url = Some(v);
            }
        }
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        self.validate_decoys()?;
        self.validate_alerts()
    }

    /// Checks for `run`: listeners, limits and the sink
    pub fn validate_decoys(&self) -> Result<()> {
        check_secs("limits.shutdown_grace_secs", self.limits.shutdown_grace_secs, 0)?;
        check_secs("limits.stats_interval_secs", self.limits.stats_interval_secs, 1)?;
        check_secs("sink.timeout_secs", self.sink.timeout_secs, 1)?;
        check_secs("decoys.telnet.login_delay_secs", self.decoys.telnet.login_delay_secs, 0)?;
        if self.limits.max_connections == 0 {
            bail!("limits.max_connections must be greater than zero");
        }
        if self.limits.max_per_ip == 0 {
            bail!("limits.max_per_ip must be greater than zero");
        }
        if self.sink.queue_size == 0 {
            bail!("sink.queue_size must be greater than zero");
        }

        let mut seen = HashSet::new();
        for service in Service::ALL {
            let listener = self.decoys.listener(service);
            if !listener.enabled {
                continue;
            }
            if listener.port == 0 {
                bail!("decoys.{}.port must be non-zero", service);
            }
            check_secs(
                &format!("decoys.{}.idle_timeout_secs", service),
                listener.idle_timeout.as_secs(),
                1,
            )?;
            if !seen.insert(listener.addr()) {
                bail!("decoys.{} reuses address {}", service, listener.addr());
            }
        }

        let ftp = &self.decoys.ftp;
        if ftp.passive_port_min > ftp.passive_port_max {
            bail!("decoys.ftp passive port range is inverted");
        }

        Ok(())
    }

    /// Checks for `alerts`: every interval must fit a chrono duration
    pub fn validate_alerts(&self) -> Result<()> {
        let alerts = &self.alerts;
        for (name, value) in [
            ("alerts.query_timeout_secs", alerts.query_timeout_secs),
            ("alerts.window_secs", alerts.window_secs),
            ("alerts.check_interval_secs", alerts.check_interval_secs),
            ("alerts.cleanup_interval_secs", alerts.cleanup_interval_secs),
            ("alerts.poll_interval_secs", alerts.poll_interval_secs),
            ("alerts.dedup_retention_secs", alerts.dedup_retention_secs),
        ] {
            check_secs(name, value, 1)?;
        }
        Ok(())
    }
}

/// Longest interval any `*_secs` setting accepts (one year)
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

const DEFAULT_LOGSTASH_HTTP_PORT: u16 = 5000;

fn check_secs(name: &str, value: u64, min: u64) -> Result<()> {
    if value < min {
        bail!("{} must be at least {}", name, min);
    }
    if value > MAX_INTERVAL_SECS {
        bail!("{} must be at most {} (one year)", name, MAX_INTERVAL_SECS);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sensor name shown in logs and alerts
    #[serde(default = "default_sensor_name")]
    pub sensor_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sensor_name: default_sensor_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Concurrent sessions across the whole fleet
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Concurrent sessions from one source address
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: usize,

    /// How long shutdown waits for sessions and the forwarder
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Interval between activity summaries in the log
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_ip: default_max_per_ip(),
            shutdown_grace_secs: default_shutdown_grace(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl LimitsConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Bind settings shared by every decoy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout: Duration,
}

impl ListenerSettings {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DecoysConfig {
    #[serde(default)]
    pub ftp: FtpConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub telnet: TelnetConfig,
}

impl DecoysConfig {
    pub fn listener(&self, service: Service) -> ListenerSettings {
        let (enabled, bind, port, idle) = match service {
            Service::Ftp => (self.ftp.enabled, self.ftp.bind, self.ftp.port, self.ftp.idle_timeout_secs),
            Service::Http => (
                self.http.enabled,
                self.http.bind,
                self.http.port,
                self.http.idle_timeout_secs,
            ),
            Service::Ssh => (self.ssh.enabled, self.ssh.bind, self.ssh.port, self.ssh.idle_timeout_secs),
            Service::Telnet => (
                self.telnet.enabled,
                self.telnet.bind,
                self.telnet.port,
                self.telnet.idle_timeout_secs,
            ),
        };
        ListenerSettings {
            enabled,
            bind,
            port,
            idle_timeout: Duration::from_secs(idle),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub banner: String,
    /// Failed logins before the session is closed
    pub max_login_attempts: u32,
    /// Advertised passive range; never bound since data commands need a login
    pub passive_port_min: u16,
    pub passive_port_max: u16,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: 21,
            idle_timeout_secs: default_idle_timeout(),
            banner: "(vsFTPd 3.0.3)".to_string(),
            max_login_attempts: 3,
            passive_port_min: 21000,
            passive_port_max: 21010,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
    /// Value of the `Server` response header
    pub server_header: String,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: 80,
            idle_timeout_secs: default_idle_timeout(),
            server_header: "Apache/2.4.41 (Ubuntu)".to_string(),
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
    /// Identification string sent before key exchange
    pub server_id: String,
    /// Delay before each authentication rejection
    pub auth_rejection_delay_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: 22,
            idle_timeout_secs: default_idle_timeout(),
            server_id: "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5".to_string(),
            auth_rejection_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
    /// Pause after "Login incorrect" before the fake shell starts
    pub login_delay_secs: u64,
    pub max_line_len: usize,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: 23,
            idle_timeout_secs: default_idle_timeout(),
            login_delay_secs: 2,
            max_line_len: 1024,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sensor_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "honeywatch".to_string())
}

fn default_max_connections() -> usize {
    256
}

fn default_max_per_ip() -> usize {
    5
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_stats_interval() -> u64 {
    300
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_idle_timeout() -> u64 {
    30
}
