use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};

use honeywatch::alerts::notify::NotifierSet;
use honeywatch::classify::HttpClassifier;
use honeywatch::config::Config;
use honeywatch::models::{Service, ThreatLevel};
use honeywatch::{alert_engine, run_alerts, Daemon};

#[derive(Parser)]
#[command(name = "honeywatch")]
#[command(author, version, about = "Multi-protocol honeypot sensor with threshold alerting")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the decoys and event forwarder
    Run {
        /// Only run these decoys (comma separated)
        #[arg(long, value_delimiter = ',')]
        only: Option<Vec<Service>>,
    },

    /// Run the alerting engine
    Alerts {
        /// Run a single check cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show how the HTTP classifier tags a request
    Classify {
        /// Request URI, including the query string
        uri: String,

        #[arg(short, long, default_value = "GET")]
        method: String,

        #[arg(short, long, default_value = "")]
        user_agent: String,
    },

    /// List configured decoys
    Listeners,

    /// Generate default configuration
    GenConfig {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct ListenerRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Idle Timeout")]
    idle_timeout: String,
}

/// Load the config file (or defaults), then apply environment overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run { only } => cmd_run(config, only).await,
        Commands::Alerts { once } => cmd_alerts(config, once).await,
        Commands::Classify {
            uri,
            method,
            user_agent,
        } => cmd_classify(&uri, &method, &user_agent),
        Commands::Listeners => cmd_listeners(&config),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_run(config: Config, only: Option<Vec<Service>>) -> Result<()> {
    config.validate_decoys().context("Invalid configuration")?;

    let mut daemon = Daemon::new(config);
    if let Some(services) = only {
        daemon = daemon.only(services);
    }

    let names: Vec<_> = daemon.services().iter().map(|s| s.to_string()).collect();
    println!("Starting decoys: {}", names.join(", ").green());
    daemon.run().await
}

async fn cmd_alerts(config: Config, once: bool) -> Result<()> {
    if !once {
        return run_alerts(&config).await;
    }

    let notifiers = NotifierSet::from_config(&config.notify)?;
    println!(
        "Running one check cycle against {} (notifiers: {})",
        config.alerts.elasticsearch_url,
        if notifiers.is_empty() {
            "none".to_string()
        } else {
            notifiers.names().join(", ")
        }
    );

    let mut engine = alert_engine(&config)?;
    let summary = engine.run_checks(chrono::Utc::now()).await;

    for alert in &summary.dispatched {
        println!(
            "{} {}",
            colorize_level(alert.severity, &format!("[{}]", alert.severity_label())),
            alert.subject.bold()
        );
        println!("    {}", alert.message.replace('\n', "\n    "));
    }
    if summary.dispatched.is_empty() {
        println!("{}", "No thresholds exceeded".green());
    }
    for check in &summary.failed_checks {
        println!("{} {} check failed (see log)", "!".red().bold(), check);
    }

    Ok(())
}

fn cmd_classify(uri: &str, method: &str, user_agent: &str) -> Result<()> {
    let classifier = HttpClassifier::new().context("Failed to build classifier")?;
    let result = classifier.classify(method, uri, user_agent);

    println!("{} {}", method.to_uppercase().bold(), uri);
    if result.is_empty() {
        println!("  {}", "no attack patterns matched".green());
        return Ok(());
    }

    let tags: Vec<&str> = result.tags.iter().map(|t| t.as_str()).collect();
    println!("  Tags:  {}", tags.join(", ").yellow());
    println!("  Level: {}", colorize_level(result.level, result.level.as_str()));
    Ok(())
}

fn cmd_listeners(config: &Config) -> Result<()> {
    let rows: Vec<ListenerRow> = Service::ALL
        .into_iter()
        .map(|service| {
            let listener = config.decoys.listener(service);
            ListenerRow {
                service: service.to_string(),
                enabled: if listener.enabled { "yes" } else { "no" }.to_string(),
                address: listener.addr().to_string(),
                idle_timeout: format!("{}s", listener.idle_timeout.as_secs()),
            }
        })
        .collect();

    println!("{}", Table::new(rows));

    let ftp = &config.decoys.ftp;
    println!(
        "FTP passive range {}-{} (reserved, not bound)",
        ftp.passive_port_min, ftp.passive_port_max
    );
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn colorize_level(level: ThreatLevel, text: &str) -> colored::ColoredString {
    match level {
        ThreatLevel::Low => text.green(),
        ThreatLevel::Medium => text.yellow(),
        ThreatLevel::High => text.red(),
        ThreatLevel::Critical => text.red().bold(),
    }
}
