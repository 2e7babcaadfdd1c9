//! In-memory activity counters shared by every decoy.
//!
//! Counts are approximate process-lifetime statistics. They only ever grow,
//! and each logical resource has its own lock so decoys do not contend on a
//! single mutex.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::models::{AttackTag, Service};

/// Username and password frequencies
#[derive(Default)]
pub struct CredentialCounter {
    usernames: Mutex<HashMap<String, u64>>,
    passwords: Mutex<HashMap<String, u64>>,
}

impl CredentialCounter {
    pub fn record(&self, username: &str, password: &str) {
        *self.usernames.lock().entry(username.to_string()).or_insert(0) += 1;
        *self.passwords.lock().entry(password.to_string()).or_insert(0) += 1;
    }

    pub fn username_count(&self, username: &str) -> u64 {
        self.usernames.lock().get(username).copied().unwrap_or(0)
    }

    pub fn password_count(&self, password: &str) -> u64 {
        self.passwords.lock().get(password).copied().unwrap_or(0)
    }

    pub fn top_usernames(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.usernames.lock(), n)
    }

    pub fn top_passwords(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.passwords.lock(), n)
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default)]
pub struct ActivitySnapshot {
    pub connections: u64,
    pub login_attempts: u64,
    pub unique_ips: usize,
    pub connections_by_service: Vec<(Service, u64)>,
    pub top_usernames: Vec<(String, u64)>,
    pub top_passwords: Vec<(String, u64)>,
    pub top_commands: Vec<(String, u64)>,
    pub top_user_agents: Vec<(String, u64)>,
    pub http_methods: Vec<(String, u64)>,
    pub attack_tags: Vec<(String, u64)>,
}

/// Cross-connection statistics, injected into every decoy
#[derive(Default)]
pub struct ActivityTracker {
    connections: AtomicU64,
    login_attempts: AtomicU64,
    by_service: Mutex<HashMap<Service, u64>>,
    source_ips: Mutex<HashSet<IpAddr>>,
    credentials: CredentialCounter,
    commands: Mutex<HashMap<String, u64>>,
    user_agents: Mutex<HashMap<String, u64>>,
    http_methods: Mutex<HashMap<String, u64>>,
    attack_tags: Mutex<HashMap<AttackTag, u64>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(&self) -> &CredentialCounter {
        &self.credentials
    }

    pub fn record_connection(&self, service: Service, ip: IpAddr) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        *self.by_service.lock().entry(service).or_insert(0) += 1;
        self.source_ips.lock().insert(ip);
    }

    pub fn record_login(&self, username: &str, password: &str) {
        self.login_attempts.fetch_add(1, Ordering::Relaxed);
        self.credentials.record(username, password);
    }

    pub fn record_command(&self, command: &str) {
        *self.commands.lock().entry(command.to_string()).or_insert(0) += 1;
    }

    pub fn record_http(&self, method: &str, user_agent: &str) {
        *self.http_methods.lock().entry(method.to_string()).or_insert(0) += 1;
        *self.user_agents.lock().entry(user_agent.to_string()).or_insert(0) += 1;
    }

    pub fn record_tags(&self, tags: &[AttackTag]) {
        if tags.is_empty() {
            return;
        }
        let mut counts = self.attack_tags.lock();
        for tag in tags {
            *counts.entry(*tag).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self, n: usize) -> ActivitySnapshot {
        let mut by_service: Vec<(Service, u64)> =
            self.by_service.lock().iter().map(|(s, c)| (*s, *c)).collect();
        by_service.sort();

        let tags: HashMap<String, u64> = self
            .attack_tags
            .lock()
            .iter()
            .map(|(t, c)| (t.to_string(), *c))
            .collect();

        ActivitySnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            login_attempts: self.login_attempts.load(Ordering::Relaxed),
            unique_ips: self.source_ips.lock().len(),
            connections_by_service: by_service,
            top_usernames: self.credentials.top_usernames(n),
            top_passwords: self.credentials.top_passwords(n),
            top_commands: top_n(&self.commands.lock(), n),
            top_user_agents: top_n(&self.user_agents.lock(), n),
            http_methods: top_n(&self.http_methods.lock(), n),
            attack_tags: top_n(&tags, n),
        }
    }

    /// Write a one-line summary plus top lists to the log
    pub fn log_summary(&self) {
        let snap = self.snapshot(5);
        info!(
            "Activity: {} connections, {} login attempts, {} unique IPs",
            snap.connections, snap.login_attempts, snap.unique_ips
        );
        if !snap.top_usernames.is_empty() {
            info!("Top usernames: {}", format_counts(&snap.top_usernames));
        }
        if !snap.top_passwords.is_empty() {
            info!("Top passwords: {}", format_counts(&snap.top_passwords));
        }
        if !snap.top_commands.is_empty() {
            info!("Top commands: {}", format_counts(&snap.top_commands));
        }
        if !snap.attack_tags.is_empty() {
            info!("Attack types: {}", format_counts(&snap.attack_tags));
        }
    }
}

fn top_n(map: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

fn format_counts(entries: &[(String, u64)]) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{:?}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
