use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Version stamped into every emitted event.
pub const EVENT_SCHEMA_VERSION: &str = "1.0.0";

/// Decoy protocol a record came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Ftp,
    Http,
    Ssh,
    Telnet,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Ftp, Service::Http, Service::Ssh, Service::Telnet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Ftp => "ftp",
            Service::Http => "http",
            Service::Ssh => "ssh",
            Service::Telnet => "telnet",
        }
    }

    /// Value of the `honeypot_type` field on the sink side.
    pub fn honeypot_type(&self) -> String {
        format!("{}_honeypot", self.as_str())
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ftp" => Ok(Service::Ftp),
            "http" => Ok(Service::Http),
            "ssh" => Ok(Service::Ssh),
            "telnet" => Ok(Service::Telnet),
            other => Err(format!("Unknown service: {}", other)),
        }
    }
}

/// Ordinal severity on events and alerts
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attack category attached to an event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AttackTag {
    SqlInjection,
    Xss,
    DirectoryTraversal,
    AdminAccess,
    AutomatedScan,
    FileInclusion,
    CommandInjection,
    BruteForce,
    IotBotnet,
    CredentialStuffing,
}

impl AttackTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackTag::SqlInjection => "sql_injection",
            AttackTag::Xss => "xss",
            AttackTag::DirectoryTraversal => "directory_traversal",
            AttackTag::AdminAccess => "admin_access",
            AttackTag::AutomatedScan => "automated_scan",
            AttackTag::FileInclusion => "file_inclusion",
            AttackTag::CommandInjection => "command_injection",
            AttackTag::BruteForce => "brute_force",
            AttackTag::IotBotnet => "iot_botnet",
            AttackTag::CredentialStuffing => "credential_stuffing",
        }
    }
}

impl std::fmt::Display for AttackTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Peer closed the socket
    Closed,
    /// Decoy finished its script (quit, shell loop ended)
    SessionEnded,
    /// Too many failed logins
    AuthFailed,
    Timeout,
    ProtocolViolation,
    TransportError,
    /// Handler task panicked or was cancelled
    HandlerFailed,
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::SessionEnded => "session_ended",
            DisconnectReason::AuthFailed => "auth_failed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ProtocolViolation => "protocol_violation",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::HandlerFailed => "handler_failed",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Request fields captured by the HTTP decoy
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct HttpRequestInfo {
    pub method: String,
    pub request_uri: String,
    pub user_agent: String,
    pub referer: String,
    pub content_type: String,
    pub content_length: u64,
    pub query_string: String,
    pub headers: BTreeMap<String, String>,
}

/// Type-specific part of an [`Event`], tagged by `event_type`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    Connection,
    Disconnect {
        reason: DisconnectReason,
        duration_secs: f64,
    },
    LoginAttempt {
        username: String,
        password: String,
        success: bool,
    },
    LoginSuccess {
        username: String,
    },
    Logout {
        username: String,
    },
    FileUpload {
        filename: String,
        size: u64,
    },
    FileDownload {
        filename: String,
    },
    CommandExecution {
        username: String,
        command: String,
    },
    PubkeyAuth {
        username: String,
        key_type: String,
        key_fingerprint: String,
    },
    HttpRequest(HttpRequestInfo),
}

impl EventKind {
    /// Wire name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::Disconnect { .. } => "disconnect",
            EventKind::LoginAttempt { .. } => "login_attempt",
            EventKind::LoginSuccess { .. } => "login_success",
            EventKind::Logout { .. } => "logout",
            EventKind::FileUpload { .. } => "file_upload",
            EventKind::FileDownload { .. } => "file_download",
            EventKind::CommandExecution { .. } => "command_execution",
            EventKind::PubkeyAuth { .. } => "pubkey_auth",
            EventKind::HttpRequest(_) => "http_request",
        }
    }
}

/// One observable interaction with a decoy.
///
/// Built once by the session that observed it and moved into the sink.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub service: Service,
    pub honeypot_type: String,
    pub version: String,
    pub session_id: String,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attack_types: Vec<AttackTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<ThreatLevel>,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.kind.name()
    }

    pub fn has_tag(&self, tag: AttackTag) -> bool {
        self.attack_types.contains(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EventKind) -> Event {
        Event {
            timestamp: Utc::now(),
            service: Service::Telnet,
            honeypot_type: Service::Telnet.honeypot_type(),
            version: EVENT_SCHEMA_VERSION.to_string(),
            session_id: "10.0.0.1_1700000000".to_string(),
            source_ip: "10.0.0.1".parse().unwrap(),
            source_port: 40000,
            destination_port: 23,
            kind,
            attack_types: vec![AttackTag::IotBotnet],
            threat_level: Some(ThreatLevel::High),
        }
    }

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::High > ThreatLevel::Medium);
        assert!(ThreatLevel::Medium > ThreatLevel::Low);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = sample(EventKind::LoginAttempt {
            username: "admin".into(),
            password: String::new(),
            success: false,
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "login_attempt");
        assert_eq!(json["service"], "telnet");
        assert_eq!(json["honeypot_type"], "telnet_honeypot");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["username"], "admin");
        assert_eq!(json["password"], "");
        assert_eq!(json["attack_types"][0], "iot_botnet");
        assert_eq!(json["threat_level"], "high");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_unit_kind_and_untagged_fields() {
        let mut event = sample(EventKind::Connection);
        event.attack_types.clear();
        event.threat_level = None;
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "connection");
        assert!(json.get("attack_types").is_none());
        assert!(json.get("threat_level").is_none());
    }

    #[test]
    fn test_service_parse() {
        assert_eq!("SSH".parse::<Service>().unwrap(), Service::Ssh);
        assert!("gopher".parse::<Service>().is_err());
    }
}
