//! Decoy protocol handlers
//!
//! Every decoy follows the same contract:
//! 1. the listener emits `connection` before the handler runs
//! 2. the handler performs just enough handshake to solicit credentials
//! 3. every credential check goes through [`deny_login`], which records the
//!    attempt verbatim and returns [`AuthDecision::Deny`]
//! 4. the listener emits exactly one `disconnect` once the handler returns,
//!    fails, panics or is cancelled

pub mod ftp;
pub mod http;
pub mod ssh;
pub mod telnet;

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::classify::Classification;
use crate::error::{DecoyError, Result};
use crate::models::{DisconnectReason, Event, EventKind, Service, ThreatLevel, EVENT_SCHEMA_VERSION};
use crate::sink::Emitter;
use crate::tracker::ActivityTracker;

/// Result of a credential check. Decoys never grant access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Deny,
}

/// A protocol handler driven by the listener, one call per connection
#[async_trait]
pub trait Decoy: Send + Sync + 'static {
    fn service(&self) -> Service;

    /// Run one session to completion and report why it ended.
    async fn handle(&self, stream: TcpStream, session: Session) -> Result<DisconnectReason>;
}

/// Per-connection context: identity of the peer plus the service's emitter
#[derive(Clone)]
pub struct Session {
    id: String,
    peer: SocketAddr,
    local_port: u16,
    started: Instant,
    emitter: Emitter,
}

impl Session {
    pub fn new(peer: SocketAddr, local_port: u16, emitter: Emitter) -> Self {
        Self {
            id: format!("{}_{}", peer.ip(), Utc::now().timestamp()),
            peer,
            local_port,
            started: Instant::now(),
            emitter,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn service(&self) -> Service {
        self.emitter.service()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build an event stamped with this session's identity
    pub fn event(&self, kind: EventKind) -> Event {
        let service = self.service();
        Event {
            timestamp: Utc::now(),
            service,
            honeypot_type: service.honeypot_type(),
            version: EVENT_SCHEMA_VERSION.to_string(),
            session_id: self.id.clone(),
            source_ip: self.peer.ip(),
            source_port: self.peer.port(),
            destination_port: self.local_port,
            kind,
            attack_types: Vec::new(),
            threat_level: None,
        }
    }

    pub fn emit(&self, kind: EventKind) {
        self.emitter.emit(self.event(kind));
    }

    pub fn emit_classified(&self, kind: EventKind, classification: &Classification) {
        let mut event = self.event(kind);
        event.attack_types = classification.tags.clone();
        event.threat_level = Some(classification.level);
        self.emitter.emit(event);
    }

    /// Emit the closing event for this session
    pub fn emit_disconnect(&self, reason: DisconnectReason) {
        self.emit(EventKind::Disconnect {
            reason,
            duration_secs: self.elapsed().as_secs_f64(),
        });
    }
}

/// Record a credential pair and refuse it.
///
/// This is the only place a decoy answers authentication, so every attempt
/// produces exactly one `login_attempt` event, empty strings included.
pub fn deny_login(
    session: &Session,
    tracker: &ActivityTracker,
    username: &str,
    password: &str,
    classification: &Classification,
) -> AuthDecision {
    tracker.record_login(username, password);
    tracker.record_tags(&classification.tags);

    if classification.level >= ThreatLevel::High {
        warn!(
            "{} login attempt from {}: {:?}:{:?} ({})",
            session.service(),
            session.ip(),
            username,
            password,
            tags_label(classification)
        );
    } else {
        info!(
            "{} login attempt from {}: {:?}:{:?}",
            session.service(),
            session.ip(),
            username,
            password
        );
    }

    session.emit_classified(
        EventKind::LoginAttempt {
            username: username.to_string(),
            password: password.to_string(),
            success: false,
        },
        classification,
    );

    AuthDecision::Deny
}

pub(crate) fn tags_label(classification: &Classification) -> String {
    classification
        .tags
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Await an I/O future, failing with [`DecoyError::Timeout`] if it idles.
pub async fn idle<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DecoyError::Timeout(limit.as_secs())),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::classify::classify_credentials;
    use crate::models::AttackTag;

    #[test]
    fn test_deny_login_emits_one_event() {
        let tracker = ActivityTracker::new();
        for (user, pass) in [("", ""), ("admin", "admin"), ("bob", "s3cret!"), ("", "x")] {
            let (session, mut rx) = session(Service::Telnet);
            let decision = deny_login(
                &session,
                &tracker,
                user,
                pass,
                &classify_credentials(user, pass),
            );
            assert_eq!(decision, AuthDecision::Deny);

            let events = drain(&mut rx);
            assert_eq!(events.len(), 1);
            match &events[0].kind {
                EventKind::LoginAttempt {
                    username,
                    password,
                    success,
                } => {
                    assert_eq!(username, user);
                    assert_eq!(password, pass);
                    assert!(!success);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(tracker.snapshot(1).login_attempts, 4);
    }

    #[test]
    fn test_session_stamps_identity() {
        let (session, mut rx) = session(Service::Ftp);
        session.emit(EventKind::Connection);
        session.emit_disconnect(DisconnectReason::Closed);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.service, Service::Ftp);
            assert_eq!(event.session_id, session.id());
            assert_eq!(event.source_port, 40123);
            assert_eq!(event.destination_port, 21);
        }
        assert_eq!(events[1].event_type(), "disconnect");
        assert!(session.id().starts_with("203.0.113.5_"));
    }

    #[test]
    fn test_classified_event_carries_tags() {
        let (session, mut rx) = session(Service::Telnet);
        session.emit_classified(
            EventKind::Connection,
            &Classification::single(AttackTag::IotBotnet, ThreatLevel::High),
        );
        let event = drain(&mut rx).remove(0);
        assert!(event.has_tag(AttackTag::IotBotnet));
        assert_eq!(event.threat_level, Some(ThreatLevel::High));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let result: Result<()> = idle(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DecoyError::Timeout(_))));
    }
}
