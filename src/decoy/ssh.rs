//! SSH decoy
//!
//! Runs a real SSH transport so clients get as far as authentication. Every
//! password and public key offered is recorded and rejected; no channel is
//! ever opened.

use async_trait::async_trait;
use russh::server::{run_stream, Auth, Config as ServerConfig, Handler, Msg, Session as SshSession};
use russh::{Channel, MethodSet, SshId};
use russh_keys::key::{KeyPair, PublicKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::classify::Classification;
use crate::config::SshConfig;
use crate::decoy::{deny_login, Decoy, Session};
use crate::error::{DecoyError, Result};
use crate::models::{AttackTag, DisconnectReason, EventKind, Service, ThreatLevel};
use crate::tracker::ActivityTracker;

fn allowed_methods() -> MethodSet {
    MethodSet::PASSWORD | MethodSet::PUBLICKEY
}

pub struct SshDecoy {
    server_config: Arc<ServerConfig>,
    idle_secs: u64,
    tracker: Arc<ActivityTracker>,
}

impl SshDecoy {
    /// Build the decoy with a fresh Ed25519 host key
    pub fn new(config: &SshConfig, tracker: Arc<ActivityTracker>) -> Result<Self> {
        let host_key = KeyPair::generate_ed25519().ok_or_else(|| {
            DecoyError::ProtocolViolation("failed to generate SSH host key".into())
        })?;

        let server_config = ServerConfig {
            server_id: SshId::Standard(config.server_id.clone()),
            methods: allowed_methods(),
            auth_rejection_time: Duration::from_millis(config.auth_rejection_delay_ms),
            inactivity_timeout: Some(Duration::from_secs(config.idle_timeout_secs)),
            keys: vec![host_key],
            ..Default::default()
        };

        Ok(Self {
            server_config: Arc::new(server_config),
            idle_secs: config.idle_timeout_secs,
            tracker,
        })
    }
}

#[async_trait]
impl Decoy for SshDecoy {
    fn service(&self) -> Service {
        Service::Ssh
    }

    async fn handle(&self, stream: TcpStream, session: Session) -> Result<DisconnectReason> {
        let handler = SshHandler::new(session, self.tracker.clone());
        let running = run_stream(self.server_config.clone(), stream, handler)
            .await
            .map_err(|e| ssh_error(e, self.idle_secs))?;
        running.await.map_err(|e| ssh_error(e, self.idle_secs))?;
        Ok(DisconnectReason::Closed)
    }
}

fn ssh_error(e: anyhow::Error, idle_secs: u64) -> DecoyError {
    match e.downcast::<std::io::Error>() {
        Ok(io) => DecoyError::Transport(io),
        Err(other) => match other.downcast_ref::<russh::Error>() {
            Some(russh::Error::InactivityTimeout) => DecoyError::Timeout(idle_secs),
            _ => DecoyError::ProtocolViolation(other.to_string()),
        },
    }
}

/// Per-connection russh handler
pub struct SshHandler {
    session: Session,
    tracker: Arc<ActivityTracker>,
}

impl SshHandler {
    pub fn new(session: Session, tracker: Arc<ActivityTracker>) -> Self {
        Self { session, tracker }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(allowed_methods()),
        }
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> std::result::Result<Auth, Self::Error> {
        let classification = Classification::single(AttackTag::BruteForce, ThreatLevel::Medium);
        deny_login(&self.session, &self.tracker, user, password, &classification);
        Ok(Self::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let key_type = public_key.name().to_string();
        let key_fingerprint = public_key.fingerprint();
        info!(
            "SSH public key from {}: {} {} {}",
            self.session.ip(),
            user,
            key_type,
            key_fingerprint
        );
        self.session.emit(EventKind::PubkeyAuth {
            username: user.to_string(),
            key_type,
            key_fingerprint,
        });
        Ok(Self::reject())
    }

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        debug!("SSH none auth from {} as {:?}", self.session.ip(), user);
        Ok(Self::reject())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoy::test_support::{drain, session};

    #[tokio::test]
    async fn test_password_auth_rejected_and_recorded() {
        let (session, mut rx) = session(Service::Ssh);
        let tracker = Arc::new(ActivityTracker::new());
        let mut handler = SshHandler::new(session, tracker.clone());

        for (user, pass) in [("root", "123456"), ("", "")] {
            let auth = handler.auth_password(user, pass).await.unwrap();
            assert!(matches!(auth, Auth::Reject { .. }));
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type() == "login_attempt"));
        assert!(events[0].has_tag(AttackTag::BruteForce));
        assert_eq!(tracker.credentials().username_count(""), 1);
    }

    #[tokio::test]
    async fn test_pubkey_auth_rejected_and_recorded() {
        let (session, mut rx) = session(Service::Ssh);
        let mut handler = SshHandler::new(session, Arc::new(ActivityTracker::new()));
        let key = KeyPair::generate_ed25519().unwrap();
        let public = key.clone_public_key().unwrap();

        let auth = handler.auth_publickey("deploy", &public).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::PubkeyAuth {
                username,
                key_type,
                key_fingerprint,
            } => {
                assert_eq!(username, "deploy");
                assert_eq!(key_type, "ssh-ed25519");
                assert!(!key_fingerprint.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decoy_builds_host_key() {
        let decoy = SshDecoy::new(&SshConfig::default(), Arc::new(ActivityTracker::new())).unwrap();
        assert_eq!(decoy.server_config.keys.len(), 1);
        assert_eq!(decoy.service(), Service::Ssh);
    }
}
