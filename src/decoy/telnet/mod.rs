//! Telnet decoy: fake login followed by a canned shell.

pub mod editor;
pub mod shell;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::classify::{classify_credentials, Classification};
use crate::config::TelnetConfig;
use crate::decoy::{deny_login, idle, Decoy, Session};
use crate::error::Result;
use crate::models::{AttackTag, DisconnectReason, EventKind, Service, ThreatLevel};
use crate::tracker::ActivityTracker;

use editor::LineEditor;
use shell::{Effect, ShellState, BANNER};

/// Timing knobs for one Telnet session
#[derive(Debug, Clone, Copy)]
pub struct TelnetSettings {
    pub idle_timeout: Duration,
    pub login_delay: Duration,
    pub max_line_len: usize,
}

impl From<&TelnetConfig> for TelnetSettings {
    fn from(config: &TelnetConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            login_delay: Duration::from_secs(config.login_delay_secs),
            max_line_len: config.max_line_len,
        }
    }
}

pub struct TelnetDecoy {
    settings: TelnetSettings,
    tracker: Arc<ActivityTracker>,
}

impl TelnetDecoy {
    pub fn new(config: &TelnetConfig, tracker: Arc<ActivityTracker>) -> Self {
        Self {
            settings: TelnetSettings::from(config),
            tracker,
        }
    }
}

#[async_trait]
impl Decoy for TelnetDecoy {
    fn service(&self) -> Service {
        Service::Telnet
    }

    async fn handle(&self, mut stream: TcpStream, session: Session) -> Result<DisconnectReason> {
        run_session(&mut stream, &session, &self.tracker, self.settings).await
    }
}

/// Drive the login/shell machine over any byte stream
pub async fn run_session<S>(
    stream: &mut S,
    session: &Session,
    tracker: &ActivityTracker,
    settings: TelnetSettings,
) -> Result<DisconnectReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut editor = LineEditor::new(settings.max_line_len);
    let mut state = ShellState::AwaitUsername;

    idle(settings.idle_timeout, stream.write_all(BANNER)).await?;

    loop {
        let transition = match state {
            ShellState::Closed => return Ok(DisconnectReason::SessionEnded),
            ShellState::PostAuthDelay { .. } => {
                tokio::time::sleep(settings.login_delay).await;
                state.on_delay_elapsed()
            }
            _ => {
                editor.set_masked(state.masked());
                let line = match read_line(stream, &mut editor, settings.idle_timeout).await? {
                    Some(line) => line,
                    None => return Ok(DisconnectReason::Closed),
                };
                state.on_line(line)
            }
        };

        match transition.effect {
            Some(Effect::Login { username, password }) => {
                let classification = classify_credentials(&username, &password);
                deny_login(session, tracker, &username, &password, &classification);
            }
            Some(Effect::Command { username, command }) => {
                info!("Telnet command from {}: {:?}", session.ip(), command);
                tracker.record_command(&command);
                let classification =
                    Classification::single(AttackTag::CommandInjection, ThreatLevel::High);
                tracker.record_tags(&classification.tags);
                session.emit_classified(
                    EventKind::CommandExecution { username, command },
                    &classification,
                );
            }
            None => {}
        }

        if !transition.reply.is_empty() {
            idle(settings.idle_timeout, stream.write_all(&transition.reply)).await?;
        }
        state = transition.next;
    }
}

/// Read until the editor yields a line. `None` means the peer hung up.
async fn read_line<S>(
    stream: &mut S,
    editor: &mut LineEditor,
    idle_timeout: Duration,
) -> Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        let mut echo = Vec::new();
        let line = editor.next_line(&mut echo)?;
        if !echo.is_empty() {
            idle(idle_timeout, stream.write_all(&echo)).await?;
        }
        if line.is_some() {
            return Ok(line);
        }

        let n = idle(idle_timeout, stream.read(&mut buf)).await?;
        if n == 0 {
            debug!("Telnet peer closed with {} bytes unterminated", editor.buffered());
            return Ok(None);
        }
        editor.push(&buf[..n]);
    }
}
