//! FTP decoy
//!
//! Speaks just enough of the control channel to collect `USER`/`PASS` pairs.
//! Every data command is refused as unauthenticated, so the passive range is
//! never opened.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::classify::Classification;
use crate::config::FtpConfig;
use crate::decoy::{deny_login, idle, Decoy, Session};
use crate::error::{DecoyError, Result};
use crate::models::{AttackTag, DisconnectReason, Service, ThreatLevel};
use crate::tracker::ActivityTracker;

const MAX_COMMAND_LEN: usize = 2048;

const NOT_LOGGED_IN: &str = "530 Please login with USER and PASS.";

/// Commands that need a logged-in user
const AUTHENTICATED_COMMANDS: &[&str] = &[
    "ABOR", "ACCT", "APPE", "CDUP", "CWD", "DELE", "EPRT", "EPSV", "HELP", "LIST", "MDTM", "MKD",
    "MLSD", "MLST", "MODE", "NLST", "OPTS", "PASV", "PORT", "PWD", "REST", "RETR", "RMD", "RNFR",
    "RNTO", "SITE", "SIZE", "STAT", "STOR", "STOU", "STRU", "TYPE", "XCWD", "XMKD", "XPWD", "XRMD",
    "AUTH", "PBSZ", "PROT",
];

/// What the driver must do after one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub lines: Vec<String>,
    pub login: Option<(String, String)>,
    pub close: Option<DisconnectReason>,
}

impl FtpReply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            login: None,
            close: None,
        }
    }

    fn closing(mut self, reason: DisconnectReason) -> Self {
        self.close = Some(reason);
        self
    }
}

/// Control-channel state for one FTP session
#[derive(Debug)]
pub struct FtpSession {
    pending_user: Option<String>,
    failed_logins: u32,
    max_login_attempts: u32,
}

impl FtpSession {
    pub fn new(max_login_attempts: u32) -> Self {
        Self {
            pending_user: None,
            failed_logins: 0,
            max_login_attempts: max_login_attempts.max(1),
        }
    }

    /// Handle one raw command line (terminator already stripped)
    pub fn on_command(&mut self, line: &str) -> FtpReply {
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "USER" => {
                self.pending_user = Some(arg.to_string());
                FtpReply::line("331 Please specify the password.")
            }
            "PASS" => match self.pending_user.take() {
                Some(user) => {
                    self.failed_logins += 1;
                    let mut reply = FtpReply::line("530 Login incorrect.");
                    reply.login = Some((user, arg.to_string()));
                    if self.failed_logins >= self.max_login_attempts {
                        reply
                            .lines
                            .push("421 Too many failed logins, closing control connection.".into());
                        reply = reply.closing(DisconnectReason::AuthFailed);
                    }
                    reply
                }
                None => FtpReply::line("503 Login with USER first."),
            },
            "SYST" => FtpReply::line("215 UNIX Type: L8"),
            "FEAT" => FtpReply {
                lines: vec![
                    "211-Features:".into(),
                    " EPRT".into(),
                    " EPSV".into(),
                    " MDTM".into(),
                    " PASV".into(),
                    " REST STREAM".into(),
                    " SIZE".into(),
                    " TVFS".into(),
                    " UTF8".into(),
                    "211 End".into(),
                ],
                login: None,
                close: None,
            },
            "NOOP" => FtpReply::line("200 NOOP ok."),
            "QUIT" => FtpReply::line("221 Goodbye.").closing(DisconnectReason::SessionEnded),
            v if AUTHENTICATED_COMMANDS.contains(&v) => FtpReply::line(NOT_LOGGED_IN),
            _ => FtpReply::line("500 Unknown command."),
        }
    }
}

pub struct FtpDecoy {
    config: FtpConfig,
    tracker: Arc<ActivityTracker>,
}

impl FtpDecoy {
    pub fn new(config: FtpConfig, tracker: Arc<ActivityTracker>) -> Self {
        Self { config, tracker }
    }
}

#[async_trait]
impl Decoy for FtpDecoy {
    fn service(&self) -> Service {
        Service::Ftp
    }

    async fn handle(&self, stream: TcpStream, session: Session) -> Result<DisconnectReason> {
        run_session(stream, &session, &self.tracker, &self.config).await
    }
}

/// Serve one control connection over any byte stream
pub async fn run_session<S>(
    stream: S,
    session: &Session,
    tracker: &ActivityTracker,
    config: &FtpConfig,
) -> Result<DisconnectReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let mut stream = BufReader::new(stream);
    let mut state = FtpSession::new(config.max_login_attempts);

    send(&mut stream, &[format!("220 {}", config.banner)], idle_timeout).await?;

    loop {
        let line = match read_command(&mut stream, idle_timeout).await? {
            Some(line) => line,
            None => return Ok(DisconnectReason::Closed),
        };
        debug!("FTP command from {}: {:?}", session.ip(), line);

        let reply = state.on_command(&line);
        if let Some((username, password)) = &reply.login {
            let classification = Classification::single(AttackTag::BruteForce, ThreatLevel::Medium);
            deny_login(session, tracker, username, password, &classification);
        }
        send(&mut stream, &reply.lines, idle_timeout).await?;

        if let Some(reason) = reply.close {
            return Ok(reason);
        }
    }
}

async fn read_command<R>(reader: &mut R, idle_timeout: Duration) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (MAX_COMMAND_LEN + 1) as u64;
    let n = idle(idle_timeout, (&mut *reader).take(limit).read_until(b'\n', &mut buf)).await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") && buf.len() > MAX_COMMAND_LEN {
        return Err(DecoyError::ProtocolViolation(format!(
            "command exceeds {} bytes",
            MAX_COMMAND_LEN
        )));
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
}

async fn send<W>(writer: &mut W, lines: &[String], idle_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    idle(idle_timeout, writer.write_all(out.as_bytes())).await?;
    idle(idle_timeout, writer.flush()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoy::test_support::{drain, session};
    use crate::models::EventKind;

    #[test]
    fn test_pass_without_user() {
        let mut ftp = FtpSession::new(3);
        let reply = ftp.on_command("PASS secret");
        assert_eq!(reply.lines, vec!["503 Login with USER first."]);
        assert!(reply.login.is_none());
    }

    #[test]
    fn test_login_always_denied() {
        let mut ftp = FtpSession::new(3);
        assert!(ftp.on_command("user anonymous").lines[0].starts_with("331"));
        let reply = ftp.on_command("PASS guest@example.com");
        assert_eq!(reply.lines, vec!["530 Login incorrect."]);
        assert_eq!(
            reply.login,
            Some(("anonymous".to_string(), "guest@example.com".to_string()))
        );
        assert!(reply.close.is_none());

        // USER is consumed by PASS
        assert!(ftp.on_command("PASS again").lines[0].starts_with("503"));
    }

    #[test]
    fn test_empty_credentials_and_spaces_kept() {
        let mut ftp = FtpSession::new(3);
        ftp.on_command("USER");
        let reply = ftp.on_command("PASS");
        assert_eq!(reply.login, Some((String::new(), String::new())));

        ftp.on_command("USER admin");
        let reply = ftp.on_command("PASS pass word ");
        assert_eq!(reply.login, Some(("admin".into(), "pass word ".into())));
    }

    #[test]
    fn test_attempt_limit_closes() {
        let mut ftp = FtpSession::new(2);
        ftp.on_command("USER a");
        assert!(ftp.on_command("PASS 1").close.is_none());
        ftp.on_command("USER a");
        let reply = ftp.on_command("PASS 2");
        assert_eq!(reply.close, Some(DisconnectReason::AuthFailed));
        assert!(reply.lines[1].starts_with("421"));
    }

    #[test]
    fn test_misc_commands() {
        let mut ftp = FtpSession::new(3);
        assert_eq!(ftp.on_command("SYST").lines, vec!["215 UNIX Type: L8"]);
        assert_eq!(ftp.on_command("pasv").lines, vec![NOT_LOGGED_IN]);
        assert_eq!(ftp.on_command("RETR /etc/passwd").lines, vec![NOT_LOGGED_IN]);
        assert_eq!(ftp.on_command("XYZZY").lines, vec!["500 Unknown command."]);
        assert_eq!(ftp.on_command("").lines, vec!["500 Unknown command."]);
        assert_eq!(ftp.on_command("FEAT").lines.last().unwrap(), "211 End");
        assert_eq!(
            ftp.on_command("QUIT").close,
            Some(DisconnectReason::SessionEnded)
        );
    }

    #[tokio::test]
    async fn test_session_over_stream() {
        let (session, mut rx) = session(Service::Ftp);
        let tracker = ActivityTracker::new();
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let config = FtpConfig::default();

        client
            .write_all(b"USER root\r\nPASS toor\r\nLIST\r\nQUIT\r\n")
            .await
            .unwrap();
        let reason = run_session(server, &session, &tracker, &config).await.unwrap();
        assert_eq!(reason, DisconnectReason::SessionEnded);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert_eq!(
            output,
            "220 (vsFTPd 3.0.3)\r\n331 Please specify the password.\r\n530 Login incorrect.\r\n530 Please login with USER and PASS.\r\n221 Goodbye.\r\n"
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].has_tag(AttackTag::BruteForce));
        assert!(matches!(
            &events[0].kind,
            EventKind::LoginAttempt { username, password, .. } if username == "root" && password == "toor"
        ));
    }

    #[tokio::test]
    async fn test_overlong_command() {
        let (session, _rx) = session(Service::Ftp);
        let tracker = ActivityTracker::new();
        let (mut client, server) = tokio::io::duplex(16 * 1024);

        client.write_all(&vec![b'A'; 4096]).await.unwrap();
        let result = run_session(server, &session, &tracker, &FtpConfig::default()).await;
        assert!(matches!(result, Err(DecoyError::ProtocolViolation(_))));
    }
}
