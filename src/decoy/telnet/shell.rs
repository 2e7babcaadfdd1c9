//! Login and fake-shell state machine for the Telnet decoy.
//!
//! The machine never touches a socket. The driver feeds it one edited line at
//! a time and carries out the returned [`Transition`]: write the reply, act on
//! the effect, then continue in the next state.

/// Sent on connect
pub const BANNER: &[u8] = b"Ubuntu 20.04.3 LTS\r\nlogin: ";
pub const PASSWORD_PROMPT: &[u8] = b"Password: ";
pub const LOGIN_INCORRECT: &[u8] = b"\r\nLogin incorrect\r\n";

/// A line with more words than this ends the shell
pub const MAX_COMMAND_WORDS: usize = 10;

const LS_OUTPUT: &str =
    "\r\nbin  boot  dev  etc  home  lib  media  mnt  opt  proc  root  run  sbin  srv  sys  tmp  usr  var\r\n";
const PS_OUTPUT: &str = "\r\n  PID TTY          TIME CMD\r\n 1234 pts/0    00:00:00 bash\r\n";
const UNAME_OUTPUT: &str = "\r\nLinux honeypot 5.4.0-74-generic #83-Ubuntu SMP Sat May 8 02:35:39 UTC 2021 x86_64 x86_64 x86_64 GNU/Linux\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellState {
    AwaitUsername,
    AwaitPassword { username: String },
    PostAuthDelay { username: String },
    ShellLoop { username: String },
    Closed,
}

/// Side effect the driver must perform for a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Credentials were submitted
    Login { username: String, password: String },
    /// A shell line was entered
    Command { username: String, command: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ShellState,
    pub reply: Vec<u8>,
    pub effect: Option<Effect>,
}

impl Transition {
    fn to(next: ShellState) -> Self {
        Self {
            next,
            reply: Vec::new(),
            effect: None,
        }
    }
}

impl ShellState {
    /// Whether input in this state is a secret
    pub fn masked(&self) -> bool {
        matches!(self, ShellState::AwaitPassword { .. })
    }

    /// Whether the driver should read a line in this state
    pub fn reads_input(&self) -> bool {
        matches!(
            self,
            ShellState::AwaitUsername
                | ShellState::AwaitPassword { .. }
                | ShellState::ShellLoop { .. }
        )
    }

    /// Feed one edited line
    pub fn on_line(self, line: String) -> Transition {
        match self {
            ShellState::AwaitUsername => Transition {
                next: ShellState::AwaitPassword { username: line },
                reply: PASSWORD_PROMPT.to_vec(),
                effect: None,
            },
            ShellState::AwaitPassword { username } => Transition {
                next: ShellState::PostAuthDelay {
                    username: username.clone(),
                },
                reply: LOGIN_INCORRECT.to_vec(),
                effect: Some(Effect::Login {
                    username,
                    password: line,
                }),
            },
            ShellState::ShellLoop { username } => {
                if line.is_empty() {
                    return Transition::to(ShellState::Closed);
                }

                let mut reply = command_response(&line).into_bytes();
                let next = if line.split_whitespace().count() > MAX_COMMAND_WORDS {
                    ShellState::Closed
                } else {
                    reply.extend_from_slice(prompt(&username).as_bytes());
                    ShellState::ShellLoop {
                        username: username.clone(),
                    }
                };
                Transition {
                    next,
                    reply,
                    effect: Some(Effect::Command {
                        username,
                        command: line,
                    }),
                }
            }
            other => Transition::to(other),
        }
    }

    /// Leave the post-login pause and present the fake shell
    pub fn on_delay_elapsed(self) -> Transition {
        match self {
            ShellState::PostAuthDelay { username } => Transition {
                reply: prompt(&username).into_bytes(),
                next: ShellState::ShellLoop { username },
                effect: None,
            },
            other => Transition::to(other),
        }
    }
}

pub fn prompt(username: &str) -> String {
    format!("{}@honeypot:~$ ", username)
}

/// Canned output for a shell line, keyed on the lowercased trimmed command
pub fn command_response(command: &str) -> String {
    let cmd = command.trim().to_lowercase();
    match cmd.as_str() {
        "ls" | "dir" => LS_OUTPUT.to_string(),
        "pwd" => "\r\n/home/user\r\n".to_string(),
        "whoami" => "\r\nuser\r\n".to_string(),
        "id" => "\r\nuid=1000(user) gid=1000(user) groups=1000(user)\r\n".to_string(),
        "ps" => PS_OUTPUT.to_string(),
        "uname -a" => UNAME_OUTPUT.to_string(),
        "exit" | "quit" | "logout" => "\r\nlogout\r\n".to_string(),
        c if c.starts_with("cat ") => "\r\ncat: permission denied\r\n".to_string(),
        _ => format!("\r\n{}: command not found\r\n", cmd),
    }
}
