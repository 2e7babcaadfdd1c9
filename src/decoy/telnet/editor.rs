//! Byte-at-a-time line editor for raw Telnet input.
//!
//! Input is pushed in whatever chunks the socket delivers; [`LineEditor::next_line`]
//! consumes it until one line is complete and appends the bytes the server
//! should echo back.

use std::collections::VecDeque;

use crate::error::{DecoyError, Result};

const IAC: u8 = 255;
const DONT: u8 = 254;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const BS: u8 = 0x08;
const DEL: u8 = 0x7f;
const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Erase sequence echoed for a backspace in plain mode
pub const ERASE: &[u8] = b"\x08 \x08";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parse {
    Data,
    /// Just saw CR; a following LF or NUL belongs to the same terminator
    AfterCr,
    /// Just saw IAC
    Command,
    /// IAC WILL/WONT/DO/DONT, option byte pending
    Option,
    /// Inside IAC SB ... IAC SE
    Subnegotiation,
    SubnegotiationIac,
}

pub struct LineEditor {
    pending: VecDeque<u8>,
    line: Vec<u8>,
    masked: bool,
    state: Parse,
    max_len: usize,
}

impl LineEditor {
    pub fn new(max_len: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            line: Vec::new(),
            masked: false,
            state: Parse::Data,
            max_len,
        }
    }

    /// Password mode: accepted bytes echo as `*`, deletions echo nothing.
    pub fn set_masked(&mut self, masked: bool) {
        self.masked = masked;
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    /// Bytes received but not yet turned into a line
    pub fn buffered(&self) -> usize {
        self.line.len()
    }

    /// Consume pending input until a line terminator.
    ///
    /// Returns `Ok(None)` when the pending input runs out first. The returned
    /// line is decoded lossily and trimmed.
    pub fn next_line(&mut self, echo: &mut Vec<u8>) -> Result<Option<String>> {
        while let Some(b) = self.pending.pop_front() {
            match self.state {
                Parse::AfterCr => {
                    self.state = Parse::Data;
                    if b == LF || b == NUL {
                        continue;
                    }
                    if let Some(line) = self.data_byte(b, echo)? {
                        return Ok(Some(line));
                    }
                }
                Parse::Data => {
                    if let Some(line) = self.data_byte(b, echo)? {
                        return Ok(Some(line));
                    }
                }
                Parse::Command => {
                    self.state = match b {
                        IAC => {
                            self.accept(IAC, echo)?;
                            Parse::Data
                        }
                        WILL..=DONT => Parse::Option,
                        SB => Parse::Subnegotiation,
                        _ => Parse::Data,
                    };
                }
                Parse::Option => self.state = Parse::Data,
                Parse::Subnegotiation => {
                    if b == IAC {
                        self.state = Parse::SubnegotiationIac;
                    }
                }
                Parse::SubnegotiationIac => {
                    self.state = if b == SE {
                        Parse::Data
                    } else {
                        Parse::Subnegotiation
                    };
                }
            }
        }
        Ok(None)
    }

    fn data_byte(&mut self, b: u8, echo: &mut Vec<u8>) -> Result<Option<String>> {
        match b {
            IAC => self.state = Parse::Command,
            CR => {
                self.state = Parse::AfterCr;
                return Ok(Some(self.take_line()));
            }
            LF => return Ok(Some(self.take_line())),
            BS | DEL => {
                if self.line.pop().is_some() && !self.masked {
                    echo.extend_from_slice(ERASE);
                }
            }
            NUL => {}
            _ => self.accept(b, echo)?,
        }
        Ok(None)
    }

    fn accept(&mut self, b: u8, echo: &mut Vec<u8>) -> Result<()> {
        if self.line.len() >= self.max_len {
            return Err(DecoyError::ProtocolViolation(format!(
                "line exceeds {} bytes",
                self.max_len
            )));
        }
        self.line.push(b);
        echo.push(if self.masked { b'*' } else { b });
        Ok(())
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.line);
        String::from_utf8_lossy(&raw).trim().to_string()
    }
}
