// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal telnet client for factory-fresh routers
//!
//! Only what a busybox telnetd needs: option negotiation is answered with
//! refusals (except echo and suppress-go-ahead, which are accepted),
//! subnegotiations are skipped, and command exit codes are recovered with a
//! marker echoed after each command.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, trace};

use super::{shell_quote, ssh::connect_tcp, CommandOutput, RemoteShell};
use crate::config::Transport;
use crate::error::{BurrowError, Result};

const TELNET_PORT: u16 = 23;
const UPLOAD_CHUNK: usize = 48;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const OPT_ECHO: u8 = 1;
const OPT_SUPPRESS_GO_AHEAD: u8 = 3;

/// Anything a telnet session can run over
pub trait Link: Read + Write {}

impl<T: Read + Write> Link for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IacState {
    Data,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// Byte stream with telnet commands removed
pub struct TelnetStream {
    link: Box<dyn Link>,
    state: IacState,
    pending: Vec<u8>,
}

impl TelnetStream {
    /// Connect to port 23
    pub fn connect(ip: Ipv4Addr, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let stream = connect_tcp(ip, TELNET_PORT, connect_timeout)?.ok_or_else(|| {
            BurrowError::Unreachable {
                ip,
                message: "telnet port closed".to_string(),
            }
        })?;
        stream.set_read_timeout(Some(read_timeout))?;
        debug!(ip = %ip, "telnet connected");
        Ok(Self::new(Box::new(stream)))
    }

    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            state: IacState::Data,
            pending: Vec::new(),
        }
    }

    /// Read until one of `needles` appears. Returns the index of the needle
    /// found and the text before it; both are consumed.
    pub fn read_until_any(&mut self, needles: &[&str]) -> Result<(usize, String)> {
        loop {
            let earliest = needles
                .iter()
                .enumerate()
                .filter_map(|(i, n)| find(&self.pending, n.as_bytes()).map(|pos| (pos, i)))
                .min();

            if let Some((pos, index)) = earliest {
                let before = String::from_utf8_lossy(&self.pending[..pos]).to_string();
                self.pending.drain(..pos + needles[index].len());
                return Ok((index, before));
            }

            if !self.fill()? {
                return Err(BurrowError::Session {
                    message: "telnet connection closed".to_string(),
                });
            }
        }
    }

    /// Send one line of input
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(line = %line, "telnet send");
        let mut bytes = Vec::with_capacity(line.len() + 1);
        for b in line.bytes() {
            if b == IAC {
                bytes.push(IAC);
            }
            bytes.push(b);
        }
        bytes.push(b'\n');
        self.link.write_all(&bytes)?;
        self.link.flush()?;
        Ok(())
    }

    /// Read more data; `false` at end of stream
    fn fill(&mut self) -> Result<bool> {
        let mut buf = [0u8; 1024];
        let n = self.link.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        let replies = self.decode(&buf[..n]);
        if !replies.is_empty() {
            self.link.write_all(&replies)?;
            self.link.flush()?;
        }
        Ok(true)
    }

    /// Strip telnet commands from `raw` into `pending`, returning replies
    fn decode(&mut self, raw: &[u8]) -> Vec<u8> {
        let mut replies = Vec::new();
        for &b in raw {
            self.state = match (self.state, b) {
                (IacState::Data, IAC) => IacState::Iac,
                (IacState::Data, _) => {
                    self.pending.push(b);
                    IacState::Data
                }
                (IacState::Iac, IAC) => {
                    self.pending.push(IAC);
                    IacState::Data
                }
                (IacState::Iac, DO | DONT | WILL | WONT) => IacState::Verb(b),
                (IacState::Iac, SB) => IacState::Sub,
                (IacState::Iac, _) => IacState::Data,
                (IacState::Verb(verb), option) => {
                    if let Some(reply) = negotiate(verb, option) {
                        replies.extend_from_slice(&[IAC, reply, option]);
                    }
                    IacState::Data
                }
                (IacState::Sub, IAC) => IacState::SubIac,
                (IacState::Sub, _) => IacState::Sub,
                (IacState::SubIac, SE) => IacState::Data,
                (IacState::SubIac, _) => IacState::Sub,
            };
        }
        replies
    }
}

/// Drop the prompt the shell prints before running the marker line
fn strip_prompt(text: &str) -> &str {
    let start = text.rfind('\n').map_or(0, |pos| pos + 1);
    if text[start..].ends_with("# ") {
        &text[..start]
    } else {
        text
    }
}

fn negotiate(verb: u8, option: u8) -> Option<u8> {
    match verb {
        DO => Some(WONT),
        WILL if option == OPT_ECHO || option == OPT_SUPPRESS_GO_AHEAD => Some(DO),
        WILL => Some(DONT),
        _ => None,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Logged-in telnet shell
pub struct TelnetShell {
    stream: TelnetStream,
    commands: u32,
}

impl TelnetShell {
    pub fn new(stream: TelnetStream) -> Self {
        Self {
            stream,
            commands: 0,
        }
    }
}

impl RemoteShell for TelnetShell {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        self.commands += 1;
        let marker = format!("__bb_exit_{}:", self.commands);
        // Split the marker with quotes so the echoed input never matches.
        let echoed = format!("\"__bb\"\"_exit_{}:$?\"", self.commands);
        // On its own line so a trailing `&` or `#` comment cannot swallow it.
        self.stream
            .send_line(&format!("{}\necho {}", command, echoed))?;

        let (_, before) = self.stream.read_until_any(&[&marker])?;
        let (_, status_text) = self.stream.read_until_any(&["\n"])?;
        let status = status_text
            .trim()
            .parse::<i32>()
            .map_err(|_| BurrowError::Session {
                message: format!("unreadable exit status '{}'", status_text.trim()),
            })?;

        let normalized = before.replace("\r\n", "\n").replace('\r', "");
        // Output starts after the terminal echo of the command line.
        let tail = match normalized.rfind(&echoed) {
            Some(pos) => {
                let rest = &normalized[pos + echoed.len()..];
                rest.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
            }
            None => normalized.as_str(),
        };
        let stdout = strip_prompt(tail).to_string();
        debug!(command = %command, status, "telnet exec");

        Ok(CommandOutput {
            status,
            stdout,
            stderr: String::new(),
        })
    }

    fn upload(&mut self, path: &str, data: &[u8], mode: u32) -> Result<CommandOutput> {
        let target = shell_quote(path);
        let truncate = self.run(&format!(": > {}", target))?;
        if !truncate.success() {
            return Ok(truncate);
        }

        for chunk in data.chunks(UPLOAD_CHUNK) {
            let escaped: String = chunk.iter().map(|b| format!("\\{:03o}", b)).collect();
            let output = self.run(&format!("printf '{}' >> {}", escaped, target))?;
            if !output.success() {
                return Ok(output);
            }
        }

        self.run(&format!("chmod {:o} {}", mode, target))
    }

    fn transport(&self) -> Transport {
        Transport::Telnet
    }

    fn close(&mut self) -> Result<()> {
        self.stream.send_line("exit")
    }
}
