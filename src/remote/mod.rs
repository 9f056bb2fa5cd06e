// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote shell sessions on routers
//!
//! A [`RemoteShell`] runs one command at a time and reports its exit status.
//! [`Connector`] opens shells over the three transports a router may offer:
//! SSH with the managed key, SSH with no authentication (factory state), and
//! telnet (factory state, older firmware).

pub mod ssh;
pub mod telnet;

use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::config::{Router, Transport};
use crate::error::{RemoteCommandError, Result};

/// Output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into a [`RemoteCommandError`]
    pub fn into_checked(self, command: &str) -> std::result::Result<Self, RemoteCommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteCommandError {
                command: command.to_string(),
                status: self.status,
                stderr: if self.stderr.is_empty() {
                    self.stdout
                } else {
                    self.stderr
                },
            })
        }
    }
}

/// An open shell on a router
pub trait RemoteShell {
    /// Run one command and wait for it to exit.
    ///
    /// `Err` means the session itself failed; a command that ran and exited
    /// non-zero is reported through [`CommandOutput::status`].
    fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Write `data` to `path` on the router and set its mode
    fn upload(&mut self, path: &str, data: &[u8], mode: u32) -> Result<CommandOutput>;

    /// Transport this shell runs over
    fn transport(&self) -> Transport;

    /// SSH host key fingerprint of the peer, if known
    fn host_key(&self) -> Option<&str> {
        None
    }

    /// End the session
    fn close(&mut self) -> Result<()>;
}

/// Opens shells on routers
pub trait Connector {
    /// SSH as root with the router's stored key. `None` if the key is refused.
    fn ssh_with_key(&self, router: &Router) -> Result<Option<Box<dyn RemoteShell>>>;

    /// SSH as root with no authentication. `None` if SSH is closed or asks
    /// for credentials.
    fn ssh_noauth(
        &self,
        ip: Ipv4Addr,
        pinned_host_key: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteShell>>>;

    /// Raw telnet connection, before login
    fn telnet(&self, ip: Ipv4Addr) -> Result<telnet::TelnetStream>;
}

/// Owns a shell and closes it when dropped
pub struct SessionGuard {
    shell: Box<dyn RemoteShell>,
    closed: bool,
}

impl SessionGuard {
    pub fn new(shell: Box<dyn RemoteShell>) -> Self {
        Self {
            shell,
            closed: false,
        }
    }

    pub fn shell(&mut self) -> &mut dyn RemoteShell {
        self.shell.as_mut()
    }

    pub fn transport(&self) -> Transport {
        self.shell.transport()
    }

    pub fn host_key(&self) -> Option<&str> {
        self.shell.host_key()
    }

    /// Close now and report errors
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.shell.close()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!(transport = %self.shell.transport(), "Closing session");
        if let Err(e) = self.shell.close() {
            warn!(error = %e, "Failed to close session");
        }
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell command that stores stdin at `path` with `mode`
pub fn upload_command(path: &str, mode: u32) -> String {
    let quoted = shell_quote(path);
    format!("cat > {0} && chmod {1:o} {0}", quoted, mode)
}
