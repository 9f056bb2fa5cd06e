// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH transport over libssh2

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ssh2::{HashType, Session};
use tracing::{debug, info};

use super::{telnet::TelnetStream, upload_command, CommandOutput, Connector, RemoteShell};
use crate::config::{Router, Settings, Transport};
use crate::credentials;
use crate::error::{BurrowError, Result};

const SSH_PORT: u16 = 22;
const USER: &str = "root";

/// A shell on an authenticated SSH session
pub struct SshShell {
    session: Session,
    transport: Transport,
    host_key: String,
}

impl RemoteShell for SshShell {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        debug!(command = %command, "ssh exec");
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let stdout = read_lossy(&mut channel)?;
        let stderr = read_lossy(channel.stderr())?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn upload(&mut self, path: &str, data: &[u8], mode: u32) -> Result<CommandOutput> {
        let command = upload_command(path, mode);
        debug!(path = %path, bytes = data.len(), "ssh upload");
        let mut channel = self.session.channel_session()?;
        channel.exec(&command)?;
        channel.write_all(data)?;
        channel.send_eof()?;

        let stdout = read_lossy(&mut channel)?;
        let stderr = read_lossy(channel.stderr())?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn host_key(&self) -> Option<&str> {
        Some(&self.host_key)
    }

    fn close(&mut self) -> Result<()> {
        self.session.disconnect(None, "bitburrow done", None)?;
        Ok(())
    }
}

/// Opens real SSH and telnet connections
pub struct SystemConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SystemConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
        }
    }

    /// TCP connect and SSH handshake. `None` if the port refuses connections.
    fn handshake(&self, ip: Ipv4Addr) -> Result<Option<Session>> {
        let Some(tcp) = connect_tcp(ip, SSH_PORT, self.connect_timeout)? else {
            return Ok(None);
        };
        let mut session = Session::new()?;
        session.set_timeout(self.command_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        Ok(Some(session))
    }
}

impl Connector for SystemConnector {
    fn ssh_with_key(&self, router: &Router) -> Result<Option<Box<dyn RemoteShell>>> {
        let Some(session) = self.handshake(router.ip)? else {
            debug!(ip = %router.ip, "SSH port closed");
            return Ok(None);
        };
        let host_key = pin_host_key(&session, router.ip, router.host_key.as_deref())?;

        let public = credentials::authorized_keys_line(&router.ssh_public_key);
        if let Err(e) =
            session.userauth_pubkey_memory(USER, Some(&public), &router.ssh_private_key, None)
        {
            debug!(ip = %router.ip, error = %e, "Key authentication refused");
            return Ok(None);
        }
        if !session.authenticated() {
            return Ok(None);
        }

        info!(ip = %router.ip, "SSH session open (key)");
        Ok(Some(Box::new(SshShell {
            session,
            transport: Transport::Ssh,
            host_key,
        })))
    }

    fn ssh_noauth(
        &self,
        ip: Ipv4Addr,
        pinned_host_key: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteShell>>> {
        let Some(session) = self.handshake(ip)? else {
            return Ok(None);
        };
        let host_key = pin_host_key(&session, ip, pinned_host_key)?;

        // Asking for the method list attempts "none" authentication.
        match session.auth_methods(USER) {
            Ok(methods) => debug!(ip = %ip, methods = %methods, "SSH auth methods"),
            Err(e) => debug!(ip = %ip, error = %e, "SSH auth method query failed"),
        }
        if !session.authenticated() {
            return Ok(None);
        }

        info!(ip = %ip, "SSH session open (no authentication)");
        Ok(Some(Box::new(SshShell {
            session,
            transport: Transport::SshNoAuth,
            host_key,
        })))
    }

    fn telnet(&self, ip: Ipv4Addr) -> Result<TelnetStream> {
        TelnetStream::connect(ip, self.connect_timeout, self.command_timeout)
    }
}

/// Fingerprint of the host key presented on port 22, if SSH is open
pub fn probe_host_key(ip: Ipv4Addr, timeout: Duration) -> Result<Option<String>> {
    let Some(tcp) = connect_tcp(ip, SSH_PORT, timeout)? else {
        return Ok(None);
    };
    let mut session = Session::new()?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake()?;
    let fingerprint = fingerprint(&session);
    // The probe never authenticates.
    let _ = session.disconnect(None, "probe", None);
    Ok(fingerprint)
}

/// OpenSSH-style `SHA256:` fingerprint of the session's host key
pub fn fingerprint(session: &Session) -> Option<String> {
    session
        .host_key_hash(HashType::Sha256)
        .map(|hash| format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)))
}

fn pin_host_key(session: &Session, ip: Ipv4Addr, pinned: Option<&str>) -> Result<String> {
    let actual = fingerprint(session).ok_or_else(|| BurrowError::Session {
        message: format!("{} presented no host key", ip),
    })?;
    match pinned {
        Some(expected) if expected != actual => Err(BurrowError::HostKeyMismatch {
            ip,
            expected: expected.to_string(),
            actual,
        }),
        _ => Ok(actual),
    }
}

/// Drain `reader`; router output is not always UTF-8
fn read_lossy<R: Read>(mut reader: R) -> Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// TCP connect with a timeout; `None` when the port actively refuses
pub(crate) fn connect_tcp(ip: Ipv4Addr, port: u16, timeout: Duration) -> Result<Option<TcpStream>> {
    let addr = SocketAddr::from((ip, port));
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => Ok(Some(stream)),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(None),
        Err(e) => Err(BurrowError::Unreachable {
            ip,
            message: format!("port {}: {}", port, e),
        }),
    }
}
