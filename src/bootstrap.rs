// SPDX-License-Identifier: AGPL-3.0-or-later
//! First-contact authentication for factory-fresh routers
//!
//! A router in factory state has no credentials we know of. It either accepts
//! SSH as root with no authentication, or offers a telnet root shell. Over
//! whichever works, phase 2 sets the root password and installs the managed
//! public key, after which every later session uses key authentication.

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::config::{Router, Transport};
use crate::coterie::parser::command_lines;
use crate::coterie::substitute::substitute;
use crate::coterie::Coterie;
use crate::error::{BurrowError, RemoteCommandError, Result};
use crate::remote::telnet::{TelnetShell, TelnetStream};
use crate::remote::{Connector, RemoteShell, SessionGuard};

/// Label used for placeholder errors in the fixed sequence
const BOOTSTRAP_LABEL: &str = "bootstrap";

/// Fixed phase-2 sequence. A leading `-` marks a step whose failure is
/// logged and ignored.
pub const BOOTSTRAP_SEQUENCE: &str = r#"sed -i 's|^root:.*$|{root_shadow_line}|' /etc/shadow
mkdir -p /etc/dropbear
touch /etc/dropbear/authorized_keys
grep -qxF '{authorized_keys_line}' /etc/dropbear/authorized_keys || echo '{authorized_keys_line}' >> /etc/dropbear/authorized_keys
chmod 600 /etc/dropbear/authorized_keys
-/etc/init.d/dropbear enable
-/etc/init.d/dropbear start
"#;

/// Extra steps run first at high verbosity
const DIAGNOSTIC_SEQUENCE: &str = "-uname -a\n-cat /etc/openwrt_release\n";

/// Prompts recognized during telnet login, in [`LoginState`] order
const LOGIN_PROMPTS: [&str; 3] = ["login:", "Password:", "# "];

/// One phase-2 command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Step {
    pub command: String,
    pub optional: bool,
}

/// Where the telnet login exchange currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoginPrompt,
    PasswordPrompt,
    ShellPrompt,
}

impl LoginState {
    fn from_prompt(index: usize) -> Self {
        match index {
            0 => LoginState::LoginPrompt,
            1 => LoginState::PasswordPrompt,
            _ => LoginState::ShellPrompt,
        }
    }
}

/// Bootstrap progress
enum BootstrapState {
    Start,
    TrySshNoAuth,
    SshSuccess(SessionGuard),
    TelnetFallback,
    RunPhase2(SessionGuard),
    Done(Transport),
}

/// Parse phase-2 text into steps, substituting placeholders
pub fn parse_steps(label: &str, text: &str, router: &Router) -> Result<Vec<Phase2Step>> {
    command_lines(text)
        .into_iter()
        .map(|line| {
            let (optional, command) = match line.strip_prefix('-') {
                Some(rest) => (true, rest.trim()),
                None => (false, line.as_str()),
            };
            Ok(Phase2Step {
                command: substitute(label, command, router)?,
                optional,
            })
        })
        .collect()
}

/// Run steps in order. The outer error is a session failure; the inner one
/// is the first required step that exited non-zero. On success returns the
/// number of commands sent.
pub fn run_phase2(
    shell: &mut dyn RemoteShell,
    steps: &[Phase2Step],
) -> Result<std::result::Result<usize, RemoteCommandError>> {
    let mut sent = 0usize;
    for step in steps {
        let output = shell.run(&step.command)?;
        sent += 1;
        if !output.stdout.trim().is_empty() {
            debug!(output = %output.stdout.trim_end(), "phase 2 output");
        }
        match output.into_checked(&step.command) {
            Ok(_) => {}
            Err(e) if step.optional => {
                warn!(status = e.status, stderr = %e.stderr.trim(), "Optional step failed")
            }
            Err(e) => return Ok(Err(e)),
        }
    }
    Ok(Ok(sent))
}

/// Walk a telnet login until a root shell prompt appears
pub fn telnet_login(mut stream: TelnetStream, ip: Ipv4Addr, max_cycles: u32) -> Result<TelnetShell> {
    for cycle in 1..=max_cycles {
        let (index, _) = stream
            .read_until_any(&LOGIN_PROMPTS)
            .map_err(|e| BurrowError::BootstrapFailed {
                ip,
                message: format!("telnet login: {}", e),
            })?;
        let state = LoginState::from_prompt(index);
        debug!(cycle, state = ?state, "telnet login");

        match state {
            LoginState::LoginPrompt => stream.send_line("root")?,
            LoginState::PasswordPrompt => stream.send_line("")?,
            LoginState::ShellPrompt => return Ok(TelnetShell::new(stream)),
        }
    }

    Err(BurrowError::BootstrapFailed {
        ip,
        message: format!("no shell prompt after {} login cycles", max_cycles),
    })
}

/// Drives a factory-fresh router to key authentication
pub struct BootstrapAuthenticator<'a> {
    connector: &'a dyn Connector,
    max_cycles: u32,
    verbosity: u8,
}

impl<'a> BootstrapAuthenticator<'a> {
    pub fn new(connector: &'a dyn Connector, max_cycles: u32, verbosity: u8) -> Self {
        Self {
            connector,
            max_cycles,
            verbosity,
        }
    }

    /// Install credentials on `router` and run pending bootstrap-auth
    /// coteries over the same session. Returns the transport that worked.
    pub fn bootstrap(&self, router: &mut Router, pending: &[&Coterie]) -> Result<Transport> {
        let ip = router.ip;
        let mut state = BootstrapState::Start;

        loop {
            state = match state {
                BootstrapState::Start => {
                    info!(router = %router.label(), "Bootstrapping router");
                    BootstrapState::TrySshNoAuth
                }
                BootstrapState::TrySshNoAuth => {
                    match self.connector.ssh_noauth(ip, router.host_key.as_deref()) {
                        Ok(Some(shell)) => BootstrapState::SshSuccess(SessionGuard::new(shell)),
                        Ok(None) => BootstrapState::TelnetFallback,
                        Err(e @ BurrowError::HostKeyMismatch { .. }) => return Err(e),
                        Err(e) => {
                            debug!(error = %e, "SSH without authentication unavailable");
                            BootstrapState::TelnetFallback
                        }
                    }
                }
                BootstrapState::SshSuccess(guard) => {
                    if router.host_key.is_none() {
                        router.host_key = guard.host_key().map(str::to_string);
                    }
                    BootstrapState::RunPhase2(guard)
                }
                BootstrapState::TelnetFallback => {
                    info!(ip = %ip, "Falling back to telnet");
                    let stream =
                        self.connector
                            .telnet(ip)
                            .map_err(|e| BurrowError::BootstrapFailed {
                                ip,
                                message: format!("no SSH without authentication and telnet failed: {}", e),
                            })?;
                    let shell = telnet_login(stream, ip, self.max_cycles)?;
                    BootstrapState::RunPhase2(SessionGuard::new(Box::new(shell)))
                }
                BootstrapState::RunPhase2(mut guard) => {
                    let transport = guard.transport();
                    self.run_phase2_all(guard.shell(), router, pending)?;
                    if let Err(e) = guard.close() {
                        warn!(error = %e, "Failed to close bootstrap session");
                    }
                    BootstrapState::Done(transport)
                }
                BootstrapState::Done(transport) => {
                    info!(router = %router.label(), via = %transport, "Bootstrap complete");
                    router.connected_via = Some(transport);
                    return Ok(transport);
                }
            };
        }
    }

    fn run_phase2_all(
        &self,
        shell: &mut dyn RemoteShell,
        router: &mut Router,
        pending: &[&Coterie],
    ) -> Result<()> {
        let ip = router.ip;
        let mut steps = Vec::new();
        if self.verbosity >= 2 {
            steps.extend(parse_steps(BOOTSTRAP_LABEL, DIAGNOSTIC_SEQUENCE, router)?);
        }
        steps.extend(parse_steps(BOOTSTRAP_LABEL, BOOTSTRAP_SEQUENCE, router)?);

        run_phase2(shell, &steps)?.map_err(|e| BurrowError::BootstrapFailed {
            ip,
            message: e.to_string(),
        })?;

        for coterie in pending {
            if router.version_of(&coterie.id) >= coterie.version.to {
                continue;
            }
            let steps = parse_steps(&coterie.id, &coterie.data, router)?;
            run_phase2(shell, &steps)?.map_err(|e| e.into_coterie_error(&coterie.id))?;
            router.record_version(&coterie.id, coterie.version.to);
            info!(coterie = %coterie.id, version = coterie.version.to, "Applied during bootstrap");
        }
        Ok(())
    }
}
