// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coterie executor
//!
//! Applies elected coteries to one router in sort order. A coterie whose
//! recorded version already reaches its target is skipped; every other one
//! runs to completion and then has its version recorded, so a failed run can
//! simply be repeated.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::parser::{command_lines, Coterie, CoterieType, Encoding};
use super::substitute::substitute;
use crate::bootstrap::{parse_steps, run_phase2};
use crate::config::Router;
use crate::error::{BurrowError, Result};
use crate::remote::RemoteShell;

/// Executor for elected coteries
pub struct CoterieExecutor {
    /// Resolve and log payloads without sending them
    dry_run: bool,
}

/// What happened to one coterie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CoterieOutcome {
    /// Payload sent and version recorded
    Applied { version: u32, commands: usize },
    /// Recorded version already reaches the target
    Skipped { recorded: u32 },
    /// Dry run: payload resolved but not sent
    WouldApply { version: u32, commands: usize },
    /// Data-only coterie (wifi table); nothing to send
    Passive,
}

/// Result of executing a single coterie
#[derive(Debug, Clone, Serialize)]
pub struct CoterieResult {
    pub coterie: String,
    pub module: String,
    #[serde(flatten)]
    pub outcome: CoterieOutcome,
    pub duration_ms: u64,
}

/// Result of a complete run against one router
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Router label
    pub router: String,
    pub dry_run: bool,
    pub results: Vec<CoterieResult>,
    pub applied: usize,
    pub skipped: usize,
    /// Remote commands and uploads issued
    pub commands_sent: usize,
    pub total_duration_ms: u64,
}

impl RunReport {
    /// Human-readable summary
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let line = match result.outcome {
                CoterieOutcome::Applied { version, commands } => {
                    format!("applied  {} -> v{} ({} commands)", result.coterie, version, commands)
                }
                CoterieOutcome::Skipped { recorded } => {
                    format!("current  {} (v{})", result.coterie, recorded)
                }
                CoterieOutcome::WouldApply { version, commands } => format!(
                    "pending  {} -> v{} ({} commands, dry run)",
                    result.coterie, version, commands
                ),
                CoterieOutcome::Passive => continue,
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!(
            "{}: {} applied, {} already current, {} commands sent\n",
            self.router, self.applied, self.skipped, self.commands_sent
        ));
        out
    }
}

impl CoterieExecutor {
    /// Create a new executor
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Apply `coteries` in order, stopping at the first failure.
    ///
    /// Versions of coteries completed before a failure stay recorded on
    /// `router`; the caller persists them either way.
    pub fn execute_all(
        &self,
        coteries: &[Coterie],
        router: &mut Router,
        shell: &mut dyn RemoteShell,
    ) -> Result<RunReport> {
        let start_time = Instant::now();
        let mut results = Vec::with_capacity(coteries.len());

        info!(
            router = %router.label(),
            coteries = coteries.len(),
            dry_run = self.dry_run,
            "Starting coterie run"
        );

        for coterie in coteries {
            let started = Instant::now();
            match self.execute(coterie, router, shell) {
                Ok(outcome) => results.push(CoterieResult {
                    coterie: coterie.id.clone(),
                    module: coterie.module.clone(),
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                }),
                Err(e) => {
                    error!(coterie = %coterie.id, error = %e, "Coterie failed");
                    warn!("Stopping run; completed coteries remain recorded");
                    return Err(e);
                }
            }
        }

        let mut applied = 0usize;
        let mut skipped = 0usize;
        let mut commands_sent = 0usize;
        for result in &results {
            match result.outcome {
                CoterieOutcome::Applied { commands, .. } => {
                    applied += 1;
                    commands_sent += commands;
                }
                CoterieOutcome::Skipped { .. } => skipped += 1,
                CoterieOutcome::WouldApply { .. } | CoterieOutcome::Passive => {}
            }
        }

        let total_duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            router = %router.label(),
            applied,
            skipped,
            commands_sent,
            duration_ms = total_duration_ms,
            "Coterie run completed"
        );

        Ok(RunReport {
            router: router.label(),
            dry_run: self.dry_run,
            results,
            applied,
            skipped,
            commands_sent,
            total_duration_ms,
        })
    }

    /// Apply a single coterie if the router's recorded version is behind
    pub fn execute(
        &self,
        coterie: &Coterie,
        router: &mut Router,
        shell: &mut dyn RemoteShell,
    ) -> Result<CoterieOutcome> {
        if coterie.kind == CoterieType::WifiTable {
            return Ok(CoterieOutcome::Passive);
        }

        let recorded = router.version_of(&coterie.id);
        let target = coterie.version.to;
        if recorded >= target {
            debug!(coterie = %coterie.id, recorded, "Already current");
            return Ok(CoterieOutcome::Skipped { recorded });
        }
        if recorded < coterie.version.from {
            warn!(
                coterie = %coterie.id,
                recorded,
                from = coterie.version.from,
                "Recorded version is below this coterie's starting version; applying anyway"
            );
        }

        let commands = match coterie.kind {
            CoterieType::Commands | CoterieType::Exploration => {
                self.execute_commands(coterie, router, shell)?
            }
            CoterieType::BootstrapAuth => self.execute_bootstrap_auth(coterie, router, shell)?,
            CoterieType::File => self.execute_file(coterie, router, shell)?,
            CoterieType::WifiTable => 0,
        };

        if self.dry_run {
            return Ok(CoterieOutcome::WouldApply {
                version: target,
                commands,
            });
        }

        router.record_version(&coterie.id, target);
        info!(coterie = %coterie.id, version = target, commands, "Coterie applied");
        Ok(CoterieOutcome::Applied {
            version: target,
            commands,
        })
    }

    /// Run each command; for exploration coteries failures are only logged
    fn execute_commands(
        &self,
        coterie: &Coterie,
        router: &Router,
        shell: &mut dyn RemoteShell,
    ) -> Result<usize> {
        let commands = command_lines(&coterie.data)
            .iter()
            .map(|line| substitute(&coterie.id, line, router))
            .collect::<Result<Vec<_>>>()?;

        if self.dry_run {
            for command in &commands {
                info!(coterie = %coterie.id, command = %command, "[DRY RUN] Would run");
            }
            return Ok(commands.len());
        }

        for command in &commands {
            debug!(coterie = %coterie.id, command = %command, "Running");
            let output = shell.run(command)?;

            if coterie.kind == CoterieType::Exploration {
                if output.success() {
                    info!(coterie = %coterie.id, command = %command, output = %output.stdout.trim_end(), "Explored");
                } else {
                    warn!(
                        coterie = %coterie.id,
                        command = %command,
                        status = output.status,
                        stderr = %output.stderr.trim(),
                        "Exploration command failed"
                    );
                }
                continue;
            }

            output
                .into_checked(command)
                .map_err(|e| e.into_coterie_error(&coterie.id))?;
        }
        Ok(commands.len())
    }

    fn execute_bootstrap_auth(
        &self,
        coterie: &Coterie,
        router: &Router,
        shell: &mut dyn RemoteShell,
    ) -> Result<usize> {
        let steps = parse_steps(&coterie.id, &coterie.data, router)?;
        if self.dry_run {
            for step in &steps {
                info!(coterie = %coterie.id, command = %step.command, optional = step.optional, "[DRY RUN] Would run");
            }
            return Ok(steps.len());
        }
        run_phase2(shell, &steps)?.map_err(|e| e.into_coterie_error(&coterie.id))
    }

    fn execute_file(
        &self,
        coterie: &Coterie,
        router: &Router,
        shell: &mut dyn RemoteShell,
    ) -> Result<usize> {
        let dest = coterie
            .dest
            .as_deref()
            .ok_or_else(|| BurrowError::InvalidModule {
                module: coterie.module.clone(),
                message: format!("coterie '{}': file type needs 'dest'", coterie.id),
            })?;
        let data = match coterie.encoding {
            Encoding::Text => substitute(&coterie.id, &coterie.data, router)?.into_bytes(),
            Encoding::Base64 => coterie.decoded_data()?,
        };

        if self.dry_run {
            info!(coterie = %coterie.id, dest = %dest, bytes = data.len(), "[DRY RUN] Would upload");
            return Ok(1);
        }

        debug!(coterie = %coterie.id, dest = %dest, bytes = data.len(), "Uploading");
        shell
            .upload(dest, &data, coterie.file_mode())?
            .into_checked(&format!("upload {}", dest))
            .map_err(|e| e.into_coterie_error(&coterie.id))?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_router;
    use crate::config::Transport;
    use crate::coterie::parser::VersionDelta;
    use crate::remote::CommandOutput;

    #[derive(Default)]
    struct MockShell {
        commands: Vec<String>,
        uploads: Vec<(String, Vec<u8>, u32)>,
        fail_on: Option<&'static str>,
    }

    impl RemoteShell for MockShell {
        fn run(&mut self, command: &str) -> Result<CommandOutput> {
            self.commands.push(command.to_string());
            let status = match self.fail_on {
                Some(fragment) if command.contains(fragment) => 1,
                _ => 0,
            };
            Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr: if status == 0 { String::new() } else { "boom\n".to_string() },
            })
        }

        fn upload(&mut self, path: &str, data: &[u8], mode: u32) -> Result<CommandOutput> {
            self.uploads.push((path.to_string(), data.to_vec(), mode));
            Ok(CommandOutput::default())
        }

        fn transport(&self) -> Transport {
            Transport::Ssh
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn coterie(id: &str, kind: CoterieType, sort: i64, data: &str) -> Coterie {
        Coterie {
            id: id.to_string(),
            version: VersionDelta { from: 0, to: 1 },
            sort,
            kind,
            data: data.to_string(),
            dest: None,
            mode: None,
            encoding: Encoding::Text,
            module: "test".to_string(),
        }
    }

    #[test]
    fn test_apply_then_skip() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let coteries = vec![coterie("dns1", CoterieType::Commands, 10, "uci commit dhcp\n")];

        let first = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert_eq!(first.applied, 1);
        assert_eq!(first.commands_sent, 1);
        assert_eq!(router.version_of("dns1"), 1);

        let second = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.commands_sent, 0);
        assert_eq!(shell.commands.len(), 1);
    }

    #[test]
    fn test_failure_keeps_earlier_versions() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell {
            fail_on: Some("opkg"),
            ..MockShell::default()
        };
        let coteries = vec![
            coterie("dns1", CoterieType::Commands, 10, "uci commit dhcp\n"),
            coterie("packages", CoterieType::Commands, 20, "opkg install x\nopkg install y\n"),
            coterie("later", CoterieType::Commands, 30, "true\n"),
        ];

        let err = executor
            .execute_all(&coteries, &mut router, &mut shell)
            .unwrap_err();
        match err {
            BurrowError::CoterieFailed {
                coterie,
                command,
                status,
                stderr,
            } => {
                assert_eq!(coterie, "packages");
                assert_eq!(command, "opkg install x");
                assert_eq!(status, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(router.version_of("dns1"), 1);
        assert_eq!(router.version_of("packages"), 0);
        assert_eq!(router.version_of("later"), 0);
        assert_eq!(shell.commands.len(), 2);
    }

    #[test]
    fn test_exploration_failures_tolerated() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell {
            fail_on: Some("missing"),
            ..MockShell::default()
        };
        let coteries = vec![coterie(
            "explore1",
            CoterieType::Exploration,
            10,
            "cat /missing\nuname -a\n",
        )];
        let report = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(router.version_of("explore1"), 1);
    }

    #[test]
    fn test_exploration_failure_runs_remaining_commands() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell {
            fail_on: Some("missing"),
            ..MockShell::default()
        };
        let coteries = vec![
            coterie("explore1", CoterieType::Exploration, 10, "cat /missing\nuname -a\n"),
            coterie("dns1", CoterieType::Commands, 20, "uci commit dhcp\n"),
        ];
        let report = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert_eq!(shell.commands, ["cat /missing", "uname -a", "uci commit dhcp"]);
        assert_eq!(report.applied, 2);
        assert_eq!(router.version_of("dns1"), 1);
    }

    #[test]
    fn test_wifi_table_leaves_versions_alone() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let coteries = vec![coterie(
            "factory-wifi",
            CoterieType::WifiTable,
            0,
            "^GL-.*$ goodlife\n",
        )];
        executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert!(router.coterie_versions.is_empty());
        assert!(shell.commands.is_empty());
    }

    #[test]
    fn test_dry_run_sends_and_records_nothing() {
        let executor = CoterieExecutor::new(true);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let coteries = vec![coterie("dns1", CoterieType::Commands, 10, "uci commit dhcp\n")];
        let report = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        assert!(report.dry_run);
        assert!(shell.commands.is_empty());
        assert!(router.coterie_versions.is_empty());
        assert!(report.render_text().contains("dry run"));
    }

    #[test]
    fn test_dry_run_still_rejects_unresolved_placeholders() {
        let executor = CoterieExecutor::new(true);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let coteries = vec![coterie("acct", CoterieType::Commands, 10, "echo {vpn_account}\n")];
        assert!(matches!(
            executor.execute_all(&coteries, &mut router, &mut shell),
            Err(BurrowError::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn test_file_upload_substitutes() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let mut banner = coterie("banner", CoterieType::File, 10, "Managed: {nickname}\n");
        banner.dest = Some("/etc/banner".to_string());
        banner.mode = Some(0o600);

        executor
            .execute_all(&[banner], &mut router, &mut shell)
            .unwrap();
        assert_eq!(shell.uploads.len(), 1);
        let (path, data, mode) = &shell.uploads[0];
        assert_eq!(path, "/etc/banner");
        assert_eq!(data, b"Managed: GL.iNet 2A:1B\n");
        assert_eq!(*mode, 0o600);
    }

    #[test]
    fn test_behind_base_version_still_applies() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let mut step = coterie("dns2", CoterieType::Commands, 10, "true\n");
        step.version = VersionDelta { from: 1, to: 2 };

        let outcome = executor.execute(&step, &mut router, &mut shell).unwrap();
        assert_eq!(
            outcome,
            CoterieOutcome::Applied {
                version: 2,
                commands: 1
            }
        );
    }

    #[test]
    fn test_bootstrap_auth_optional_steps() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell {
            fail_on: Some("telnet"),
            ..MockShell::default()
        };
        let lockdown = coterie(
            "ssh-lockdown",
            CoterieType::BootstrapAuth,
            10,
            "uci commit dropbear\n-/etc/init.d/telnet disable\n",
        );
        executor.execute(&lockdown, &mut router, &mut shell).unwrap();
        assert_eq!(router.version_of("ssh-lockdown"), 1);
    }

    #[test]
    fn test_report_serializes() {
        let executor = CoterieExecutor::new(false);
        let mut router = sample_router();
        let mut shell = MockShell::default();
        let coteries = vec![coterie("dns1", CoterieType::Commands, 10, "true\n")];
        let report = executor.execute_all(&coteries, &mut router, &mut shell).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["outcome"], "applied");
        assert_eq!(json["results"][0]["coterie"], "dns1");
    }
}
