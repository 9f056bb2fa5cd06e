// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local helper programs (`ip`, `ping`, `nmcli`)

use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{BurrowError, Result};

/// Run a program and return its stdout; non-zero exit is an error
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    let rendered = render(program, args);
    debug!(command = %rendered, "Running local command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| BurrowError::LocalCommand {
            command: rendered.clone(),
            message: format!("failed to start: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(BurrowError::LocalCommand {
            command: rendered,
            message: format!("{}: {}", output.status, stderr.trim()),
        })
    }
}

/// Run a program for its exit status only
pub fn succeeds(program: &str, args: &[&str]) -> bool {
    match run(program, args) {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "Local command failed");
            false
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
