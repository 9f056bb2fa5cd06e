// SPDX-License-Identifier: AGPL-3.0-or-later
//! Offline self-check
//!
//! Validates the loaded coterie modules and runs known-answer fixtures for
//! the pieces that a router run depends on but cannot easily observe.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::{debug, error};

use crate::config::Router;
use crate::coterie::parser::command_lines;
use crate::coterie::substitute::substitute;
use crate::coterie::{self, load_modules, CoterieModule, ModuleSource};
use crate::credentials;
use crate::error::{BurrowError, Result};
use crate::wifi::FactoryTable;

const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Outcome of one fixture
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// All fixture outcomes
#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    pub modules: usize,
    pub combinations: usize,
    pub checks: Vec<CheckResult>,
}

impl SelfCheckReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// First failure as an error
    pub fn ensure_passed(&self) -> Result<()> {
        match self.checks.iter().find(|c| !c.passed) {
            Some(failed) => Err(BurrowError::SelfCheck {
                fixture: failed.name.clone(),
                message: failed.detail.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{} modules, {} module combinations elect cleanly\n",
            self.modules, self.combinations
        );
        for check in &self.checks {
            let status = if check.passed { "ok  " } else { "FAIL" };
            out.push_str(&format!("{} {}", status, check.name));
            if let Some(detail) = &check.detail {
                out.push_str(&format!(": {}", detail));
            }
            out.push('\n');
        }
        out
    }
}

/// Validate `modules` and run every fixture.
///
/// Module errors are returned directly; fixture failures are collected in
/// the report.
pub fn run(modules: &[CoterieModule]) -> Result<SelfCheckReport> {
    let combinations = coterie::validate_module_set(modules)?;

    let fixtures: [(&str, fn() -> std::result::Result<(), String>); 6] = [
        ("sha256-known-answer", check_sha256),
        ("sha512-crypt-verify", check_shadow_hash),
        ("factory-wifi-pattern", check_factory_table),
        ("placeholder-substitution", check_substitution),
        ("unresolved-placeholder", check_unresolved_placeholder),
        ("command-splitting", check_command_lines),
    ];

    let checks = fixtures
        .iter()
        .map(|(name, fixture)| {
            let outcome = fixture();
            match &outcome {
                Ok(()) => debug!(fixture = %name, "Self-check passed"),
                Err(e) => error!(fixture = %name, error = %e, "Self-check failed"),
            }
            CheckResult {
                name: name.to_string(),
                passed: outcome.is_ok(),
                detail: outcome.err(),
            }
        })
        .collect();

    Ok(SelfCheckReport {
        modules: modules.len(),
        combinations,
        checks,
    })
}

fn check_sha256() -> std::result::Result<(), String> {
    let digest = credentials::http_password_sha256("abc");
    expect_eq("sha256(\"abc\")", &digest, SHA256_ABC)
}

fn check_shadow_hash() -> std::result::Result<(), String> {
    let hash = credentials::shadow_hash("bitburrow").map_err(|e| e.to_string())?;
    sha_crypt::sha512_check("bitburrow", &hash)
        .map_err(|e| format!("generated hash does not verify: {:?}", e))?;
    if sha_crypt::sha512_check("wrong", &hash).is_ok() {
        return Err("hash verifies a wrong password".to_string());
    }
    Ok(())
}

fn check_factory_table() -> std::result::Result<(), String> {
    let builtins = load_modules(&ModuleSource::Builtin).map_err(|e| e.to_string())?;
    let table = FactoryTable::from_modules(&builtins).map_err(|e| e.to_string())?;
    if table.is_empty() {
        return Err("built-in modules carry no factory WiFi patterns".to_string());
    }
    debug!(patterns = table.len(), "Factory WiFi table loaded");
    match table.password_for("GL-AR300M-3f2") {
        Some(password) => expect_eq("password for GL-AR300M-3f2", password, "goodlife"),
        None => Err("GL-AR300M-3f2 matches no factory pattern".to_string()),
    }
}

fn check_substitution() -> std::result::Result<(), String> {
    let router = fixture_router();
    let text = substitute("fixture", "host={nickname} ip={ip} {{literal}}\n", &router)
        .map_err(|e| e.to_string())?;
    expect_eq(
        "substituted text",
        &text,
        "host=Fixture 00:01 ip=192.0.2.1 {literal}\n",
    )
}

fn check_unresolved_placeholder() -> std::result::Result<(), String> {
    let router = fixture_router();
    match substitute("fixture", "{vpn_account}\n", &router) {
        Err(BurrowError::UnresolvedPlaceholder { coterie, name })
            if coterie == "fixture" && name == "vpn_account" =>
        {
            Ok(())
        }
        Err(other) => Err(format!("wrong error: {}", other)),
        Ok(text) => Err(format!("unknown placeholder resolved to '{}'", text.trim_end())),
    }
}

fn check_command_lines() -> std::result::Result<(), String> {
    let commands = command_lines("# comment\na \\\nb\n\nc\n");
    if commands == ["a b", "c"] {
        Ok(())
    } else {
        Err(format!("split into {:?}", commands))
    }
}

fn expect_eq(what: &str, actual: &str, expected: &str) -> std::result::Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{}: expected '{}', got '{}'", what, expected, actual))
    }
}

fn fixture_router() -> Router {
    Router {
        ip: Ipv4Addr::new(192, 0, 2, 1),
        mac: "02:00:00:00:00:01".to_string(),
        nickname: "Fixture 00:01".to_string(),
        host_key: None,
        root_password: "fixture".to_string(),
        wifi_password: "fixture".to_string(),
        wifi_ssid: None,
        wifi_join_password: None,
        ssh_public_key: "ssh-ed25519 AAAA fixture".to_string(),
        ssh_private_key: String::new(),
        hardware: "fixture".to_string(),
        provider: None,
        attributes: BTreeMap::new(),
        coterie_versions: BTreeMap::new(),
        connected_via: None,
    }
}
