// SPDX-License-Identifier: AGPL-3.0-or-later
//! Joining a router's WiFi network
//!
//! Visible SSIDs are matched first against networks of known routers, then
//! against factory-default SSID patterns from the hardware modules. Exactly
//! one match is joined; anything else is reported to the operator.

mod nmcli;

pub use nmcli::NmcliBackend;

use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::config::Config;
use crate::coterie::parser::parse_wifi_table;
use crate::coterie::{CoterieModule, CoterieType, ModuleKind};
use crate::error::{BurrowError, Result};

/// Operating-system wireless control
pub trait WirelessBackend {
    /// Request an active scan
    fn rescan(&mut self) -> Result<()>;

    /// SSIDs currently visible
    fn scan_ssids(&mut self) -> Result<Vec<String>>;

    /// Whether a saved connection profile exists for `ssid`
    fn has_profile(&mut self, ssid: &str) -> Result<bool>;

    /// Bring up the saved profile for `ssid`
    fn activate_profile(&mut self, ssid: &str) -> Result<()>;

    /// Join `ssid` with `password`, creating a profile
    fn connect_new(&mut self, ssid: &str, password: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct FactoryEntry {
    pattern: Regex,
    password: String,
}

/// Factory-default SSID patterns and their passwords
#[derive(Debug, Clone, Default)]
pub struct FactoryTable {
    entries: Vec<FactoryEntry>,
}

impl FactoryTable {
    /// Collect the wifi-table coteries of every hardware module
    pub fn from_modules(modules: &[CoterieModule]) -> Result<Self> {
        let mut entries = Vec::new();
        for module in modules.iter().filter(|m| m.kind == ModuleKind::Hardware) {
            for coterie in module.coteries_of(CoterieType::WifiTable) {
                let parsed =
                    parse_wifi_table(&coterie.data).map_err(|message| BurrowError::InvalidModule {
                        module: module.id.clone(),
                        message: format!("coterie '{}': {}", coterie.id, message),
                    })?;
                entries.extend(
                    parsed
                        .into_iter()
                        .map(|(pattern, password)| FactoryEntry { pattern, password }),
                );
            }
        }
        Ok(Self { entries })
    }

    /// Password for the first pattern matching `ssid`
    pub fn password_for(&self, ssid: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.pattern.is_match(ssid))
            .map(|e| e.password.as_str())
    }

    /// Number of SSID patterns
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scan, pick the single supported network, and join it
pub fn connect_known_network(
    config: &Config,
    table: &FactoryTable,
    backend: &mut dyn WirelessBackend,
    settle: Duration,
) -> Result<(String, String)> {
    backend.rescan()?;
    thread::sleep(settle);
    let seen: BTreeSet<String> = backend
        .scan_ssids()?
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    debug!(count = seen.len(), "Visible networks");

    let mut matches: BTreeMap<String, String> = BTreeMap::new();
    for router in &config.routers {
        if let Some(ssid) = router.wifi_ssid.as_ref().filter(|s| seen.contains(*s)) {
            let password = router
                .wifi_join_password
                .clone()
                .unwrap_or_else(|| router.wifi_password.clone());
            matches.entry(ssid.clone()).or_insert(password);
        }
    }
    for ssid in &seen {
        if matches.contains_key(ssid) {
            continue;
        }
        if let Some(password) = table.password_for(ssid) {
            matches.insert(ssid.clone(), password.to_string());
        }
    }

    if matches.len() > 1 {
        return Err(BurrowError::MultipleNetworks {
            ssids: matches.into_keys().collect(),
        });
    }
    let (ssid, password) = matches
        .into_iter()
        .next()
        .ok_or_else(|| BurrowError::NoSupportedNetwork {
            seen: seen.iter().cloned().collect(),
        })?;

    if backend.has_profile(&ssid)? {
        info!(ssid = %ssid, "Joining network (saved profile)");
        backend.activate_profile(&ssid)?;
    } else {
        info!(ssid = %ssid, "Joining network");
        backend.connect_new(&ssid, &password)?;
    }
    thread::sleep(settle);

    Ok((ssid, password))
}
