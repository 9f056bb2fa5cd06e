// SPDX-License-Identifier: AGPL-3.0-or-later
//! NetworkManager backend

use tracing::{debug, warn};

use super::WirelessBackend;
use crate::error::Result;
use crate::local;

const NMCLI: &str = "nmcli";

/// Wireless control through `nmcli`
#[derive(Debug, Default)]
pub struct NmcliBackend;

impl NmcliBackend {
    pub fn new() -> Self {
        Self
    }
}

impl WirelessBackend for NmcliBackend {
    fn rescan(&mut self) -> Result<()> {
        // NetworkManager refuses rescans that come too soon after the last one.
        if let Err(e) = local::run(NMCLI, &["device", "wifi", "rescan"]) {
            warn!(error = %e, "WiFi rescan request failed; using cached results");
        }
        Ok(())
    }

    fn scan_ssids(&mut self) -> Result<Vec<String>> {
        let output = local::run(NMCLI, &["-t", "-f", "SSID", "device", "wifi", "list"])?;
        Ok(parse_terse_column(&output))
    }

    fn has_profile(&mut self, ssid: &str) -> Result<bool> {
        let output = local::run(NMCLI, &["-t", "-f", "NAME", "connection", "show"])?;
        Ok(parse_terse_column(&output).iter().any(|name| name == ssid))
    }

    fn activate_profile(&mut self, ssid: &str) -> Result<()> {
        local::run(NMCLI, &["connection", "up", "id", ssid])?;
        Ok(())
    }

    fn connect_new(&mut self, ssid: &str, password: &str) -> Result<()> {
        debug!(ssid = %ssid, "Creating connection profile");
        local::run(NMCLI, &["device", "wifi", "connect", ssid, "password", password])?;
        Ok(())
    }
}

/// Values of a single-column `nmcli -t` listing, unescaped, blanks dropped
pub fn parse_terse_column(output: &str) -> Vec<String> {
    output
        .lines()
        .map(unescape)
        .filter(|value| !value.is_empty())
        .collect()
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
