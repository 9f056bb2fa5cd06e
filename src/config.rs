// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet configuration and the per-router record
//!
//! A [`Config`] is the root of the on-disk store: fleet-wide settings and
//! defaults plus every [`Router`] ever provisioned. Persistence lives in
//! [`crate::store`]; this module only describes the data and its rules.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};
use crate::registry;

/// Root configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Run settings (timeouts, module directory)
    #[serde(default)]
    pub settings: Settings,

    /// Values applied to newly discovered routers
    #[serde(default)]
    pub defaults: FleetDefaults,

    /// Known routers; encoded separately as tagged records
    #[serde(default, skip_serializing)]
    pub routers: Vec<Router>,
}

/// Timeouts and sources used during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// TCP/SSH connect and handshake timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per remote command timeout
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// How long to let a WiFi rescan settle before reading results
    #[serde(default = "default_wifi_settle")]
    pub wifi_settle_ms: u64,

    /// Prompt/response cycles allowed for a telnet login
    #[serde(default = "default_bootstrap_cycles")]
    pub bootstrap_max_cycles: u32,

    /// Load coterie modules from this directory instead of the built-ins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_dir: Option<PathBuf>,
}

/// Fleet-wide defaults for new routers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetDefaults {
    /// VPN provider id (see [`crate::registry`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Hardware module id
    #[serde(default = "default_hardware")]
    pub hardware: String,

    /// Attributes copied onto every new router (VPN account and the like)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// How the current run reached the router. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Key-authenticated SSH
    Ssh,
    /// SSH with the "none" authentication method
    SshNoAuth,
    /// Telnet root shell
    Telnet,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::SshNoAuth => write!(f, "ssh (no auth)"),
            Transport::Telnet => write!(f, "telnet"),
        }
    }
}

/// One managed device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Router {
    /// Last known IP address
    pub ip: Ipv4Addr,

    /// Last known MAC address (lowercase, colon separated)
    pub mac: String,

    /// Display name derived from the MAC vendor
    pub nickname: String,

    /// SSH host key fingerprint captured at first contact (`SHA256:...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,

    /// Generated root password
    pub root_password: String,

    /// Generated WiFi password, available to coteries as `{wifi_password}`
    pub wifi_password: String,

    /// SSID this router was joined through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,

    /// Password used to join `wifi_ssid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_join_password: Option<String>,

    /// OpenSSH public key, wrapped for readability
    pub ssh_public_key: String,

    /// OpenSSH private key (PEM armor)
    pub ssh_private_key: String,

    /// Hardware module applied to this router
    pub hardware: String,

    /// VPN provider module applied to this router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Free-form attributes, resolvable as payload placeholders
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Highest version applied per coterie id
    #[serde(default)]
    pub coterie_versions: BTreeMap<String, u32>,

    /// Transport of the live session, if any
    #[serde(skip)]
    pub connected_via: Option<Transport>,
}

impl PartialEq for Router {
    /// Equality over persisted fields only
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && self.mac == other.mac
            && self.nickname == other.nickname
            && self.host_key == other.host_key
            && self.root_password == other.root_password
            && self.wifi_password == other.wifi_password
            && self.wifi_ssid == other.wifi_ssid
            && self.wifi_join_password == other.wifi_join_password
            && self.ssh_public_key == other.ssh_public_key
            && self.ssh_private_key == other.ssh_private_key
            && self.hardware == other.hardware
            && self.provider == other.provider
            && self.attributes == other.attributes
            && self.coterie_versions == other.coterie_versions
    }
}

impl Router {
    /// Highest applied version for a coterie id (0 if never applied)
    pub fn version_of(&self, coterie_id: &str) -> u32 {
        self.coterie_versions.get(coterie_id).copied().unwrap_or(0)
    }

    /// Record an applied version. Versions never move backwards.
    pub fn record_version(&mut self, coterie_id: &str, version: u32) {
        let entry = self
            .coterie_versions
            .entry(coterie_id.to_string())
            .or_insert(0);
        *entry = (*entry).max(version);
    }

    /// Resolve a named attribute for payload substitution
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "ip" => Some(self.ip.to_string()),
            "mac" => Some(self.mac.clone()),
            "nickname" => Some(self.nickname.clone()),
            "wifi_password" => Some(self.wifi_password.clone()),
            "wifi_ssid" => self.wifi_ssid.clone(),
            "hardware" => Some(self.hardware.clone()),
            "provider" => self.provider.clone(),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// Short description used in logs and ambiguity errors
    pub fn label(&self) -> String {
        format!("{} ({})", self.nickname, self.ip)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            wifi_settle_ms: default_wifi_settle(),
            bootstrap_max_cycles: default_bootstrap_cycles(),
            module_dir: None,
        }
    }
}

impl Default for FleetDefaults {
    fn default() -> Self {
        Self {
            provider: None,
            hardware: default_hardware(),
            attributes: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            defaults: FleetDefaults::default(),
            routers: Vec::new(),
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.settings.connect_timeout_secs == 0 || self.settings.command_timeout_secs == 0 {
            return Err(BurrowError::InvalidConfig {
                message: "timeouts must be greater than zero".to_string(),
            });
        }

        if self.settings.bootstrap_max_cycles == 0 {
            return Err(BurrowError::InvalidConfig {
                message: "bootstrap_max_cycles must be at least 1".to_string(),
            });
        }

        if let Some(provider) = &self.defaults.provider {
            if registry::provider(provider).is_none() {
                return Err(BurrowError::UnknownProvider {
                    id: provider.clone(),
                });
            }
        }

        let mut host_keys = BTreeSet::new();
        for router in &self.routers {
            if let Some(key) = &router.host_key {
                if !host_keys.insert(key.as_str()) {
                    return Err(BurrowError::InvalidConfig {
                        message: format!("host key {} is recorded for more than one router", key),
                    });
                }
            }
        }

        Ok(())
    }

    /// Index of the router pinned to this host key
    pub fn router_by_host_key(&self, host_key: &str) -> Option<usize> {
        self.routers
            .iter()
            .position(|r| r.host_key.as_deref() == Some(host_key))
    }
}

// Default value functions

fn default_connect_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    60
}

fn default_wifi_settle() -> u64 {
    3000
}

fn default_bootstrap_cycles() -> u32 {
    5
}

fn default_hardware() -> String {
    "gl-ar300m".to_string()
}
