// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router discovery on attached networks
//!
//! Candidate addresses are the first host of every attached subnet plus the
//! addresses of known routers. A live candidate is matched to a known router
//! by its SSH host key, which survives IP and MAC changes.

mod system;
pub mod vendor;

pub use system::SystemProbe;

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{BurrowError, Result};

/// An IPv4 subnet attached to this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    pub fn network(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix.min(32)))
        };
        Ipv4Addr::from(u32::from(self.address) & mask)
    }

    /// Conventional router address: one past the network base
    pub fn router_guess(&self) -> Option<Ipv4Addr> {
        if self.prefix >= 31 {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network()) + 1))
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in CIDR form", s))?;
        let address = address
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("'{}': {}", s, e))?;
        let prefix = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("'{}': bad prefix length", s))?;
        Ok(Subnet { address, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Host-side network queries used by discovery
pub trait HostProbe {
    /// IPv4 subnets of non-loopback interfaces
    fn local_subnets(&self) -> Result<Vec<Subnet>>;

    /// MAC address for `ip`, or `None` if nothing answers
    fn resolve_mac(&self, ip: Ipv4Addr) -> Result<Option<String>>;

    /// SSH host key fingerprint, or `None` if SSH is closed
    fn host_key_fingerprint(&self, ip: Ipv4Addr) -> Result<Option<String>>;
}

/// A live host that may be a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub host_key: Option<String>,
}

impl Candidate {
    pub fn nickname(&self) -> String {
        vendor::nickname(&self.mac)
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.nickname(), self.ip)
    }
}

/// Result of discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// Index of a known router in `config.routers`; its IP and MAC are updated
    Existing(usize),
    /// An unknown device
    New(Candidate),
}

/// Find the router on attached networks
pub fn locate(config: &mut Config, probe: &dyn HostProbe) -> Result<Located> {
    let mut addresses = Vec::new();
    for subnet in probe.local_subnets()? {
        if let Some(guess) = subnet.router_guess() {
            debug!(subnet = %subnet, guess = %guess, "Router guess");
            addresses.push(guess);
        }
    }
    addresses.extend(config.routers.iter().map(|r| r.ip));

    let mut seen = HashSet::new();
    addresses.retain(|ip| seen.insert(*ip));

    let live = probe_candidates(&addresses, probe)?;

    if let Some(located) = match_known(config, &live) {
        return Ok(located);
    }

    match live.len() {
        0 => Err(BurrowError::NoCandidates),
        1 => {
            let candidate = live.into_iter().next().ok_or(BurrowError::NoCandidates)?;
            info!(candidate = %candidate.label(), "Found new router");
            Ok(Located::New(candidate))
        }
        _ => Err(BurrowError::MultipleCandidates {
            candidates: live.iter().map(Candidate::label).collect(),
        }),
    }
}

/// Use a given address instead of scanning
pub fn locate_at(config: &mut Config, probe: &dyn HostProbe, ip: Ipv4Addr) -> Result<Located> {
    let live = probe_candidates(&[ip], probe)?;
    if let Some(located) = match_known(config, &live) {
        return Ok(located);
    }
    live.into_iter()
        .next()
        .map(Located::New)
        .ok_or_else(|| BurrowError::Unreachable {
            ip,
            message: "no MAC address (host not answering)".to_string(),
        })
}

/// Resolve MAC and host key for each address, dropping dead and duplicate hosts
fn probe_candidates(addresses: &[Ipv4Addr], probe: &dyn HostProbe) -> Result<Vec<Candidate>> {
    let mut live = Vec::new();
    let mut claimed: HashSet<String> = HashSet::new();

    for &ip in addresses {
        let mac = match probe.resolve_mac(ip)? {
            Some(mac) if !vendor::is_zero_mac(&mac) => mac.to_ascii_lowercase(),
            _ => {
                debug!(ip = %ip, "No host");
                continue;
            }
        };
        if !claimed.insert(mac.clone()) {
            warn!(ip = %ip, mac = %mac, "MAC already seen at another address; ignoring");
            continue;
        }

        let host_key = match probe.host_key_fingerprint(ip) {
            Ok(key) => key,
            Err(e) => {
                debug!(ip = %ip, error = %e, "No SSH host key");
                None
            }
        };
        debug!(ip = %ip, mac = %mac, host_key = ?host_key, "Live host");
        live.push(Candidate { ip, mac, host_key });
    }

    Ok(live)
}

/// Match live hosts against known routers and update the match in place.
///
/// Host key is authoritative. A known router that never had a host key
/// recorded matches on MAC instead.
fn match_known(config: &mut Config, live: &[Candidate]) -> Option<Located> {
    for candidate in live {
        let index = candidate
            .host_key
            .as_deref()
            .and_then(|key| config.router_by_host_key(key))
            .or_else(|| {
                config
                    .routers
                    .iter()
                    .position(|r| r.host_key.is_none() && r.mac == candidate.mac)
            });

        if let Some(index) = index {
            let router = &mut config.routers[index];
            if router.ip != candidate.ip || router.mac != candidate.mac {
                info!(
                    router = %router.nickname,
                    ip = %candidate.ip,
                    mac = %candidate.mac,
                    "Known router moved"
                );
            }
            router.ip = candidate.ip;
            router.mac = candidate.mac.clone();
            if router.host_key.is_none() {
                router.host_key = candidate.host_key.clone();
            }
            return Some(Located::Existing(index));
        }
    }
    None
}
