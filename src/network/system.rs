// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host probe backed by `ip`, `ping` and the kernel ARP table

use std::net::Ipv4Addr;
use std::time::Duration;

use super::{vendor, HostProbe, Subnet};
use crate::error::Result;
use crate::local;
use crate::remote::ssh;

const ARP_TABLE: &str = "/proc/net/arp";

/// Probe for the machine this runs on
pub struct SystemProbe {
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl HostProbe for SystemProbe {
    fn local_subnets(&self) -> Result<Vec<Subnet>> {
        let output = local::run("ip", &["-o", "-4", "addr", "show"])?;
        Ok(parse_ip_addr(&output))
    }

    fn resolve_mac(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        // A ping populates the neighbour table; its own result does not matter.
        let wait = self.timeout.as_secs().max(1).to_string();
        let target = ip.to_string();
        local::succeeds("ping", &["-c", "1", "-W", &wait, &target]);

        let table = std::fs::read_to_string(ARP_TABLE)?;
        Ok(parse_arp_table(&table, ip))
    }

    fn host_key_fingerprint(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        ssh::probe_host_key(ip, self.timeout)
    }
}

/// Subnets from `ip -o -4 addr show`, loopback excluded
pub fn parse_ip_addr(output: &str) -> Vec<Subnet> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "inet")?;
            fields.next()?.parse::<Subnet>().ok()
        })
        .filter(|subnet| !subnet.address.is_loopback())
        .collect()
}

/// MAC for `ip` from `/proc/net/arp` text
pub fn parse_arp_table(table: &str, ip: Ipv4Addr) -> Option<String> {
    let wanted = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [address, _hw_type, _flags, mac, ..] if *address == wanted => {
                vendor::normalize_mac(mac)
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
3: wlp3s0    inet 192.168.8.143/24 brd 192.168.8.255 scope global dynamic noprefixroute wlp3s0\\       valid_lft 42000sec preferred_lft 42000sec
4: docker0    inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0\\       valid_lft forever preferred_lft forever
";

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.8.1      0x1         0x2         94:83:c4:3f:2a:1b     *        wlp3s0
192.168.8.77     0x1         0x0         00:00:00:00:00:00     *        wlp3s0
";

    #[test]
    fn test_parse_ip_addr() {
        let subnets = parse_ip_addr(IP_ADDR);
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[0].to_string(), "192.168.8.143/24");
        assert_eq!(subnets[1].router_guess(), Some(Ipv4Addr::new(172, 17, 0, 1)));
    }

    #[test]
    fn test_parse_arp_table() {
        assert_eq!(
            parse_arp_table(ARP, Ipv4Addr::new(192, 168, 8, 1)).as_deref(),
            Some("94:83:c4:3f:2a:1b")
        );
        assert_eq!(
            parse_arp_table(ARP, Ipv4Addr::new(192, 168, 8, 77)).as_deref(),
            Some("00:00:00:00:00:00")
        );
        assert_eq!(parse_arp_table(ARP, Ipv4Addr::new(10, 0, 0, 1)), None);
    }
}
