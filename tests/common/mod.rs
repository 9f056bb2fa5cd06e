// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory router, network and radio for engine tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;
use std::rc::Rc;

use bitburrow::config::{Router, Transport};
use bitburrow::coterie::CoterieModule;
use bitburrow::error::{BurrowError, Result};
use bitburrow::network::{HostProbe, Subnet};
use bitburrow::remote::telnet::TelnetStream;
use bitburrow::remote::{CommandOutput, Connector, RemoteShell};
use bitburrow::wifi::WirelessBackend;

pub const ROUTER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 8, 1);
pub const ROUTER_MAC: &str = "94:83:c4:3f:2a:1b";
pub const ROUTER_HOST_KEY: &str = "SHA256:mockhostkey";

/// State of the simulated router, shared by every shell opened on it
#[derive(Debug, Default)]
pub struct Device {
    /// Our public key is in authorized_keys
    pub key_installed: bool,
    /// Factory SSH accepts root without authentication
    pub noauth_ssh: bool,
    /// Every command run, in order
    pub log: Vec<String>,
    /// `(path, data, mode)` per upload
    pub uploads: Vec<(String, Vec<u8>, u32)>,
    /// Commands containing this text exit with status 1
    pub fail_on: Option<String>,
    pub opened: usize,
    pub closed: usize,
    /// Bytes the telnet port replies with; `None` refuses telnet
    pub telnet_script: Option<Vec<u8>>,
    /// Bytes written to the telnet port
    pub telnet_sent: Vec<u8>,
}

pub type SharedDevice = Rc<RefCell<Device>>;

pub fn factory_device() -> SharedDevice {
    Rc::new(RefCell::new(Device {
        noauth_ssh: true,
        ..Device::default()
    }))
}

/// Telnet login on a factory router followed by `commands` successful
/// marker replies
pub fn telnet_device(commands: u32) -> SharedDevice {
    let mut script = b"\r\nOpenWrt login: Password: \r\nroot@OpenWrt:/# ".to_vec();
    for n in 1..=commands {
        script.extend_from_slice(format!("__bb_exit_{}:0\r\nroot@OpenWrt:/# ", n).as_bytes());
    }
    Rc::new(RefCell::new(Device {
        telnet_script: Some(script),
        ..Device::default()
    }))
}

/// A stored router at [`ROUTER_IP`] pinned to `host_key`
pub fn stored_router(host_key: &str) -> Router {
    Router {
        ip: ROUTER_IP,
        mac: ROUTER_MAC.to_string(),
        nickname: "GL.iNet 2A:1B".to_string(),
        host_key: Some(host_key.to_string()),
        root_password: "correct horse".to_string(),
        wifi_password: "battery staple".to_string(),
        wifi_ssid: None,
        wifi_join_password: None,
        ssh_public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 bitburrow".to_string(),
        ssh_private_key: String::new(),
        hardware: "test-router".to_string(),
        provider: None,
        attributes: BTreeMap::new(),
        coterie_versions: BTreeMap::new(),
        connected_via: None,
    }
}

/// Telnet port of the simulated router
struct DeviceLink {
    device: SharedDevice,
    input: Cursor<Vec<u8>>,
}

impl Read for DeviceLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for DeviceLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        device.telnet_sent.extend_from_slice(buf);
        if String::from_utf8_lossy(buf).contains(">> /etc/dropbear/authorized_keys") {
            device.key_installed = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct MockShell {
    device: SharedDevice,
    transport: Transport,
}

impl RemoteShell for MockShell {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut device = self.device.borrow_mut();
        device.log.push(command.to_string());
        if device
            .fail_on
            .as_deref()
            .is_some_and(|needle| command.contains(needle))
        {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "uci: Invalid argument\n".to_string(),
            });
        }
        if command.contains(">> /etc/dropbear/authorized_keys") {
            device.key_installed = true;
        }
        Ok(CommandOutput::default())
    }

    fn upload(&mut self, path: &str, data: &[u8], mode: u32) -> Result<CommandOutput> {
        self.device
            .borrow_mut()
            .uploads
            .push((path.to_string(), data.to_vec(), mode));
        Ok(CommandOutput::default())
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn host_key(&self) -> Option<&str> {
        Some(ROUTER_HOST_KEY)
    }

    fn close(&mut self) -> Result<()> {
        self.device.borrow_mut().closed += 1;
        Ok(())
    }
}

/// Opens [`MockShell`]s on one simulated router
pub struct FakeConnector {
    pub device: SharedDevice,
}

impl FakeConnector {
    fn open(&self, transport: Transport) -> Box<dyn RemoteShell> {
        self.device.borrow_mut().opened += 1;
        Box::new(MockShell {
            device: Rc::clone(&self.device),
            transport,
        })
    }
}

impl Connector for FakeConnector {
    fn ssh_with_key(&self, _router: &Router) -> Result<Option<Box<dyn RemoteShell>>> {
        if self.device.borrow().key_installed {
            Ok(Some(self.open(Transport::Ssh)))
        } else {
            Ok(None)
        }
    }

    fn ssh_noauth(
        &self,
        _ip: Ipv4Addr,
        pinned_host_key: Option<&str>,
    ) -> Result<Option<Box<dyn RemoteShell>>> {
        if let Some(pinned) = pinned_host_key.filter(|k| *k != ROUTER_HOST_KEY) {
            return Err(BurrowError::HostKeyMismatch {
                ip: ROUTER_IP,
                expected: pinned.to_string(),
                actual: ROUTER_HOST_KEY.to_string(),
            });
        }
        if self.device.borrow().noauth_ssh {
            Ok(Some(self.open(Transport::SshNoAuth)))
        } else {
            Ok(None)
        }
    }

    fn telnet(&self, ip: Ipv4Addr) -> Result<TelnetStream> {
        let script = self.device.borrow().telnet_script.clone();
        match script {
            Some(script) => Ok(TelnetStream::new(Box::new(DeviceLink {
                device: Rc::clone(&self.device),
                input: Cursor::new(script),
            }))),
            None => Err(BurrowError::Unreachable {
                ip,
                message: "connection refused".to_string(),
            }),
        }
    }
}

/// Network with fixed hosts
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    pub subnets: Vec<Subnet>,
    /// ip -> (mac, host key)
    pub hosts: HashMap<Ipv4Addr, (String, Option<String>)>,
}

impl ScriptedProbe {
    /// One router at 192.168.8.1 on 192.168.8.0/24
    pub fn single_router() -> Self {
        let mut hosts = HashMap::new();
        hosts.insert(
            ROUTER_IP,
            (ROUTER_MAC.to_string(), Some(ROUTER_HOST_KEY.to_string())),
        );
        Self {
            subnets: vec!["192.168.8.124/24".parse().unwrap()],
            hosts,
        }
    }
}

impl HostProbe for ScriptedProbe {
    fn local_subnets(&self) -> Result<Vec<Subnet>> {
        Ok(self.subnets.clone())
    }

    fn resolve_mac(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        Ok(self.hosts.get(&ip).map(|(mac, _)| mac.clone()))
    }

    fn host_key_fingerprint(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        Ok(self.hosts.get(&ip).and_then(|(_, key)| key.clone()))
    }
}

/// Radio that sees a fixed list of networks
#[derive(Debug, Default)]
pub struct FakeRadio {
    pub visible: Vec<String>,
    pub profiles: Vec<String>,
    /// `(ssid, password)`; `None` when a saved profile was used
    pub joined: Vec<(String, Option<String>)>,
}

impl FakeRadio {
    pub fn seeing(ssids: &[&str]) -> Self {
        Self {
            visible: ssids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl WirelessBackend for FakeRadio {
    fn rescan(&mut self) -> Result<()> {
        Ok(())
    }

    fn scan_ssids(&mut self) -> Result<Vec<String>> {
        Ok(self.visible.clone())
    }

    fn has_profile(&mut self, ssid: &str) -> Result<bool> {
        Ok(self.profiles.iter().any(|p| p == ssid))
    }

    fn activate_profile(&mut self, ssid: &str) -> Result<()> {
        self.joined.push((ssid.to_string(), None));
        Ok(())
    }

    fn connect_new(&mut self, ssid: &str, password: &str) -> Result<()> {
        self.joined.push((ssid.to_string(), Some(password.to_string())));
        Ok(())
    }
}

/// A hardware module holding a single `dns1` coterie
pub fn dns_module() -> CoterieModule {
    CoterieModule::from_source(
        "test-router",
        r#"
tag = "coterie-module"
kind = "hardware"
protocol = "openwrt"
display_name = "Test router"

[[coteries]]
tag = "coterie"
id = "factory-wifi"
version = "0->1"
sort = 0
type = "wifi-table"
data = '''
^GL-AR300M-[0-9A-Fa-f]{3}$ goodlife
'''

[[coteries]]
tag = "coterie"
id = "dns1"
version = "0->1"
sort = 10
type = "commands"
data = '''
uci set dhcp.@dnsmasq[0].noresolv='1'
uci commit dhcp
'''
"#,
    )
    .unwrap()
}
