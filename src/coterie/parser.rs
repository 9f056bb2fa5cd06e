// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coterie module file parser and validator

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::document::{self, Tag};
use crate::error::{BurrowError, Result};
use crate::registry;

const MAX_ID_LEN: usize = 64;
const DEFAULT_FILE_MODE: u32 = 0o644;

/// What a module provides support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKind {
    /// A router hardware family
    Hardware,
    /// A VPN provider
    Provider,
}

/// Protocol family the module's payloads target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Openwrt,
    Wireguard,
    Openvpn,
}

/// How a coterie's payload is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoterieType {
    /// Shell commands that must each exit zero
    Commands,
    /// Shell commands whose failures are only logged
    Exploration,
    /// Commands for the bootstrap phase-2 runner
    BootstrapAuth,
    /// File contents uploaded to `dest`
    File,
    /// SSID pattern / password table for the WiFi locator
    WifiTable,
}

/// Payload encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Text,
    Base64,
}

/// Declared version step, written `"<from>-><to>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionDelta {
    pub from: u32,
    pub to: u32,
}

impl FromStr for VersionDelta {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (from, to) = s
            .split_once("->")
            .ok_or_else(|| format!("version '{}' is not of the form '<from>-><to>'", s))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| format!("version '{}' has a non-numeric part '{}'", s, part.trim()))
        };
        Ok(VersionDelta {
            from: parse(from)?,
            to: parse(to)?,
        })
    }
}

impl TryFrom<String> for VersionDelta {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionDelta> for String {
    fn from(delta: VersionDelta) -> Self {
        delta.to_string()
    }
}

impl fmt::Display for VersionDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// One named, versioned unit of provisioning work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Coterie {
    /// Stable identifier, the key in a router's version map
    pub id: String,

    /// Version this payload brings the router to
    pub version: VersionDelta,

    /// Global execution order across all elected modules
    pub sort: i64,

    #[serde(rename = "type")]
    pub kind: CoterieType,

    /// Commands, file contents or wifi table
    pub data: String,

    /// Absolute destination path (file type only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,

    /// Permission bits for the uploaded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    #[serde(default)]
    pub encoding: Encoding,

    /// Id of the module that declared this coterie
    #[serde(skip)]
    pub module: String,
}

/// A bundle of coteries for one hardware family or one VPN provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoterieModule {
    /// Module id: registry id or file stem
    #[serde(skip)]
    pub id: String,

    pub kind: ModuleKind,

    pub protocol: Protocol,

    pub display_name: String,

    /// Registered provider id (provider modules only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Coteries in declaration order; decoded as tagged child records
    #[serde(skip)]
    pub coteries: Vec<Coterie>,
}

impl Coterie {
    /// Whether `data` is text (and therefore must end with a newline)
    pub fn is_textual(&self) -> bool {
        self.encoding == Encoding::Text
    }

    /// File mode for uploads
    pub fn file_mode(&self) -> u32 {
        self.mode.unwrap_or(DEFAULT_FILE_MODE)
    }

    /// Raw bytes of a file payload before placeholder substitution
    pub fn decoded_data(&self) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Text => Ok(self.data.as_bytes().to_vec()),
            Encoding::Base64 => {
                let compact: String = self.data.split_whitespace().collect();
                BASE64_STANDARD
                    .decode(compact)
                    .map_err(|e| BurrowError::InvalidModule {
                        module: self.module.clone(),
                        message: format!("coterie '{}': invalid base64 data: {}", self.id, e),
                    })
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !is_valid_id(&self.id) {
            return Err(format!(
                "coterie id '{}' must start with a lowercase letter and use only [a-z0-9_-] (at most {} characters)",
                self.id, MAX_ID_LEN
            ));
        }

        if self.version.from >= self.version.to {
            return Err(format!(
                "coterie '{}': version {} must increase",
                self.id, self.version
            ));
        }

        if self.data.trim().is_empty() {
            return Err(format!("coterie '{}' has no data", self.id));
        }

        match self.kind {
            CoterieType::File => match &self.dest {
                Some(dest) if dest.starts_with('/') => {}
                Some(dest) => {
                    return Err(format!(
                        "coterie '{}': destination '{}' is not an absolute path",
                        self.id, dest
                    ))
                }
                None => return Err(format!("coterie '{}': file type needs 'dest'", self.id)),
            },
            _ => {
                if self.dest.is_some() || self.mode.is_some() {
                    return Err(format!(
                        "coterie '{}': 'dest' and 'mode' apply only to file type",
                        self.id
                    ));
                }
                if self.encoding != Encoding::Text {
                    return Err(format!(
                        "coterie '{}': only file type may use base64 encoding",
                        self.id
                    ));
                }
            }
        }

        if let Some(mode) = self.mode {
            if mode > 0o7777 {
                return Err(format!("coterie '{}': mode {:o} is out of range", self.id, mode));
            }
        }

        if self.is_textual() && !self.data.ends_with('\n') {
            return Err(format!("coterie '{}': data must end with a newline", self.id));
        }

        if self.kind == CoterieType::WifiTable {
            parse_wifi_table(&self.data).map_err(|e| format!("coterie '{}': {}", self.id, e))?;
        }

        Ok(())
    }
}

impl CoterieModule {
    /// Parse and validate a module from TOML text
    pub fn from_source(id: &str, text: &str) -> Result<Self> {
        let parse_err = |message: String| BurrowError::ModuleParse {
            module: id.to_string(),
            message,
        };

        let mut table = document::parse_table(text).map_err(|e| parse_err(e.to_string()))?;
        let records =
            document::take_records(&mut table, "coteries").map_err(|e| parse_err(e.to_string()))?;

        let mut module: CoterieModule = document::decode(table, Tag::CoterieModule)
            .map_err(|e| parse_err(e.to_string()))?;
        module.id = id.to_string();

        for record in records {
            let mut coterie: Coterie =
                document::decode(record, Tag::Coterie).map_err(|e| parse_err(e.to_string()))?;
            coterie.module = id.to_string();
            module.coteries.push(coterie);
        }

        module.validate()?;
        Ok(module)
    }

    /// Parse a module from a file; the id is the file stem
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BurrowError::ModuleNotFound {
                id: path.display().to_string(),
            });
        }

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let contents = std::fs::read_to_string(path)?;
        Self::from_source(&id, &contents)
    }

    /// Validate the module and every coterie it declares
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| BurrowError::InvalidModule {
            module: self.id.clone(),
            message,
        };

        if self.display_name.trim().is_empty() {
            return Err(invalid("display name cannot be empty".to_string()));
        }
        if self.display_name.chars().any(char::is_control) {
            return Err(invalid("display name contains control characters".to_string()));
        }

        match (self.kind, &self.provider) {
            (ModuleKind::Provider, Some(provider)) => {
                if registry::provider(provider).is_none() {
                    return Err(invalid(format!("unknown provider '{}'", provider)));
                }
            }
            (ModuleKind::Provider, None) => {
                return Err(invalid("provider module must name its provider".to_string()))
            }
            (ModuleKind::Hardware, Some(_)) => {
                return Err(invalid("hardware module cannot name a provider".to_string()))
            }
            (ModuleKind::Hardware, None) => {}
        }

        if self.coteries.is_empty() {
            return Err(invalid("module has no coteries".to_string()));
        }

        let mut seen = HashSet::new();
        let mut last_sort: Option<i64> = None;
        for coterie in &self.coteries {
            coterie.validate().map_err(invalid)?;

            if !seen.insert(coterie.id.as_str()) {
                return Err(invalid(format!("duplicate coterie id '{}'", coterie.id)));
            }

            if let Some(previous) = last_sort {
                if coterie.sort < previous {
                    return Err(invalid(format!(
                        "coterie '{}' has sort key {} after {}; sort keys must not decrease",
                        coterie.id, coterie.sort, previous
                    )));
                }
            }
            last_sort = Some(coterie.sort);
        }

        Ok(())
    }

    /// Coteries of one type, in declaration order
    pub fn coteries_of(&self, kind: CoterieType) -> impl Iterator<Item = &Coterie> {
        self.coteries.iter().filter(move |c| c.kind == kind)
    }
}

/// Split command payload text into individual commands.
///
/// Blank lines and `#` comments are skipped; a trailing backslash joins the
/// next line.
pub fn command_lines(data: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut pending = String::new();

    for line in data.lines() {
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            continue;
        }
        pending.push_str(line);
        let command = pending.trim();
        if !command.is_empty() && !command.starts_with('#') {
            commands.push(command.to_string());
        }
        pending.clear();
    }

    let command = pending.trim();
    if !command.is_empty() && !command.starts_with('#') {
        commands.push(command.to_string());
    }
    commands
}

/// Parse a wifi-table payload into (pattern, password) pairs
pub fn parse_wifi_table(data: &str) -> std::result::Result<Vec<(Regex, String)>, String> {
    let mut entries = Vec::new();
    for (number, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (pattern, password) = line
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| format!("wifi table line {} needs '<pattern> <password>'", number + 1))?;
        let regex = Regex::new(pattern.trim())
            .map_err(|e| format!("wifi table line {}: {}", number + 1, e))?;
        entries.push((regex, password.to_string()));
    }
    if entries.is_empty() {
        return Err("wifi table is empty".to_string());
    }
    Ok(entries)
}

/// Coterie ids: `[a-z][a-z0-9_-]*`, bounded length
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    first_ok
        && id.len() <= MAX_ID_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const HARDWARE: &str = r#"
        tag = "coterie-module"
        kind = "hardware"
        protocol = "openwrt"
        display_name = "Test Router"

        [[coteries]]
        tag = "coterie"
        id = "dns1"
        version = "0->1"
        sort = 10
        type = "commands"
        data = "uci commit dhcp\n"

        [[coteries]]
        tag = "coterie"
        id = "motd"
        version = "1->2"
        sort = 20
        type = "file"
        dest = "/etc/banner"
        mode = 0o600
        data = "hello\n"
    "#;

    fn with_second_coterie(field: &str) -> String {
        HARDWARE.replace("id = \"motd\"", &format!("id = \"motd\"\n{}", field))
    }

    #[test]
    fn test_parse_module() {
        let module = CoterieModule::from_source("test", HARDWARE).unwrap();
        assert_eq!(module.id, "test");
        assert_eq!(module.kind, ModuleKind::Hardware);
        assert_eq!(module.protocol, Protocol::Openwrt);
        assert_eq!(module.coteries.len(), 2);
        assert_eq!(module.coteries[0].version, VersionDelta { from: 0, to: 1 });
        assert_eq!(module.coteries[1].file_mode(), 0o600);
        assert!(module.coteries.iter().all(|c| c.module == "test"));
    }

    #[test]
    fn test_parse_module_file() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("router-x.toml");
        fs::write(&file_path, HARDWARE).unwrap();

        let module = CoterieModule::from_file(&file_path).unwrap();
        assert_eq!(module.id, "router-x");
    }

    #[test]
    fn test_version_delta_parse() {
        assert_eq!("3->4".parse::<VersionDelta>().unwrap().to, 4);
        assert_eq!(" 0 -> 12 ".parse::<VersionDelta>().unwrap().to, 12);
        assert!("4".parse::<VersionDelta>().is_err());
        assert!("a->b".parse::<VersionDelta>().is_err());
        assert_eq!(VersionDelta { from: 1, to: 2 }.to_string(), "1->2");
    }

    #[test]
    fn test_decreasing_version_rejected() {
        let text = HARDWARE.replace("version = \"1->2\"", "version = \"2->2\"");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("must increase"));
    }

    #[test]
    fn test_decreasing_sort_rejected() {
        let text = HARDWARE.replace("sort = 20", "sort = 5");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("must not decrease"));
    }

    #[test]
    fn test_equal_sort_allowed() {
        let text = HARDWARE.replace("sort = 20", "sort = 10");
        assert!(CoterieModule::from_source("test", &text).is_ok());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let text = HARDWARE.replace("id = \"motd\"", "id = \"dns1\"");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("duplicate coterie id 'dns1'"));
    }

    #[test]
    fn test_bad_id_rejected() {
        let text = HARDWARE.replace("id = \"motd\"", "id = \"Motd!\"");
        assert!(CoterieModule::from_source("test", &text).is_err());
    }

    #[test]
    fn test_missing_newline_rejected() {
        let text = HARDWARE.replace("data = \"hello\\n\"", "data = \"hello\"");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("newline"));
    }

    #[test]
    fn test_relative_dest_rejected() {
        let text = HARDWARE.replace("dest = \"/etc/banner\"", "dest = \"etc/banner\"");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = HARDWARE.replace("type = \"commands\"", "type = \"ansible\"");
        assert!(matches!(
            CoterieModule::from_source("test", &text),
            Err(BurrowError::ModuleParse { .. })
        ));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let text = HARDWARE.replace("protocol = \"openwrt\"", "protocol = \"ipsec\"");
        assert!(CoterieModule::from_source("test", &text).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = with_second_coterie("owner = \"root\"");
        assert!(CoterieModule::from_source("test", &text).is_err());
    }

    #[test]
    fn test_control_character_name_rejected() {
        let text = HARDWARE.replace("Test Router", "Test\\u0007Router");
        let err = CoterieModule::from_source("test", &text).unwrap_err();
        assert!(err.to_string().contains("control"));
    }

    #[test]
    fn test_provider_module_needs_registered_provider() {
        let text = HARDWARE.replace("kind = \"hardware\"", "kind = \"provider\"");
        assert!(CoterieModule::from_source("test", &text).is_err());

        let text = text.replace(
            "display_name = \"Test Router\"",
            "display_name = \"Test\"\nprovider = \"mullvad\"",
        );
        assert!(CoterieModule::from_source("test", &text).is_ok());
    }

    #[test]
    fn test_base64_file_payload() {
        let text = with_second_coterie("encoding = \"base64\"")
            .replace("data = \"hello\\n\"", "data = \"AAEC/w==\"");
        let module = CoterieModule::from_source("test", &text).unwrap();
        assert_eq!(module.coteries[1].decoded_data().unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_command_lines() {
        let data = "# comment\n\nuci set a=b\nopkg install \\\n  wireguard-tools\n  \n";
        assert_eq!(
            command_lines(data),
            vec!["uci set a=b".to_string(), "opkg install   wireguard-tools".to_string()]
        );
    }

    #[test]
    fn test_wifi_table_parse() {
        let entries = parse_wifi_table("^GL-AR300M-[0-9A-Fa-f]{3}$ goodlife\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.is_match("GL-AR300M-3f2"));
        assert_eq!(entries[0].1, "goodlife");
        assert!(parse_wifi_table("lonely\n").is_err());
        assert!(parse_wifi_table("^(unclosed goodlife\n").is_err());
    }
}
