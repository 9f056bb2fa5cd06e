// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end provisioning runs
//!
//! `set_up` takes a router from factory state (or any later state) to the
//! current coterie versions. `update` does the same for a router already in
//! the store, and `open_shell` relays commands to one.

use std::io::{BufRead, Write};
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapAuthenticator;
use crate::config::{Config, FleetDefaults, Router, Settings};
use crate::coterie::parser::command_lines;
use crate::coterie::substitute::{placeholders, BUILTIN_PLACEHOLDERS};
use crate::coterie::{
    self, Coterie, CoterieExecutor, CoterieModule, CoterieType, Encoding, RunReport,
};
use crate::credentials::GeneratedCredentials;
use crate::error::{BurrowError, Result};
use crate::network::{self, Candidate, HostProbe, Located};
use crate::registry;
use crate::remote::{Connector, RemoteShell, SessionGuard};
use crate::store::ConfigStore;
use crate::wifi::{self, FactoryTable, WirelessBackend};

/// Per-run choices from the command line
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `-v` count
    pub verbosity: u8,
    /// Resolve and log payloads without sending them
    pub dry_run: bool,
    /// Skip discovery and use this address
    pub router_address: Option<Ipv4Addr>,
    /// Override the VPN provider
    pub provider: Option<String>,
    /// Override the hardware module
    pub hardware: Option<String>,
}

/// Host-side collaborators of a run
pub struct Environment<'a> {
    pub probe: &'a dyn HostProbe,
    pub wifi: &'a mut dyn WirelessBackend,
    pub connector: &'a dyn Connector,
}

/// Find a router (new or known), bring it to the current coterie versions
pub fn set_up(
    config: &mut Config,
    modules: &[CoterieModule],
    env: &mut Environment<'_>,
    opts: &RunOptions,
) -> Result<RunReport> {
    coterie::validate_module_set(modules)?;

    let (located, joined) = match opts.router_address {
        Some(ip) => (network::locate_at(config, env.probe, ip)?, None),
        None => {
            let factory = FactoryTable::from_modules(modules)?;
            debug!(patterns = factory.len(), "Factory WiFi table loaded");
            let settle = Duration::from_millis(config.settings.wifi_settle_ms);
            let joined = wifi::connect_known_network(config, &factory, env.wifi, settle)?;
            (network::locate(config, env.probe)?, Some(joined))
        }
    };

    let index = match located {
        Located::Existing(index) => {
            info!(router = %config.routers[index].label(), "Known router");
            let router = &mut config.routers[index];
            if router.wifi_ssid.is_none() {
                if let Some((ssid, password)) = joined {
                    router.wifi_ssid = Some(ssid);
                    router.wifi_join_password = Some(password);
                }
            }
            index
        }
        Located::New(candidate) => {
            let router = new_router(&candidate, &config.defaults, joined, opts)?;
            info!(router = %router.label(), "Adding new router");
            config.routers.push(router);
            config.routers.len() - 1
        }
    };

    provision_router(config, index, modules, env.connector, opts)
}

/// Bring a router already in the store to the current coterie versions
pub fn update(
    config: &mut Config,
    modules: &[CoterieModule],
    env: &mut Environment<'_>,
    opts: &RunOptions,
) -> Result<RunReport> {
    coterie::validate_module_set(modules)?;
    let index = locate_known(config, env.probe, opts)?;
    provision_router(config, index, modules, env.connector, opts)
}

/// Relay lines from `input` to a known router and print the results.
/// Returns the number of commands sent.
pub fn open_shell(
    config: &mut Config,
    env: &mut Environment<'_>,
    opts: &RunOptions,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<usize> {
    let index = locate_known(config, env.probe, opts)?;
    let router = &mut config.routers[index];
    let shell = env
        .connector
        .ssh_with_key(router)?
        .ok_or(BurrowError::KeyRejected { ip: router.ip })?;
    let mut session = adopt(router, shell);

    let prompt = format!("{}# ", router.nickname);
    let mut sent = 0usize;
    let mut line = String::new();
    loop {
        write!(output, "{}", prompt)?;
        output.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command == "exit" || command == "quit" {
            break;
        }

        let result = session.shell().run(command)?;
        sent += 1;
        output.write_all(result.stdout.as_bytes())?;
        output.write_all(result.stderr.as_bytes())?;
        if !result.success() {
            writeln!(output, "[exit {}]", result.status)?;
        }
    }

    session.close()?;
    Ok(sent)
}

/// Save `config` whatever the outcome of the run.
///
/// If both the run and the save fail, the save error is logged and the run
/// error returned.
pub fn persist_after<T>(store: &ConfigStore, config: &Config, outcome: Result<T>) -> Result<T> {
    match (outcome, store.save(config)) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(save_err)) => Err(save_err),
        (Err(run_err), Ok(())) => Err(run_err),
        (Err(run_err), Err(save_err)) => {
            error!(error = %save_err, "Failed to save store after failed run");
            Err(run_err)
        }
    }
}

/// Ask the operator for fleet defaults on a fresh store.
///
/// A blank provider leaves new routers without one. Secret answers are
/// masked in the closing summary.
pub fn prompt_fleet_defaults(
    defaults: &mut FleetDefaults,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<()> {
    writeln!(output, "No router store yet. Choose defaults for new routers.")?;
    writeln!(output, "Providers:")?;
    for provider in registry::PROVIDERS {
        writeln!(
            output,
            "  {:<24} {} ({})",
            provider.id, provider.display_name, provider.website
        )?;
    }

    let answer = ask(input, output, "VPN provider (blank for none): ")?.unwrap_or_default();
    if answer.is_empty() {
        return Ok(());
    }
    let provider =
        registry::provider(&answer).ok_or(BurrowError::UnknownProvider { id: answer.clone() })?;

    let mut summary = Vec::new();
    for field in provider.credentials {
        let value = loop {
            match ask(input, output, &format!("{}: ", field.hint))? {
                Some(value) if value.is_empty() && field.required => {
                    writeln!(output, "A value is required.")?;
                }
                Some(value) => break value,
                None if field.required => {
                    return Err(BurrowError::InvalidConfig {
                        message: format!("no value given for '{}'", field.attribute),
                    });
                }
                None => break String::new(),
            }
        };
        if value.is_empty() {
            continue;
        }
        let shown = if field.secret {
            "*".repeat(8)
        } else {
            value.clone()
        };
        summary.push(format!("{} = {}", field.attribute, shown));
        defaults.attributes.insert(field.attribute.to_string(), value);
    }

    defaults.provider = Some(provider.id.to_string());
    writeln!(output, "Defaults: provider = {}", provider.id)?;
    for line in summary {
        writeln!(output, "  {}", line)?;
    }
    Ok(())
}

fn ask(input: &mut dyn BufRead, output: &mut dyn Write, prompt: &str) -> Result<Option<String>> {
    write!(output, "{}", prompt)?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Build the store record for a newly discovered router
pub fn new_router(
    candidate: &Candidate,
    defaults: &FleetDefaults,
    joined: Option<(String, String)>,
    opts: &RunOptions,
) -> Result<Router> {
    let credentials = GeneratedCredentials::generate()?;
    let (wifi_ssid, wifi_join_password) = match joined {
        Some((ssid, password)) => (Some(ssid), Some(password)),
        None => (None, None),
    };

    Ok(Router {
        ip: candidate.ip,
        mac: candidate.mac.clone(),
        nickname: candidate.nickname(),
        host_key: candidate.host_key.clone(),
        root_password: credentials.root_password,
        wifi_password: credentials.wifi_password,
        wifi_ssid,
        wifi_join_password,
        ssh_public_key: credentials.ssh_public_key,
        ssh_private_key: credentials.ssh_private_key,
        hardware: opts
            .hardware
            .clone()
            .unwrap_or_else(|| defaults.hardware.clone()),
        provider: opts.provider.clone().or_else(|| defaults.provider.clone()),
        attributes: defaults.attributes.clone(),
        coterie_versions: Default::default(),
        connected_via: None,
    })
}

/// Placeholders in `coteries` that cannot be resolved for `router`
pub fn unresolved_placeholders(coteries: &[Coterie], router: &Router) -> Vec<(String, String)> {
    let mut missing = Vec::new();
    for coterie in coteries {
        for name in substituted_text(coterie).iter().flat_map(|text| placeholders(text)) {
            let known = BUILTIN_PLACEHOLDERS.contains(&name.as_str()) || router.attribute(&name).is_some();
            if !known {
                missing.push((coterie.id.clone(), name));
            }
        }
    }
    missing
}

/// The parts of a payload the executor passes through substitution
fn substituted_text(coterie: &Coterie) -> Vec<String> {
    match (coterie.kind, coterie.encoding) {
        (CoterieType::Commands | CoterieType::Exploration | CoterieType::BootstrapAuth, _) => {
            command_lines(&coterie.data)
        }
        (CoterieType::File, Encoding::Text) => vec![coterie.data.clone()],
        (CoterieType::File, Encoding::Base64) | (CoterieType::WifiTable, _) => Vec::new(),
    }
}

fn locate_known(config: &mut Config, probe: &dyn HostProbe, opts: &RunOptions) -> Result<usize> {
    if config.routers.is_empty() {
        return Err(BurrowError::RouterNotKnown {
            message: "the store has no routers; run set-up first".to_string(),
        });
    }
    let located = match opts.router_address {
        Some(ip) => network::locate_at(config, probe, ip)?,
        None => network::locate(config, probe)?,
    };
    match located {
        Located::Existing(index) => Ok(index),
        Located::New(candidate) => Err(BurrowError::RouterNotKnown {
            message: format!("{} is not in the store; run set-up", candidate.label()),
        }),
    }
}

fn provision_router(
    config: &mut Config,
    index: usize,
    modules: &[CoterieModule],
    connector: &dyn Connector,
    opts: &RunOptions,
) -> Result<RunReport> {
    let settings = config.settings.clone();
    let router = &mut config.routers[index];
    if let Some(hardware) = &opts.hardware {
        router.hardware = hardware.clone();
    }
    if let Some(provider) = &opts.provider {
        router.provider = Some(provider.clone());
    }

    let selected = coterie::select(modules, &router.hardware, router.provider.as_deref())?;
    let elected = coterie::elect(&selected)?;
    if let Some((coterie, name)) = unresolved_placeholders(&elected, router).into_iter().next() {
        return Err(BurrowError::UnresolvedPlaceholder { coterie, name });
    }

    let mut session = connect(router, connector, &settings, opts, &elected)?;
    let executor = CoterieExecutor::new(opts.dry_run);
    let report = executor.execute_all(&elected, router, session.shell());
    if let Err(e) = session.close() {
        warn!(error = %e, "Failed to close session");
    }
    report
}

/// Open a key-authenticated session, bootstrapping the router if needed
fn connect(
    router: &mut Router,
    connector: &dyn Connector,
    settings: &Settings,
    opts: &RunOptions,
    elected: &[Coterie],
) -> Result<SessionGuard> {
    if let Some(shell) = connector.ssh_with_key(router)? {
        return Ok(adopt(router, shell));
    }

    if opts.dry_run {
        return Err(BurrowError::Session {
            message: format!(
                "{} does not accept our key yet; bootstrapping is skipped in a dry run",
                router.label()
            ),
        });
    }

    info!(router = %router.label(), "Key not accepted; bootstrapping");
    let pending: Vec<&Coterie> = elected
        .iter()
        .filter(|c| c.kind == CoterieType::BootstrapAuth)
        .collect();
    BootstrapAuthenticator::new(connector, settings.bootstrap_max_cycles, opts.verbosity)
        .bootstrap(router, &pending)?;

    let shell = connector
        .ssh_with_key(router)?
        .ok_or(BurrowError::KeyRejected { ip: router.ip })?;
    Ok(adopt(router, shell))
}

fn adopt(router: &mut Router, shell: Box<dyn RemoteShell>) -> SessionGuard {
    let session = SessionGuard::new(shell);
    router.connected_via = Some(session.transport());
    if router.host_key.is_none() {
        router.host_key = session.host_key().map(str::to_string);
    }
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_router;
    use crate::coterie::{load_modules, ModuleSource};

    #[test]
    fn test_new_router_takes_defaults() {
        let candidate = Candidate {
            ip: Ipv4Addr::new(192, 168, 8, 1),
            mac: "94:83:c4:00:00:01".to_string(),
            host_key: Some("SHA256:k".to_string()),
        };
        let mut defaults = FleetDefaults::default();
        defaults.provider = Some("mullvad".to_string());
        defaults
            .attributes
            .insert("vpn_account".to_string(), "1234".to_string());

        let router = new_router(
            &candidate,
            &defaults,
            Some(("GL-AR300M-001".to_string(), "goodlife".to_string())),
            &RunOptions::default(),
        )
        .unwrap();

        assert_eq!(router.nickname, "GL.iNet 00:01");
        assert_eq!(router.hardware, "gl-ar300m");
        assert_eq!(router.provider.as_deref(), Some("mullvad"));
        assert_eq!(router.attribute("vpn_account").as_deref(), Some("1234"));
        assert_eq!(router.wifi_join_password.as_deref(), Some("goodlife"));
        assert_eq!(router.root_password.len(), 16);
        assert!(router.coterie_versions.is_empty());
    }

    #[test]
    fn test_unresolved_provider_credentials_found() {
        let modules = load_modules(&ModuleSource::Builtin).unwrap();
        let selected = coterie::select(&modules, "gl-ar300m", Some("mullvad")).unwrap();
        let elected = coterie::elect(&selected).unwrap();

        let mut router = sample_router();
        let missing = unresolved_placeholders(&elected, &router);
        assert_eq!(
            missing,
            vec![("mullvad-account".to_string(), "vpn_account".to_string())]
        );

        router
            .attributes
            .insert("vpn_account".to_string(), "1234".to_string());
        assert!(unresolved_placeholders(&elected, &router).is_empty());
    }

    fn coterie_fixture(id: &str, kind: CoterieType) -> Coterie {
        Coterie {
            id: id.to_string(),
            version: coterie::VersionDelta { from: 0, to: 1 },
            sort: 10,
            kind,
            data: String::new(),
            dest: Some("/tmp/blob".to_string()),
            mode: None,
            encoding: Encoding::Text,
            module: "test".to_string(),
        }
    }

    #[test]
    fn test_placeholder_in_comment_not_required() {
        let router = sample_router();
        let mut commented = coterie_fixture("dns1", CoterieType::Commands);
        commented.data = "# set {vpn_account} later\nuci commit dhcp\n".to_string();
        let mut encoded = coterie_fixture("blob", CoterieType::File);
        encoded.encoding = Encoding::Base64;
        encoded.data = "e3Zwbl9hY2NvdW50fQ==".to_string();
        let mut live = coterie_fixture("acct", CoterieType::BootstrapAuth);
        live.data = "-echo {vpn_account}\n".to_string();

        let missing = unresolved_placeholders(&[commented, encoded, live], &router);
        assert_eq!(missing, vec![("acct".to_string(), "vpn_account".to_string())]);
    }

    #[test]
    fn test_persist_after_keeps_run_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(temp_dir.path());
        let config = Config::default();

        let outcome: Result<()> = Err(BurrowError::NoCandidates);
        let err = persist_after(&store, &config, outcome).unwrap_err();
        assert!(matches!(err, BurrowError::NoCandidates));
        assert!(store.path().exists());
    }

    #[test]
    fn test_prompt_fleet_defaults() {
        let mut defaults = FleetDefaults::default();
        let mut input = std::io::Cursor::new("privateinternetaccess\np1234567\n\nsecret\n\n");
        let mut output = Vec::new();
        prompt_fleet_defaults(&mut defaults, &mut input, &mut output).unwrap();

        assert_eq!(defaults.provider.as_deref(), Some("privateinternetaccess"));
        assert_eq!(defaults.attributes["vpn_user"], "p1234567");
        assert_eq!(defaults.attributes["vpn_password"], "secret");
        assert!(!defaults.attributes.contains_key("vpn_comment"));

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("A value is required."));
        assert!(shown.contains("vpn_password = ********"));
        assert!(!shown.contains("= secret"));
    }

    #[test]
    fn test_prompt_blank_provider() {
        let mut defaults = FleetDefaults::default();
        let mut input = std::io::Cursor::new("\n");
        prompt_fleet_defaults(&mut defaults, &mut input, &mut Vec::new()).unwrap();
        assert_eq!(defaults, FleetDefaults::default());
    }

    #[test]
    fn test_prompt_unknown_provider() {
        let mut defaults = FleetDefaults::default();
        let mut input = std::io::Cursor::new("nordish\n");
        let err = prompt_fleet_defaults(&mut defaults, &mut input, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, BurrowError::UnknownProvider { id } if id == "nordish"));
    }
}
