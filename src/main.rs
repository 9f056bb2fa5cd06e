// SPDX-License-Identifier: AGPL-3.0-or-later
//! BitBurrow: provision a consumer router as a VPN gateway
//!
//! Command line front end over the `bitburrow` library.

use std::io::{self, IsTerminal};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bitburrow::coterie::{self, ModuleSource, RunReport};
use bitburrow::network::SystemProbe;
use bitburrow::provision::{self, Environment, RunOptions};
use bitburrow::remote::ssh::SystemConnector;
use bitburrow::store::{ConfigStore, Loaded};
use bitburrow::wifi::NmcliBackend;
use bitburrow::{registry, selfcheck, Config};

/// BitBurrow: router provisioning
///
/// Finds a router, takes it over from factory state, and keeps its
/// configuration coteries at their current versions.
#[derive(Parser, Debug)]
#[command(name = "bitburrow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Directory holding the router store
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Load coterie modules from this directory
    #[arg(long, global = true)]
    modules: Option<PathBuf>,

    /// Log what would be sent without sending it or saving anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find a new or known router and bring it up to date
    #[command(alias = "setup")]
    SetUp {
        /// Router address; skips WiFi and network discovery
        #[arg(long)]
        router_address: Option<Ipv4Addr>,

        /// VPN provider id
        #[arg(long)]
        provider: Option<String>,

        /// Hardware module id
        #[arg(long)]
        hardware: Option<String>,
    },

    /// Bring a known router up to date
    Update {
        /// Router address; skips network discovery
        #[arg(long)]
        router_address: Option<Ipv4Addr>,
    },

    /// Relay commands to a known router
    Shell {
        /// Router address; skips network discovery
        #[arg(long)]
        router_address: Option<Ipv4Addr>,
    },

    /// Validate coterie modules and run offline fixtures
    Check,

    /// List supported VPN providers
    Providers,

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides `-v`
fn init_logging(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(verbosity >= 2)
            .with_writer(io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init(),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Version => {
            println!("BitBurrow v{}", env!("CARGO_PKG_VERSION"));
            println!("Router provisioning for VPN gateways");
            Ok(())
        }

        Commands::Providers => list_providers(cli.format),

        Commands::Check => run_check(&cli),

        Commands::SetUp {
            router_address,
            ref provider,
            ref hardware,
        } => {
            if let Some(id) = provider {
                anyhow::ensure!(
                    registry::provider(id).is_some(),
                    "unknown provider '{}' (see `bitburrow providers`)",
                    id
                );
            }
            let opts = RunOptions {
                verbosity: cli.verbose,
                dry_run: cli.dry_run,
                router_address,
                provider: provider.clone(),
                hardware: hardware.clone(),
            };
            run_provisioning(&cli, &opts, Operation::SetUp)
        }

        Commands::Update { router_address } => {
            let opts = RunOptions {
                verbosity: cli.verbose,
                dry_run: cli.dry_run,
                router_address,
                ..RunOptions::default()
            };
            run_provisioning(&cli, &opts, Operation::Update)
        }

        Commands::Shell { router_address } => {
            let opts = RunOptions {
                verbosity: cli.verbose,
                router_address,
                ..RunOptions::default()
            };
            run_shell(&cli, &opts)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    SetUp,
    Update,
}

fn open_store(state_dir: Option<&Path>) -> anyhow::Result<(ConfigStore, Loaded)> {
    let store = match state_dir {
        Some(dir) => ConfigStore::new(dir),
        None => ConfigStore::default_location()?,
    };
    let loaded = store
        .load()
        .with_context(|| format!("Failed to load store {}", store.path().display()))?;
    debug!(path = %store.path().display(), fresh = loaded.fresh, "Store opened");
    Ok((store, loaded))
}

fn module_source(cli: &Cli, config: &Config) -> ModuleSource {
    ModuleSource::from_dir(cli.modules.as_deref().or(config.settings.module_dir.as_deref()))
}

/// Fleet defaults are only asked for interactively
fn ask_defaults_if_fresh(config: &mut Config, fresh: bool) -> anyhow::Result<()> {
    if !fresh || !io::stdin().is_terminal() {
        return Ok(());
    }
    let stdin = io::stdin();
    provision::prompt_fleet_defaults(&mut config.defaults, &mut stdin.lock(), &mut io::stderr())
        .context("Failed to set fleet defaults")
}

fn run_provisioning(cli: &Cli, opts: &RunOptions, operation: Operation) -> anyhow::Result<()> {
    let (store, Loaded { mut config, fresh }) = open_store(cli.state_dir.as_deref())?;
    ask_defaults_if_fresh(&mut config, fresh)?;

    let source = module_source(cli, &config);
    let modules = coterie::load_modules(&source).context("Failed to load coterie modules")?;

    let probe = SystemProbe::new(Duration::from_secs(config.settings.connect_timeout_secs));
    let connector = SystemConnector::new(&config.settings);
    let mut wifi = NmcliBackend::new();
    let mut env = Environment {
        probe: &probe,
        wifi: &mut wifi,
        connector: &connector,
    };

    let outcome = match operation {
        Operation::SetUp => provision::set_up(&mut config, &modules, &mut env, opts),
        Operation::Update => provision::update(&mut config, &modules, &mut env, opts),
    };
    let report = if opts.dry_run {
        outcome
    } else {
        provision::persist_after(&store, &config, outcome)
    }?;

    print_report(&report, cli.format)
}

fn run_shell(cli: &Cli, opts: &RunOptions) -> anyhow::Result<()> {
    let (store, Loaded { mut config, .. }) = open_store(cli.state_dir.as_deref())?;

    let probe = SystemProbe::new(Duration::from_secs(config.settings.connect_timeout_secs));
    let connector = SystemConnector::new(&config.settings);
    let mut wifi = NmcliBackend::new();
    let mut env = Environment {
        probe: &probe,
        wifi: &mut wifi,
        connector: &connector,
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let outcome = provision::open_shell(
        &mut config,
        &mut env,
        opts,
        &mut stdin.lock(),
        &mut stdout.lock(),
    );
    let sent = provision::persist_after(&store, &config, outcome)?;
    info!(commands = sent, "Shell closed");
    Ok(())
}

fn run_check(cli: &Cli) -> anyhow::Result<()> {
    let source = match &cli.modules {
        Some(dir) => ModuleSource::Directory(dir.clone()),
        None => {
            let (_, loaded) = open_store(cli.state_dir.as_deref())?;
            module_source(cli, &loaded.config)
        }
    };
    let modules = coterie::load_modules(&source).context("Failed to load coterie modules")?;
    let report = selfcheck::run(&modules).context("Module validation failed")?;

    match cli.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    report.ensure_passed()?;
    Ok(())
}

fn print_report(report: &RunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct ProviderEntry {
    id: &'static str,
    display_name: &'static str,
    website: &'static str,
    url: &'static str,
    credentials: Vec<&'static str>,
}

fn list_providers(format: OutputFormat) -> anyhow::Result<()> {
    let entries: Vec<ProviderEntry> = registry::PROVIDERS
        .iter()
        .map(|p| ProviderEntry {
            id: p.id,
            display_name: p.display_name,
            website: p.website,
            url: p.url,
            credentials: p.credentials.iter().map(|c| c.attribute).collect(),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            println!("Supported providers:");
            println!();
            for entry in &entries {
                println!("  {:<24} {} ({})", entry.id, entry.display_name, entry.website);
            }
        }
    }
    Ok(())
}
