// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk configuration store
//!
//! The store is one TOML file of tagged records: a `config` record at the top
//! level with `router` records under `routers`. It holds router passwords and
//! private keys, so it is only ever written with mode 0600.
//!
//! Saving writes a temporary file, copies the current file to `.bak`, then
//! renames the temporary file into place. A crash at any point leaves either
//! the old or the new store intact.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{Config, Router};
use crate::document::{self, Tag};
use crate::error::{BurrowError, Result};

/// Store file name inside the store directory
pub const STORE_FILE: &str = "bitburrow.toml";

const APP_DIR: &str = "bitburrow";
const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;
const HEADER: &str = "# BitBurrow router store. Contains passwords and private keys.\n";

/// A loaded configuration
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    /// No store existed (or it was empty); defaults were used
    pub fresh: bool,
}

/// Reads and writes the store file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Store under the user's configuration directory
    pub fn default_location() -> Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| BurrowError::InvalidConfig {
            message: "cannot determine the user configuration directory; use --state-dir"
                .to_string(),
        })?;
        Ok(Self::new(base.join(APP_DIR)))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(format!("{}.bak", STORE_FILE))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", STORE_FILE))
    }

    /// Load the store. A missing or empty file yields a fresh default config.
    pub fn load(&self) -> Result<Loaded> {
        let path = self.path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if text.trim().is_empty() {
            debug!(path = %path.display(), "No store; starting fresh");
            return Ok(Loaded {
                config: Config::default(),
                fresh: true,
            });
        }

        let config = decode_config(&text).map_err(|e| BurrowError::StoreParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        debug!(path = %path.display(), routers = config.routers.len(), "Loaded store");

        Ok(Loaded {
            config,
            fresh: false,
        })
    }

    /// Atomically replace the store with `config`, keeping the previous
    /// version as `.bak`
    pub fn save(&self, config: &Config) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)?;

        let text = encode_config(config)?;
        let path = self.path();
        let temp = self.temp_path();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&temp)?;
        // mode() only applies when the file is created; a stale temp keeps its own
        file.set_permissions(fs::Permissions::from_mode(FILE_MODE))?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if path.exists() {
            let backup = self.backup_path();
            fs::copy(&path, &backup)?;
            fs::set_permissions(&backup, fs::Permissions::from_mode(FILE_MODE))?;
        }

        fs::rename(&temp, &path)?;
        info!(path = %path.display(), routers = config.routers.len(), "Saved store");
        Ok(())
    }
}

/// Serialize a config and its routers as tagged TOML
pub fn encode_config(config: &Config) -> Result<String> {
    let mut table = document::encode(config, Tag::Config)?;
    let routers = config
        .routers
        .iter()
        .map(|r| document::encode(r, Tag::Router).map(toml::Value::Table))
        .collect::<Result<Vec<_>>>()?;
    if !routers.is_empty() {
        table.insert("routers".to_string(), toml::Value::Array(routers));
    }
    Ok(format!("{}{}", HEADER, toml::to_string_pretty(&table)?))
}

/// Parse tagged TOML into a config
pub fn decode_config(text: &str) -> Result<Config> {
    let mut table = document::parse_table(text)?;
    let records = document::take_records(&mut table, "routers")?;
    let mut config: Config = document::decode(table, Tag::Config)?;
    config.routers = records
        .into_iter()
        .map(|record| document::decode::<Router>(record, Tag::Router))
        .collect::<Result<Vec<_>>>()?;
    Ok(config)
}
