// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coterie modules: loading, election and execution
//!
//! A hardware module plus at most one provider module are elected for each
//! router. Their coteries are merged and run in `sort` order.

pub mod executor;
pub mod parser;
pub mod substitute;

pub use executor::{CoterieExecutor, CoterieOutcome, CoterieResult, RunReport};
pub use parser::{Coterie, CoterieModule, CoterieType, Encoding, ModuleKind, Protocol, VersionDelta};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BurrowError, Result};
use crate::registry;

/// Where coterie modules come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Modules compiled into the binary
    Builtin,
    /// Every `*.toml` file in a directory
    Directory(PathBuf),
}

impl ModuleSource {
    pub fn from_dir(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => ModuleSource::Directory(dir.to_path_buf()),
            None => ModuleSource::Builtin,
        }
    }
}

/// Load and validate every module from `source`
pub fn load_modules(source: &ModuleSource) -> Result<Vec<CoterieModule>> {
    let modules = match source {
        ModuleSource::Builtin => registry::BUILTIN_MODULES
            .iter()
            .map(|m| CoterieModule::from_source(m.id, m.source))
            .collect::<Result<Vec<_>>>()?,
        ModuleSource::Directory(dir) => {
            let names = list_modules(dir)?;
            if names.is_empty() {
                return Err(BurrowError::ModuleNotFound {
                    id: format!("{}/*.toml", dir.display()),
                });
            }
            names
                .iter()
                .map(|name| CoterieModule::from_file(dir.join(format!("{}.toml", name))))
                .collect::<Result<Vec<_>>>()?
        }
    };
    debug!(count = modules.len(), "Loaded coterie modules");
    Ok(modules)
}

/// List module ids (file stems) in a directory
pub fn list_modules<P: AsRef<Path>>(dir: P) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let mut modules = Vec::new();

    if !dir.exists() {
        return Ok(modules);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            if let Some(stem) = path.file_stem() {
                modules.push(stem.to_string_lossy().to_string());
            }
        }
    }

    modules.sort();
    Ok(modules)
}

/// Pick the hardware module and the optional provider module for a router
pub fn select<'m>(
    modules: &'m [CoterieModule],
    hardware: &str,
    provider: Option<&str>,
) -> Result<Vec<&'m CoterieModule>> {
    let hardware_module = modules
        .iter()
        .find(|m| m.kind == ModuleKind::Hardware && m.id == hardware)
        .ok_or_else(|| BurrowError::ModuleNotFound {
            id: hardware.to_string(),
        })?;
    let mut selected = vec![hardware_module];

    if let Some(provider) = provider {
        if registry::provider(provider).is_none() {
            return Err(BurrowError::UnknownProvider {
                id: provider.to_string(),
            });
        }
        let provider_module = modules
            .iter()
            .find(|m| m.kind == ModuleKind::Provider && m.provider.as_deref() == Some(provider))
            .ok_or_else(|| BurrowError::ModuleNotFound {
                id: provider.to_string(),
            })?;
        selected.push(provider_module);
    }

    Ok(selected)
}

/// Merge the coteries of `modules` into one list in `sort` order.
///
/// Ties keep module order, then declaration order.
pub fn elect(modules: &[&CoterieModule]) -> Result<Vec<Coterie>> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for module in modules {
        for coterie in &module.coteries {
            if let Some(first) = owners.insert(&coterie.id, &module.id) {
                return Err(BurrowError::DuplicateCoterie {
                    id: coterie.id.clone(),
                    first: first.to_string(),
                    second: module.id.clone(),
                });
            }
        }
    }

    let mut elected: Vec<Coterie> = modules
        .iter()
        .flat_map(|m| m.coteries.iter().cloned())
        .collect();
    elected.sort_by_key(|c| c.sort);
    Ok(elected)
}

/// Check that every hardware module elects cleanly alone and with every
/// provider module. Returns the number of combinations checked.
pub fn validate_module_set(modules: &[CoterieModule]) -> Result<usize> {
    let hardware: Vec<&CoterieModule> = modules
        .iter()
        .filter(|m| m.kind == ModuleKind::Hardware)
        .collect();
    let providers: Vec<&CoterieModule> = modules
        .iter()
        .filter(|m| m.kind == ModuleKind::Provider)
        .collect();

    if hardware.is_empty() {
        return Err(BurrowError::ModuleNotFound {
            id: "(any hardware module)".to_string(),
        });
    }

    let mut combinations = 0usize;
    for hw in &hardware {
        elect(&[*hw])?;
        combinations += 1;
        for provider in &providers {
            elect(&[*hw, *provider])?;
            combinations += 1;
        }
    }
    Ok(combinations)
}
