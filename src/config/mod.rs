//! Town configuration.
//!
//! ## mayor/town.kdl
//!
//! Lives in the `mayor/` directory of the town root and lists the rigs, the
//! overseer, and `gt serve` settings. See [`schema`] for the format.
//!
//! ## Town root
//!
//! `--town` flag > `GT_TOWN_ROOT` env > nearest ancestor of the current
//! directory containing `mayor/town.kdl` > current directory.
//!
//! ## Soft loading
//!
//! Status builds never fail because of configuration: a missing or broken
//! `town.kdl` is logged and replaced by a default config.
//!
//! Use the [`resolver`] module for precedence resolution of serve settings.

pub mod resolver;
pub mod schema;

pub use resolver::{
    Resolved, ServeOverrides, ServeSettings, ValueSource, resolve_overseer, resolve_serve,
};
pub use schema::{OverseerConfig, RigEntry, ServeConfig, TownConfig};

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Environment variable naming the town root.
pub const TOWN_ROOT_ENV: &str = "GT_TOWN_ROOT";

/// Path of `town.kdl` relative to the town root.
pub fn town_config_path(town_root: &Path) -> PathBuf {
    town_root.join("mayor").join("town.kdl")
}

/// Resolve the town root.
pub fn find_town_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(TOWN_ROOT_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(find_town_root_from(&cwd).unwrap_or(cwd))
}

/// Nearest ancestor of `start` (inclusive) containing `mayor/town.kdl`.
pub fn find_town_root_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| town_config_path(dir).is_file())
        .map(Path::to_path_buf)
}

/// Load `town.kdl`. A missing file is an empty config.
pub fn load_town_config(town_root: &Path) -> Result<TownConfig> {
    let path = town_config_path(town_root);
    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(default_town_config(town_root));
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )));
        }
    };

    let mut config = TownConfig::parse(&source)?;
    if config.name.is_none() {
        config.name = default_town_config(town_root).name;
    }
    Ok(config)
}

/// Load `town.kdl`, falling back to a default config on any error.
pub fn load_town_config_soft(town_root: &Path) -> TownConfig {
    match load_town_config(town_root) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(town = %town_root.display(), error = %e, "using default town config");
            default_town_config(town_root)
        }
    }
}

/// Config with the town directory's basename as its name and no rigs.
pub fn default_town_config(town_root: &Path) -> TownConfig {
    TownConfig {
        name: town_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        ..TownConfig::default()
    }
}
