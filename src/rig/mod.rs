//! Rig discovery.
//!
//! Rigs are listed in `town.kdl`; their rosters come from the filesystem:
//!
//! ```text
//! <rig>/
//!   .beads/          rig bead store
//!   polecats/<name>/ one directory per worker
//!   crew/<name>/     one directory per crew member
//!   witness/         present when the rig has a witness
//!   refinery/        present when the rig has a refinery
//! ```
//!
//! Discovery runs fresh on every status build; nothing is cached.

use crate::config::TownConfig;
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A discovered rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rig {
    pub name: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub polecats: Vec<String>,
    pub crew: Vec<String>,
    pub has_witness: bool,
    pub has_refinery: bool,
}

/// Discovers the rigs of a town.
#[derive(Debug, Clone)]
pub struct RigManager<'a> {
    town_root: &'a Path,
    config: &'a TownConfig,
}

impl<'a> RigManager<'a> {
    pub fn new(town_root: &'a Path, config: &'a TownConfig) -> Self {
        Self { town_root, config }
    }

    /// Probe every configured rig, in configuration order.
    ///
    /// A configured rig whose directory is missing fails the whole discovery.
    pub fn discover_rigs(&self) -> Result<Vec<Rig>> {
        self.config
            .rigs
            .iter()
            .map(|entry| {
                let path = entry.resolve_path(self.town_root);
                if !path.is_dir() {
                    return Err(Error::Discovery(format!(
                        "rig {} not found at {}",
                        entry.name,
                        path.display()
                    )));
                }
                Ok(Rig {
                    name: entry.name.clone(),
                    polecats: list_subdirs(&path.join("polecats"))?,
                    crew: list_subdirs(&path.join("crew"))?,
                    has_witness: path.join("witness").is_dir(),
                    has_refinery: path.join("refinery").is_dir(),
                    prefix: entry.prefix.clone(),
                    path,
                })
            })
            .collect()
    }
}

/// Sorted names of the visible subdirectories; empty when `dir` is missing.
fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Discovery(format!("{}: {}", dir.display(), e)));
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::Discovery(format!("{}: {}", dir.display(), e)))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
