//! KDL schema for `mayor/town.kdl`.
//!
//! # KDL Schema
//!
//! ```kdl
//! name "gastown"
//! overseer name="Ada" email="ada@example.com" username="ada"
//! rig "acme" path="acme" prefix="ac"
//! rig "infra"
//! serve host="127.0.0.1" port=8080 poll-interval=3
//! ```
//!
//! Unknown nodes are ignored for forward compatibility.

use crate::{Error, Result};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A configured rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigEntry {
    pub name: String,

    /// Rig directory; relative paths are resolved against the town root
    pub path: Option<PathBuf>,

    /// Issue ID prefix of the rig's bead store (e.g., "ac")
    pub prefix: Option<String>,
}

impl RigEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            prefix: None,
        }
    }

    /// Absolute rig directory for a town root.
    pub fn resolve_path(&self, town_root: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => town_root.join(path),
            None => town_root.join(&self.name),
        }
    }
}

/// The human supervising the town.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverseerConfig {
    pub name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl OverseerConfig {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.username.is_none()
    }
}

/// `serve` block values. All optional; resolution fills in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub poll_interval_secs: Option<u64>,
}

/// Parsed `town.kdl`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TownConfig {
    pub name: Option<String>,
    pub overseer: Option<OverseerConfig>,
    pub rigs: Vec<RigEntry>,
    pub serve: ServeConfig,
}

impl TownConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from KDL source text.
    pub fn parse(source: &str) -> Result<Self> {
        let doc: KdlDocument = source
            .parse()
            .map_err(|e| Error::Config(format!("failed to parse town.kdl: {}", e)))?;
        Self::from_kdl(&doc)
    }

    /// Parse config from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self> {
        let mut config = Self::new();

        for node in doc.nodes() {
            match node.name().value() {
                "name" => {
                    config.name = first_string_arg(node);
                }
                "overseer" => {
                    let overseer = OverseerConfig {
                        name: string_prop(node, "name"),
                        email: string_prop(node, "email"),
                        username: string_prop(node, "username"),
                    };
                    if !overseer.is_empty() {
                        config.overseer = Some(overseer);
                    }
                }
                "rig" => {
                    let name = first_string_arg(node).ok_or_else(|| {
                        Error::Config("rig node must have a name argument".to_string())
                    })?;
                    if config.rigs.iter().any(|r| r.name == name) {
                        return Err(Error::Config(format!("duplicate rig: {}", name)));
                    }
                    config.rigs.push(RigEntry {
                        name,
                        path: string_prop(node, "path").map(PathBuf::from),
                        prefix: string_prop(node, "prefix"),
                    });
                }
                "serve" => {
                    config.serve = ServeConfig {
                        host: string_prop(node, "host"),
                        port: int_prop(node, "port")
                            .map(|p| {
                                u16::try_from(p).map_err(|_| {
                                    Error::Config(format!("serve port out of range: {}", p))
                                })
                            })
                            .transpose()?,
                        poll_interval_secs: int_prop(node, "poll-interval")
                            .map(|s| {
                                u64::try_from(s).map_err(|_| {
                                    Error::Config(format!("poll-interval must be positive: {}", s))
                                })
                            })
                            .transpose()?,
                    };
                }
                _ => {
                    // Ignore unknown nodes
                }
            }
        }

        Ok(config)
    }

    /// Rig whose issue prefix matches.
    pub fn rig_for_prefix(&self, prefix: &str) -> Option<&RigEntry> {
        self.rigs
            .iter()
            .find(|rig| rig.prefix.as_deref() == Some(prefix))
    }
}

/// First positional string argument of a node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn prop<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(|e| e.value())
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    prop(node, key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn int_prop(node: &KdlNode, key: &str) -> Option<i128> {
    prop(node, key).and_then(|v| v.as_integer())
}
