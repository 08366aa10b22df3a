//! Gas Town dashboard - live observability and consistency checks for a town
//! of coding agents.
//!
//! This library provides the core functionality for the `gt` CLI tool:
//! aggregating agent sessions, beads, and mail into one town snapshot,
//! detecting and broadcasting agent state changes, and auditing the bead
//! stores for structural invariant violations.

pub mod cli;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod mail;
pub mod models;
pub mod rig;
pub mod status;
pub mod storage;
pub mod tmux;
pub mod townlog;
#[cfg(feature = "web")]
pub mod web;


/// Library-level error type for town operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Rig discovery failed; fatal to a status build.
    #[error("Discovering rigs: {0}")]
    Discovery(String),

    #[error("Session registry error: {0}")]
    Session(String),

    #[error("Bead store error: {0}")]
    Store(String),

    /// The partition has no `.beads` directory.
    #[error("Bead store error: not a beads directory: {}", .0.display())]
    NoStore(std::path::PathBuf),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias for town operations.
pub type Result<T> = std::result::Result<T, Error>;
