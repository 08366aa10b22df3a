//! Data models for town entities.
//!
//! This module defines the core data structures:
//! - `Issue` - A bead: the persisted unit of work tracking
//! - `Dependency` - Typed edge from one issue to another (`tracks`, `blocks`, ...)
//! - `IssueStatus` - Workflow status of an issue
//! - `AgentRole` - The role an agent plays in the town
//!
//! Some issue attributes (hook bead, agent state, attached molecule) are not
//! always stored as first-class fields. The [`fields`] module resolves them
//! from the description text when the first-class field is absent.

pub mod fields;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use fields::DescriptionFields;

/// Issue type for convoys.
pub const TYPE_CONVOY: &str = "convoy";

/// Issue type for agent beads.
pub const TYPE_AGENT: &str = "agent";

/// Dependency type used by convoys to track member issues.
pub const DEP_TRACKS: &str = "tracks";

/// Issue status in the workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Hooked,
    /// Long-lived record such as a handoff bead
    Pinned,
    Deferred,
    Closed,
    #[serde(other)]
    Unknown,
}

impl IssueStatus {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "hooked" => Some(Self::Hooked),
            "pinned" => Some(Self::Pinned),
            "deferred" => Some(Self::Deferred),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Hooked => "hooked",
            Self::Pinned => "pinned",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Target issue ID (may be an `external:<rig>:<id>` reference)
    pub id: String,

    /// Edge type (e.g., "tracks", "blocks")
    #[serde(default)]
    pub dependency_type: String,
}

/// A bead tracked by an issue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Store-prefixed identifier (e.g., "gt-42")
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: IssueStatus,

    /// Issue type ("task", "convoy", "agent", ...)
    #[serde(rename = "issue_type", alias = "type", default = "default_issue_type")]
    pub issue_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Plain dependency IDs, used when typed edges are not available
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,

    /// Hook bead of an agent bead, when stored as a first-class field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_bead: Option<String>,

    /// Free-form lifecycle state of an agent bead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<String>,

    /// Molecule attached to a pinned handoff bead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_molecule: Option<String>,
}

fn default_issue_type() -> String {
    "task".to_string()
}

impl Issue {
    /// Create a new open issue with the given ID and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: IssueStatus::Open,
            issue_type: default_issue_type(),
            assignee: None,
            created_at: Some(Utc::now()),
            closed_at: None,
            close_reason: None,
            dependencies: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            hook_bead: None,
            agent_state: None,
            attached_molecule: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == IssueStatus::Closed
    }

    pub fn is_convoy(&self) -> bool {
        self.issue_type == TYPE_CONVOY
    }

    fn fields(&self) -> DescriptionFields {
        DescriptionFields::parse(&self.description)
    }

    /// Hook bead ID of an agent bead.
    pub fn hook_bead(&self) -> Option<String> {
        fields::resolve(self.hook_bead.as_deref(), &self.fields(), "hook_bead")
    }

    /// Lifecycle state of an agent bead.
    pub fn agent_state(&self) -> Option<String> {
        fields::resolve(self.agent_state.as_deref(), &self.fields(), "agent_state")
    }

    /// Molecule attached to a pinned bead.
    pub fn attached_molecule(&self) -> Option<String> {
        fields::resolve(
            self.attached_molecule.as_deref(),
            &self.fields(),
            "attached_molecule",
        )
    }

    /// Address of the agent an agent bead describes.
    pub fn agent_address(&self) -> Option<String> {
        fields::resolve(self.assignee.as_deref(), &self.fields(), "address")
    }

    /// IDs tracked by a convoy.
    ///
    /// Uses `tracks` edges when present (unwrapping `external:<rig>:<id>`
    /// references), otherwise the plain `depends_on` list.
    pub fn tracked_ids(&self) -> Vec<String> {
        let tracked: Vec<String> = self
            .dependencies
            .iter()
            .filter(|dep| dep.dependency_type == DEP_TRACKS)
            .map(|dep| unwrap_external_ref(&dep.id).to_string())
            .collect();

        if tracked.is_empty() {
            self.depends_on.clone()
        } else {
            tracked
        }
    }
}

/// Strip an `external:<rig>:<id>` reference down to `<id>`.
pub fn unwrap_external_ref(id: &str) -> &str {
    if let Some(rest) = id.strip_prefix("external:") {
        if let Some((_, issue_id)) = rest.split_once(':') {
            return issue_id;
        }
    }
    id
}

/// Extract the prefix from an issue ID (e.g., "gt" from "gt-abc123").
///
/// Only prefixes of one to three characters are recognized.
pub fn id_prefix(id: &str) -> Option<&str> {
    match id.find('-') {
        Some(idx) if (1..=3).contains(&idx) => Some(&id[..idx]),
        _ => None,
    }
}

/// The role an agent plays in the town.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Town-wide supervisor
    Mayor,
    /// Town-wide watcher
    Deacon,
    /// Ephemeral per-rig worker
    Polecat,
    /// Long-lived per-rig worker
    Crew,
    /// Per-rig worker watcher
    Witness,
    /// Per-rig merge processor
    Refinery,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Mayor => "mayor",
            AgentRole::Deacon => "deacon",
            AgentRole::Polecat => "polecat",
            AgentRole::Crew => "crew",
            AgentRole::Witness => "witness",
            AgentRole::Refinery => "refinery",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
