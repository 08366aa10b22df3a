//! Convoy progress.
//!
//! Convoys live in the town bead store. Their tracked issues may live in any
//! partition, so member lookups are routed:
//!
//! 1. one `show_batch` on the town store;
//! 2. each miss whose ID prefix matches a rig's configured `prefix` is looked
//!    up with one `show_batch` per rig;
//! 3. any remaining miss gets a single `show` on the town store.
//!
//! Unresolved members never count as completed.

use crate::config::TownConfig;
use crate::models::{Issue, IssueStatus, TYPE_CONVOY, id_prefix};
use crate::storage::{IssueStore, ListFilter, StoreProvider};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// A convoy and its progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvoyInfo {
    pub id: String,
    pub name: String,
    pub status: IssueStatus,
    pub tracked_ids: Vec<String>,
    /// Completed fraction in `0.0..=1.0`; 1.0 for an empty convoy
    pub progress: f64,
    pub completed: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<ConvoyMember>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<ConvoyBlocker>>,
}

/// An issue tracked by a convoy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvoyMember {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Last path segment of the assignee
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl ConvoyMember {
    fn missing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: "(not found)".to_string(),
            status: "unknown".to_string(),
            issue_type: None,
            assignee: None,
            agent_name: None,
        }
    }

    fn from_issue(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            title: issue.title.clone(),
            status: issue.status.to_string(),
            issue_type: Some(issue.issue_type.clone()),
            assignee: issue.assignee.clone(),
            agent_name: issue
                .assignee
                .as_deref()
                .and_then(|a| a.rsplit('/').next())
                .map(str::to_string),
        }
    }
}

/// A member held up by another issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvoyBlocker {
    pub id: String,
    pub title: String,
    pub blocked_by: String,
}

/// Which convoys to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvoyStatusFilter {
    All,
    Status(IssueStatus),
}

impl Default for ConvoyStatusFilter {
    fn default() -> Self {
        Self::Status(IssueStatus::Open)
    }
}

impl ConvoyStatusFilter {
    /// Parse a `status` query value. Empty means open; `all` disables the
    /// filter.
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(Self::default()),
            Some(v) if v.eq_ignore_ascii_case("all") => Ok(Self::All),
            Some(v) => IssueStatus::parse(v)
                .map(Self::Status)
                .ok_or_else(|| Error::InvalidInput(format!("unknown convoy status: {}", v))),
        }
    }
}

/// Reads convoys from the town store, routing member lookups across rigs.
pub struct ConvoyReader<'a> {
    town_root: &'a Path,
    config: &'a TownConfig,
    stores: &'a dyn StoreProvider,
}

impl<'a> ConvoyReader<'a> {
    pub fn new(town_root: &'a Path, config: &'a TownConfig, stores: &'a dyn StoreProvider) -> Self {
        Self {
            town_root,
            config,
            stores,
        }
    }

    fn town_store(&self) -> Arc<dyn IssueStore> {
        self.stores.open(self.town_root)
    }

    /// List convoys with progress. A town without a bead store has none.
    pub fn list(&self, filter: &ConvoyStatusFilter) -> Result<Vec<ConvoyInfo>> {
        let mut list_filter = ListFilter::issue_type(TYPE_CONVOY);
        if let ConvoyStatusFilter::Status(status) = filter {
            list_filter = list_filter.with_status(status.clone());
        }

        let convoys = match self.town_store().list(&list_filter) {
            Ok(convoys) => convoys,
            Err(Error::NoStore(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(convoys
            .iter()
            .map(|convoy| self.build_info(convoy, false))
            .collect())
    }

    /// One convoy with members and blockers.
    pub fn get(&self, id: &str) -> Result<ConvoyInfo> {
        let convoy = self.town_store().show(id)?;
        if !convoy.is_convoy() {
            return Err(Error::NotFound(format!("not a convoy: {}", id)));
        }
        Ok(self.build_info(&convoy, true))
    }

    /// Resolve tracked IDs across partitions. Misses are absent.
    pub fn resolve_members(&self, ids: &[String]) -> HashMap<String, Issue> {
        if ids.is_empty() {
            return HashMap::new();
        }
        let town = self.town_store();
        let mut found = town.show_batch(ids).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "town batch lookup failed");
            HashMap::new()
        });

        // Route misses by prefix to the owning rig.
        let mut routed: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for id in ids.iter().filter(|id| !found.contains_key(*id)) {
            if let Some(rig) = id_prefix(id).and_then(|p| self.config.rig_for_prefix(p)) {
                routed.entry(rig.name.as_str()).or_default().push(id.clone());
            }
        }
        for (rig_name, rig_ids) in routed {
            let Some(rig) = self.config.rigs.iter().find(|r| r.name == rig_name) else {
                continue;
            };
            let store = self.stores.open(&rig.resolve_path(self.town_root));
            match store.show_batch(&rig_ids) {
                Ok(issues) => found.extend(issues),
                Err(e) => tracing::debug!(rig = rig_name, error = %e, "rig batch lookup failed"),
            }
        }

        for id in ids {
            if found.contains_key(id) {
                continue;
            }
            if let Ok(issue) = town.show(id) {
                found.insert(id.clone(), issue);
            }
        }

        found
    }

    fn build_info(&self, convoy: &Issue, detailed: bool) -> ConvoyInfo {
        let tracked_ids = convoy.tracked_ids();
        let total = tracked_ids.len();

        let mut info = ConvoyInfo {
            id: convoy.id.clone(),
            name: convoy.title.clone(),
            status: convoy.status.clone(),
            tracked_ids: tracked_ids.clone(),
            progress: 1.0,
            completed: 0,
            total,
            created_at: convoy.created_at,
            completed_at: if convoy.is_closed() {
                convoy.closed_at
            } else {
                None
            },
            members: None,
            blockers: None,
        };

        if total == 0 {
            if detailed {
                info.members = Some(Vec::new());
                info.blockers = Some(Vec::new());
            }
            return info;
        }

        let resolved = self.resolve_members(&tracked_ids);
        info.completed = tracked_ids
            .iter()
            .filter(|id| resolved.get(*id).is_some_and(Issue::is_closed))
            .count();
        info.progress = info.completed as f64 / total as f64;

        if detailed {
            let mut members = Vec::with_capacity(total);
            let mut blockers = Vec::new();
            for id in &tracked_ids {
                match resolved.get(id) {
                    Some(issue) => {
                        members.push(ConvoyMember::from_issue(issue));
                        if !issue.is_closed() {
                            blockers.extend(issue.blocked_by.iter().map(|blocker| {
                                ConvoyBlocker {
                                    id: issue.id.clone(),
                                    title: issue.title.clone(),
                                    blocked_by: blocker.clone(),
                                }
                            }));
                        }
                    }
                    None => members.push(ConvoyMember::missing(id)),
                }
            }
            info.members = Some(members);
            info.blockers = Some(blockers);
        }

        info
    }
}
