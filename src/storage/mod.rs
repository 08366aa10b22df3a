//! Bead store adapters.
//!
//! Every partition of the town (the town itself and each rig) owns an
//! independent bead store rooted at `<partition>/.beads/`. The core only
//! talks to stores through the [`IssueStore`] trait; [`StoreProvider`] opens
//! the store for a partition root.
//!
//! ## Backends
//!
//! - **JSONL** ([`JsonlIssueStore`], default): append-only `issues.jsonl`,
//!   where the latest line for an ID is its current version.

pub mod jsonl;

pub use jsonl::JsonlIssueStore;

use crate::Result;
use crate::models::{Issue, IssueStatus, TYPE_AGENT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the per-partition bead directory.
pub const BEADS_DIR: &str = ".beads";

/// Filter for [`IssueStore::list`]. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<IssueStatus>,
    pub issue_type: Option<String>,
}

impl ListFilter {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            issue_type: None,
        }
    }

    pub fn issue_type(issue_type: impl Into<String>) -> Self {
        Self {
            status: None,
            issue_type: Some(issue_type.into()),
        }
    }

    pub fn with_status(mut self, status: IssueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        if let Some(ref status) = self.status {
            if &issue.status != status {
                return false;
            }
        }
        if let Some(ref issue_type) = self.issue_type {
            if &issue.issue_type != issue_type {
                return false;
            }
        }
        true
    }
}

/// Query and mutation surface of one bead store partition.
///
/// List order is store order: the order in which issues were first written.
pub trait IssueStore: Send + Sync {
    /// List issues matching the filter.
    fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>>;

    /// Show one issue. Missing IDs are [`crate::Error::NotFound`].
    fn show(&self, id: &str) -> Result<Issue>;

    /// Show several issues at once. Missing IDs are simply absent.
    fn show_batch(&self, ids: &[String]) -> Result<HashMap<String, Issue>>;

    /// Clear the attached molecule of a pinned bead.
    fn detach_molecule(&self, pinned_id: &str) -> Result<Issue>;

    /// Close the given issues, recording `reason`.
    fn close_with_reason(&self, reason: &str, ids: &[String]) -> Result<()>;

    /// Human-readable location of the store.
    fn location(&self) -> String;

    /// All agent beads keyed by agent address.
    fn list_agent_beads(&self) -> Result<HashMap<String, Issue>> {
        let beads = self.list(&ListFilter::issue_type(TYPE_AGENT))?;
        Ok(beads
            .into_iter()
            .filter_map(|bead| bead.agent_address().map(|addr| (addr, bead)))
            .collect())
    }
}

/// Opens the bead store of a partition root.
pub trait StoreProvider: Send + Sync {
    fn open(&self, root: &Path) -> Arc<dyn IssueStore>;
}

/// Provider for [`JsonlIssueStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlStoreProvider;

impl StoreProvider for JsonlStoreProvider {
    fn open(&self, root: &Path) -> Arc<dyn IssueStore> {
        Arc::new(JsonlIssueStore::new(root))
    }
}

/// Bead directory for a partition root.
pub fn beads_dir(root: &Path) -> PathBuf {
    root.join(BEADS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let mut issue = Issue::new("gt-1", "Polecat Handoff");
        issue.status = IssueStatus::Pinned;

        assert!(ListFilter::default().matches(&issue));
        assert!(ListFilter::status(IssueStatus::Pinned).matches(&issue));
        assert!(!ListFilter::status(IssueStatus::Closed).matches(&issue));
        assert!(!ListFilter::issue_type("convoy").matches(&issue));
        assert!(
            ListFilter::issue_type("task")
                .with_status(IssueStatus::Pinned)
                .matches(&issue)
        );
    }
}
