//! At most one pinned handoff bead per title.

use super::{Check, CheckContext, CheckResult, find_partitions};
use crate::models::{Issue, IssueStatus};
use crate::storage::ListFilter;
use crate::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const NAME: &str = "hook-singleton";

/// Close reason recorded on duplicates.
pub const DUPLICATE_HANDOFF_REASON: &str = "duplicate handoff bead";

static HANDOFF_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+ Handoff$").expect("valid handoff regex"));

/// Pinned beads sharing one handoff title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateHandoff {
    pub title: String,
    /// Oldest first; the first one is kept
    pub bead_ids: Vec<String>,
    pub partition: PathBuf,
}

impl DuplicateHandoff {
    /// IDs to close.
    pub fn duplicates(&self) -> &[String] {
        self.bead_ids.get(1..).unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!(
            "{:?} has {} beads: {}",
            self.title,
            self.bead_ids.len(),
            self.bead_ids.join(", ")
        )
    }
}

/// Orders handoff beads oldest first.
///
/// Beads without a creation time sort after timestamped ones; ties keep the
/// store's list order.
fn order_oldest_first(beads: &mut [Issue]) {
    beads.sort_by_key(|bead| (bead.created_at.is_none(), bead.created_at));
}

/// Detects duplicate `"<role> Handoff"` pinned beads.
///
/// Fix: close every duplicate but the oldest.
#[derive(Debug, Default)]
pub struct HookSingletonCheck {
    duplicates: Vec<DuplicateHandoff>,
}

impl HookSingletonCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Findings of the last run not yet repaired.
    pub fn findings(&self) -> &[DuplicateHandoff] {
        &self.duplicates
    }

    fn check_partition(&self, ctx: &CheckContext, root: &Path) -> Vec<DuplicateHandoff> {
        let store = ctx.provider.open(root);
        let pinned = match store.list(&ListFilter::status(IssueStatus::Pinned)) {
            Ok(pinned) => pinned,
            Err(e) => {
                tracing::debug!(partition = %root.display(), error = %e, "skipping partition");
                return Vec::new();
            }
        };

        let mut by_title: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        for bead in pinned {
            if HANDOFF_TITLE.is_match(&bead.title) {
                by_title.entry(bead.title.clone()).or_default().push(bead);
            }
        }

        by_title
            .into_iter()
            .filter(|(_, beads)| beads.len() > 1)
            .map(|(title, mut beads)| {
                order_oldest_first(&mut beads);
                tracing::debug!(partition = %root.display(), %title, count = beads.len(), "duplicate handoff");
                DuplicateHandoff {
                    title,
                    bead_ids: beads.into_iter().map(|b| b.id).collect(),
                    partition: root.to_path_buf(),
                }
            })
            .collect()
    }
}

impl Check for HookSingletonCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Ensure each agent has at most one handoff bead"
    }

    fn run(&mut self, ctx: &CheckContext) -> CheckResult {
        self.duplicates = find_partitions(&ctx.town_root)
            .iter()
            .flat_map(|partition| self.check_partition(ctx, &partition.root))
            .collect();

        if self.duplicates.is_empty() {
            return CheckResult::ok(NAME, "All handoff beads are unique");
        }

        let extra: usize = self.duplicates.iter().map(|d| d.duplicates().len()).sum();
        CheckResult::error(
            NAME,
            format!("Found {} duplicate handoff bead(s)", extra),
            self.duplicates.iter().map(DuplicateHandoff::describe).collect(),
            "Run 'gt doctor --fix' to close duplicates",
        )
    }

    fn fix(&mut self, ctx: &CheckContext) -> Result<()> {
        let mut failed = Vec::new();
        let mut errors = Vec::new();

        for dup in self.duplicates.drain(..) {
            let to_close = dup.duplicates();
            if to_close.is_empty() {
                continue;
            }
            let store = ctx.provider.open(&dup.partition);
            match store.close_with_reason(DUPLICATE_HANDOFF_REASON, to_close) {
                Ok(()) => {
                    tracing::info!(title = %dup.title, closed = ?to_close, "closed duplicate handoffs");
                }
                Err(e) => {
                    errors.push(format!("failed to close duplicates for {:?}: {}", dup.title, e));
                    failed.push(dup);
                }
            }
        }

        self.duplicates = failed;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Store(errors.join("; ")))
        }
    }
}
