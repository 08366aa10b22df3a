//! Attached molecules must exist and be open.

use super::{Check, CheckContext, CheckResult, find_partitions};
use crate::models::IssueStatus;
use crate::storage::ListFilter;
use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

const NAME: &str = "hook-attachment-valid";

/// Why an attachment is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentProblem {
    NotFound,
    Closed,
}

/// A pinned bead whose attached molecule is missing or closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAttachment {
    pub pinned_id: String,
    pub molecule_id: String,
    pub problem: AttachmentProblem,
    /// Partition the pinned bead lives in
    pub partition: PathBuf,
}

impl InvalidAttachment {
    fn describe(&self) -> String {
        let reason = match self.problem {
            AttachmentProblem::NotFound => "not found",
            AttachmentProblem::Closed => "is closed",
        };
        format!(
            "{}: attached molecule {} {}",
            self.pinned_id, self.molecule_id, reason
        )
    }
}

/// Detects pinned beads attached to missing or closed molecules.
///
/// Fix: detach the molecule from each offending pinned bead.
#[derive(Debug, Default)]
pub struct HookAttachmentValidCheck {
    invalid: Vec<InvalidAttachment>,
}

impl HookAttachmentValidCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Findings of the last run not yet repaired.
    pub fn findings(&self) -> &[InvalidAttachment] {
        &self.invalid
    }

    fn check_partition(&self, ctx: &CheckContext, root: &Path) -> Vec<InvalidAttachment> {
        let store = ctx.provider.open(root);
        let pinned = match store.list(&ListFilter::status(IssueStatus::Pinned)) {
            Ok(pinned) => pinned,
            Err(e) => {
                tracing::debug!(partition = %root.display(), error = %e, "skipping partition");
                return Vec::new();
            }
        };

        let mut invalid = Vec::new();
        for bead in pinned {
            let Some(molecule_id) = bead.attached_molecule() else {
                continue;
            };
            let problem = match store.show(&molecule_id) {
                Err(_) => AttachmentProblem::NotFound,
                Ok(molecule) if molecule.is_closed() => AttachmentProblem::Closed,
                Ok(_) => continue,
            };
            tracing::debug!(pinned = %bead.id, molecule = %molecule_id, ?problem, "invalid attachment");
            invalid.push(InvalidAttachment {
                pinned_id: bead.id,
                molecule_id,
                problem,
                partition: root.to_path_buf(),
            });
        }
        invalid
    }
}

impl Check for HookAttachmentValidCheck {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Verify attached molecules exist and are not closed"
    }

    fn run(&mut self, ctx: &CheckContext) -> CheckResult {
        self.invalid = find_partitions(&ctx.town_root)
            .iter()
            .flat_map(|partition| self.check_partition(ctx, &partition.root))
            .collect();

        if self.invalid.is_empty() {
            return CheckResult::ok(NAME, "All hook attachments are valid");
        }

        CheckResult::error(
            NAME,
            format!("Found {} invalid hook attachment(s)", self.invalid.len()),
            self.invalid.iter().map(InvalidAttachment::describe).collect(),
            "Run 'gt doctor --fix' to detach invalid molecules",
        )
    }

    fn fix(&mut self, ctx: &CheckContext) -> Result<()> {
        let mut failed = Vec::new();
        let mut errors = Vec::new();

        for inv in self.invalid.drain(..) {
            let store = ctx.provider.open(&inv.partition);
            match store.detach_molecule(&inv.pinned_id) {
                Ok(_) => {
                    tracing::info!(pinned = %inv.pinned_id, molecule = %inv.molecule_id, "detached molecule");
                }
                Err(e) => {
                    errors.push(format!("failed to detach from {}: {}", inv.pinned_id, e));
                    failed.push(inv);
                }
            }
        }

        self.invalid = failed;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Store(errors.join("; ")))
        }
    }
}
