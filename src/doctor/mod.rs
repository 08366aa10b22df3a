//! Consistency checks over the town's bead stores.
//!
//! Each [`Check`] scans every bead store partition (the town store plus
//! each rig's) for one invariant and can repair what it found:
//!
//! - [`HookAttachmentValidCheck`] (`hook-attachment-valid`): a pinned bead's
//!   attached molecule must exist and be open.
//! - [`HookSingletonCheck`] (`hook-singleton`): at most one pinned
//!   `"<role> Handoff"` bead per title per partition.
//!
//! `fix` repairs the findings of the most recent `run` and forgets them once
//! repaired, so fixing twice in a row is a no-op.

mod hook_attachment;
mod hook_singleton;

pub use hook_attachment::{AttachmentProblem, HookAttachmentValidCheck, InvalidAttachment};
pub use hook_singleton::{DUPLICATE_HANDOFF_REASON, DuplicateHandoff, HookSingletonCheck};

use crate::storage::{BEADS_DIR, StoreProvider};
use crate::townlog::{self, TownEvent};
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Error,
}

/// Result of running one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
}

impl CheckResult {
    pub fn ok(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            message: message.into(),
            details: Vec::new(),
            fix_hint: None,
        }
    }

    pub fn error(
        name: &str,
        message: impl Into<String>,
        details: Vec<String>,
        fix_hint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            message: message.into(),
            details,
            fix_hint: Some(fix_hint.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CheckStatus::Ok
    }
}

/// What a check needs to reach the bead stores.
#[derive(Clone)]
pub struct CheckContext {
    pub town_root: PathBuf,
    pub provider: Arc<dyn StoreProvider>,
}

impl CheckContext {
    pub fn new(town_root: impl Into<PathBuf>, provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            town_root: town_root.into(),
            provider,
        }
    }
}

/// A bead store partition to audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// "town" or the rig directory name
    pub label: String,
    /// Directory containing `.beads`
    pub root: PathBuf,
}

/// The town partition followed by every `<town>/<dir>/.beads`, sorted.
///
/// `mayor/` is skipped; it holds the town's own configuration.
pub fn find_partitions(town_root: &Path) -> Vec<Partition> {
    let mut partitions = vec![Partition {
        label: "town".to_string(),
        root: town_root.to_path_buf(),
    }];

    let Ok(entries) = fs::read_dir(town_root) else {
        return partitions;
    };
    let mut rigs: Vec<Partition> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            let name = entry.file_name();
            name != "mayor" && name != BEADS_DIR
        })
        .filter(|entry| entry.path().join(BEADS_DIR).is_dir())
        .map(|entry| Partition {
            label: entry.file_name().to_string_lossy().into_owned(),
            root: entry.path(),
        })
        .collect();
    rigs.sort_by(|a, b| a.root.cmp(&b.root));
    partitions.extend(rigs);
    partitions
}

/// A consistency check with an optional repair.
pub trait Check: Send {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn can_fix(&self) -> bool {
        true
    }

    /// Scan every partition and remember the findings.
    fn run(&mut self, ctx: &CheckContext) -> CheckResult;

    /// Repair the findings of the last `run`.
    fn fix(&mut self, ctx: &CheckContext) -> Result<()>;
}

/// Outcome of a doctor pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        Self {
            ok: checks.iter().all(CheckResult::is_ok),
            checks,
        }
    }
}

/// Runs the registered checks.
pub struct Doctor {
    checks: Vec<Box<dyn Check>>,
}

impl Default for Doctor {
    fn default() -> Self {
        Self::new()
    }
}

impl Doctor {
    /// Doctor with every built-in check.
    pub fn new() -> Self {
        Self::with_checks(vec![
            Box::new(HookAttachmentValidCheck::new()),
            Box::new(HookSingletonCheck::new()),
        ])
    }

    pub fn with_checks(checks: Vec<Box<dyn Check>>) -> Self {
        Self { checks }
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    fn find_check(&mut self, name: &str) -> Result<&mut Box<dyn Check>> {
        self.checks
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::NotFound(format!("unknown check: {}", name)))
    }

    /// Run every check.
    pub fn run(&mut self, ctx: &CheckContext) -> DoctorReport {
        let results = self.checks.iter_mut().map(|check| check.run(ctx)).collect();
        DoctorReport::from_checks(results)
    }

    /// Run every check, fixing and re-running those that fail.
    ///
    /// A failed repair is reported in the check's details rather than
    /// aborting the remaining checks.
    pub fn run_and_fix(&mut self, ctx: &CheckContext) -> DoctorReport {
        let results = self
            .checks
            .iter_mut()
            .map(|check| run_and_fix_one(check.as_mut(), ctx).unwrap_or_else(|(mut result, e)| {
                result.details.push(format!("fix failed: {}", e));
                result
            }))
            .collect();
        DoctorReport::from_checks(results)
    }

    /// Run one check by name.
    pub fn run_check(&mut self, ctx: &CheckContext, name: &str) -> Result<CheckResult> {
        Ok(self.find_check(name)?.run(ctx))
    }

    /// Run one check, fix it if it fails, and return the re-run result.
    pub fn fix_check(&mut self, ctx: &CheckContext, name: &str) -> Result<CheckResult> {
        let check = self.find_check(name)?;
        run_and_fix_one(check.as_mut(), ctx).map_err(|(_, e)| e)
    }
}

fn run_and_fix_one(
    check: &mut dyn Check,
    ctx: &CheckContext,
) -> std::result::Result<CheckResult, (CheckResult, Error)> {
    let result = check.run(ctx);
    if result.is_ok() || !check.can_fix() {
        return Ok(result);
    }

    if let Err(e) = check.fix(ctx) {
        tracing::warn!(check = check.name(), error = %e, "fix failed");
        return Err((result, e));
    }
    tracing::info!(check = check.name(), found = %result.message, "applied fix");
    record_fix(ctx, check.name(), &result);

    Ok(check.run(ctx))
}

/// Note a repair in the town feed. Best effort.
fn record_fix(ctx: &CheckContext, check: &str, result: &CheckResult) {
    let event = TownEvent::new("doctor_fix")
        .with_actor("doctor")
        .with_message(format!("{}: {}", check, result.message))
        .with_details(serde_json::json!({ "check": check, "details": result.details }));
    if let Err(e) = townlog::log_event(&ctx.town_root, &event) {
        tracing::warn!(error = %e, "could not record fix in town feed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Issue, IssueStatus};
    use crate::storage::JsonlStoreProvider;
    use crate::test_utils::TestTown;

    fn context(town: &TestTown) -> CheckContext {
        CheckContext::new(town.path(), Arc::new(JsonlStoreProvider))
    }

    fn pinned(id: &str, title: &str) -> Issue {
        let mut issue = Issue::new(id, title);
        issue.status = IssueStatus::Pinned;
        issue
    }

    #[test]
    fn test_find_partitions() {
        let town = TestTown::new();
        town.add_rig("zeta", &[], &[], false, false);
        town.add_rig("acme", &[], &[], false, false);
        std::fs::create_dir_all(town.path().join("mayor/.beads")).unwrap();
        std::fs::create_dir_all(town.path().join("docs")).unwrap();

        let labels: Vec<String> = find_partitions(town.path())
            .into_iter()
            .map(|p| p.label)
            .collect();
        assert_eq!(labels, vec!["town", "acme", "zeta"]);
    }

    #[test]
    fn test_clean_town_passes() {
        let town = TestTown::new();
        let report = Doctor::new().run(&context(&town));
        assert!(report.ok);
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn test_run_and_fix_repairs_everything() {
        let town = TestTown::new();
        let mut molecule = Issue::new("gt-9", "Molecule");
        molecule.status = IssueStatus::Closed;
        let mut hook = pinned("gt-1", "Polecat Handoff");
        hook.attached_molecule = Some("gt-9".to_string());
        town.seed(
            town.path(),
            &[molecule, hook, pinned("gt-2", "Polecat Handoff")],
        );

        let ctx = context(&town);
        let mut doctor = Doctor::new();
        assert!(!doctor.run(&ctx).ok);

        let report = doctor.run_and_fix(&ctx);
        assert!(report.ok, "{:?}", report);

        let feed = townlog::read_events(town.path()).unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed.iter().all(|e| e.event_type == "doctor_fix"));
    }

    #[test]
    fn test_unknown_check_is_not_found() {
        let town = TestTown::new();
        let err = Doctor::new()
            .run_check(&context(&town), "no-such-check")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_check_names() {
        assert_eq!(
            Doctor::new().check_names(),
            vec!["hook-attachment-valid", "hook-singleton"]
        );
    }
}
