//! Command implementations for the `gt` CLI.
//!
//! Each command returns a result type implementing [`Output`]; `main` prints
//! it as JSON or, with `--human`, as a short text summary.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::Result;
use crate::doctor::{CheckContext, CheckResult, Doctor, DoctorReport};
use crate::status::{StatusBuilder, TownStatus};
use crate::storage::JsonlStoreProvider;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json_of<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}

/// Result of `gt status`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct StatusOutput {
    pub status: TownStatus,
}

impl Output for StatusOutput {
    fn to_json(&self) -> String {
        json_of(&self.status)
    }

    fn to_human(&self) -> String {
        let status = &self.status;
        let summary = &status.summary;
        let mut out = String::new();
        let _ = writeln!(out, "Town: {} ({})", status.name, status.location);
        if let Some(overseer) = &status.overseer {
            let _ = writeln!(
                out,
                "Overseer: {} [{}], {} unread",
                overseer.name, overseer.source, overseer.unread_mail
            );
        }
        let _ = writeln!(
            out,
            "{} rig(s), {} polecat(s), {} crew, {} witness(es), {} refiner(ies), {} active hook(s)",
            summary.rig_count,
            summary.polecat_count,
            summary.crew_count,
            summary.witness_count,
            summary.refinery_count,
            summary.active_hooks
        );

        for agent in &status.agents {
            let _ = writeln!(out, "  {}", agent_line(agent));
        }
        for rig in &status.rigs {
            let _ = writeln!(out);
            let _ = writeln!(out, "{} ({} hook(s))", rig.name, rig.active_hooks);
            if rig.agents.is_empty() {
                let _ = writeln!(out, "  (no agents)");
            }
            for agent in &rig.agents {
                let _ = writeln!(out, "  {}", agent_line(agent));
            }
        }
        out.trim_end().to_string()
    }
}

fn agent_line(agent: &crate::status::AgentRuntime) -> String {
    let marker = if agent.running { "●" } else { "○" };
    let mut line = format!("{} {}", marker, agent.address);
    if let Some(bead) = &agent.hook_bead {
        let _ = write!(line, " -> {}", bead);
        if let Some(title) = &agent.work_title {
            let _ = write!(line, " \"{}\"", title);
        }
    }
    if let Some(state) = &agent.state {
        let _ = write!(line, " [{}]", state);
    }
    if agent.unread_mail > 0 {
        let _ = write!(line, " ({} unread)", agent.unread_mail);
    }
    line
}

/// Build a town snapshot.
pub fn status(town_root: &Path, fast: bool) -> Result<StatusOutput> {
    let status = StatusBuilder::for_town(town_root).build(fast)?;
    Ok(StatusOutput { status })
}

/// Result of `gt doctor`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct DoctorOutput {
    pub report: DoctorReport,
}

impl DoctorOutput {
    pub fn ok(&self) -> bool {
        self.report.ok
    }
}

impl Output for DoctorOutput {
    fn to_json(&self) -> String {
        json_of(&self.report)
    }

    fn to_human(&self) -> String {
        let mut out = String::new();
        for check in &self.report.checks {
            write_check(&mut out, check);
        }
        if self.report.ok {
            let _ = write!(out, "All checks passed.");
        } else {
            let failed = self.report.checks.iter().filter(|c| !c.is_ok()).count();
            let _ = write!(out, "{} check(s) failed.", failed);
        }
        out
    }
}

fn write_check(out: &mut String, check: &CheckResult) {
    let mark = if check.is_ok() { "✓" } else { "✗" };
    let _ = writeln!(out, "{} {}: {}", mark, check.name, check.message);
    for detail in &check.details {
        let _ = writeln!(out, "    {}", detail);
    }
    if let Some(hint) = &check.fix_hint {
        let _ = writeln!(out, "    hint: {}", hint);
    }
}

/// Run the consistency checks, optionally repairing what they find.
///
/// With `check`, only the named check runs; an unknown name is `NotFound`.
pub fn doctor(town_root: &Path, fix: bool, check: Option<&str>) -> Result<DoctorOutput> {
    let ctx = CheckContext::new(town_root, Arc::new(JsonlStoreProvider));
    let mut doctor = Doctor::new();

    let report = match check {
        Some(name) => {
            let result = if fix {
                doctor.fix_check(&ctx, name)?
            } else {
                doctor.run_check(&ctx, name)?
            };
            DoctorReport {
                ok: result.is_ok(),
                checks: vec![result],
            }
        }
        None if fix => doctor.run_and_fix(&ctx),
        None => doctor.run(&ctx),
    };
    Ok(DoctorOutput { report })
}
