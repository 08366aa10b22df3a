//! Common test utilities for `gt` integration tests.
//!
//! Provides `TestTown`, a throwaway town on disk, and a `gt()` command that
//! targets it without depending on the caller's environment.

#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A temporary town with `mayor/` and a town-level bead store.
pub struct TestTown {
    pub dir: TempDir,
}

impl TestTown {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("mayor")).unwrap();
        fs::create_dir_all(dir.path().join(".beads")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Get a Command for the gt binary pointed at this town.
    ///
    /// Runs from the town directory with logging silenced so stderr only
    /// carries command errors.
    pub fn gt(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_gt"));
        cmd.current_dir(self.path());
        cmd.arg("--town").arg(self.path());
        cmd.env("GT_LOG", "off");
        cmd.env_remove("GT_TOWN_ROOT");
        cmd
    }

    /// Write `mayor/town.kdl`.
    pub fn write_config(&self, kdl: &str) {
        fs::write(self.path().join("mayor").join("town.kdl"), kdl).unwrap();
    }

    /// Create a rig directory with polecats, a witness and its own bead store.
    pub fn add_rig(&self, name: &str, polecats: &[&str]) -> PathBuf {
        let rig = self.path().join(name);
        fs::create_dir_all(rig.join(".beads")).unwrap();
        fs::create_dir_all(rig.join("witness")).unwrap();
        for polecat in polecats {
            fs::create_dir_all(rig.join("polecats").join(polecat)).unwrap();
        }
        rig
    }

    /// Append raw issue records to `<root>/.beads/issues.jsonl`.
    pub fn seed(&self, root: &Path, issues: &[Value]) {
        let path = root.join(".beads").join("issues.jsonl");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for issue in issues {
            writeln!(file, "{}", issue).unwrap();
        }
    }

    /// Read back every issue record under `root`.
    pub fn issues(&self, root: &Path) -> Vec<Value> {
        let path = root.join(".beads").join("issues.jsonl");
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Find an issue record by id, taking the last line that mentions it.
    pub fn issue(&self, root: &Path, id: &str) -> Value {
        self.issues(root)
            .into_iter()
            .rev()
            .find(|issue| issue["id"] == id)
            .unwrap_or_else(|| panic!("no issue {}", id))
    }
}

impl Default for TestTown {
    fn default() -> Self {
        Self::new()
    }
}

/// A pinned handoff bead created `created_at` (RFC 3339).
pub fn handoff(id: &str, title: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "status": "pinned",
        "issue_type": "task",
        "created_at": created_at,
    })
}

/// Parse command stdout as JSON.
pub fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}
