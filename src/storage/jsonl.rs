//! Append-only JSONL bead store.
//!
//! Layout: `<root>/.beads/issues.jsonl`, one JSON issue per line. Updates
//! append a new version of the issue; readers fold lines by ID keeping the
//! latest version at the position of the first one, so list order is
//! creation order. Unparsable lines are skipped.

use super::{IssueStore, ListFilter, beads_dir};
use crate::models::{Issue, IssueStatus, fields};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

const ISSUES_FILE: &str = "issues.jsonl";

/// Bead store backed by a JSONL file.
#[derive(Debug, Clone)]
pub struct JsonlIssueStore {
    /// Partition root (the directory containing `.beads`)
    root: PathBuf,
}

impl JsonlIssueStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn issues_path(&self) -> PathBuf {
        beads_dir(&self.root).join(ISSUES_FILE)
    }

    /// Read every issue, folded to its latest version, in creation order.
    fn read_all(&self) -> Result<Vec<Issue>> {
        let dir = beads_dir(&self.root);
        if !dir.is_dir() {
            return Err(Error::NoStore(dir));
        }

        let file = match File::open(self.issues_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut order: Vec<Issue> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for line in BufReader::new(file).split(b'\n') {
            let line = line?;
            let Ok(line) = std::str::from_utf8(&line) else {
                tracing::debug!(store = %self.location(), "skipping non-UTF-8 bead line");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            let issue = match serde_json::from_str::<Issue>(line) {
                Ok(issue) => issue,
                Err(e) => {
                    tracing::debug!(store = %self.location(), error = %e, "skipping bad bead line");
                    continue;
                }
            };
            match index.get(&issue.id) {
                Some(&pos) => order[pos] = issue,
                None => {
                    index.insert(issue.id.clone(), order.len());
                    order.push(issue);
                }
            }
        }

        Ok(order)
    }

    /// Append one issue version.
    fn append(&self, issue: &Issue) -> Result<()> {
        let dir = beads_dir(&self.root);
        if !dir.is_dir() {
            return Err(Error::NoStore(dir));
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.issues_path())?;
        let json = serde_json::to_string(issue)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Write a new issue or a new version of an existing one.
    pub fn create(&self, issue: &Issue) -> Result<()> {
        self.append(issue)
    }
}

impl IssueStore for JsonlIssueStore {
    fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|issue| filter.matches(issue))
            .collect())
    }

    fn show(&self, id: &str) -> Result<Issue> {
        self.read_all()?
            .into_iter()
            .find(|issue| issue.id == id)
            .ok_or_else(|| Error::NotFound(format!("issue not found: {}", id)))
    }

    fn show_batch(&self, ids: &[String]) -> Result<HashMap<String, Issue>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|issue| ids.contains(&issue.id))
            .map(|issue| (issue.id.clone(), issue))
            .collect())
    }

    fn detach_molecule(&self, pinned_id: &str) -> Result<Issue> {
        let mut issue = self.show(pinned_id)?;
        if issue.attached_molecule().is_none() {
            return Ok(issue);
        }
        issue.attached_molecule = None;
        issue.description = fields::remove_field(&issue.description, "attached_molecule");
        self.append(&issue)?;
        Ok(issue)
    }

    fn close_with_reason(&self, reason: &str, ids: &[String]) -> Result<()> {
        let current = self.show_batch(ids)?;
        if let Some(missing) = ids.iter().find(|id| !current.contains_key(*id)) {
            return Err(Error::NotFound(format!("issue not found: {}", missing)));
        }

        let now = Utc::now();
        for id in ids {
            let Some(issue) = current.get(id) else {
                continue;
            };
            if issue.is_closed() {
                continue;
            }
            let mut closed = issue.clone();
            closed.status = IssueStatus::Closed;
            closed.closed_at = Some(now);
            closed.close_reason = Some(reason.to_string());
            self.append(&closed)?;
        }
        Ok(())
    }

    fn location(&self) -> String {
        beads_dir(&self.root).display().to_string()
    }
}
