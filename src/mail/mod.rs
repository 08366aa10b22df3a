//! Mailbox adapter.
//!
//! Each agent address owns a mailbox file `<town>/mail/<address>.jsonl`
//! (`/` in the address encoded as `__`). Like the bead store, the file is
//! append-only: marking a message read appends a new version of it, and
//! readers keep the latest version of each message ID.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Address of the town supervisor's mailbox.
pub const MAYOR_ADDRESS: &str = "mayor";

/// A mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_message_type() -> String {
    "notification".to_string()
}

impl MailMessage {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: String::new(),
            timestamp: Utc::now(),
            read: false,
            priority: default_priority(),
            message_type: default_message_type(),
            thread_id: None,
            reply_to: None,
            pinned: false,
            cc: Vec::new(),
        }
    }
}

/// Message totals for one mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailCount {
    pub total: usize,
    pub unread: usize,
}

/// Mail search criteria.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    pub query: String,
    #[serde(default, rename = "from")]
    pub from_filter: Option<String>,
    #[serde(default)]
    pub subject_only: bool,
    #[serde(default)]
    pub body_only: bool,
}

/// Per-address mailbox access.
pub trait MailRouter: Send + Sync {
    fn count(&self, address: &str) -> Result<MailCount>;

    /// Messages for an address, newest first.
    fn list(&self, address: &str) -> Result<Vec<MailMessage>>;

    /// One message; missing IDs are [`Error::NotFound`].
    fn get(&self, address: &str, id: &str) -> Result<MailMessage>;

    fn mark_read(&self, address: &str, id: &str) -> Result<()>;

    fn search(&self, address: &str, options: &SearchOptions) -> Result<Vec<MailMessage>>;
}

/// Mailboxes stored as JSONL files under `<town>/mail/`.
#[derive(Debug, Clone)]
pub struct JsonlMailRouter {
    mail_dir: PathBuf,
}

/// Normalize an address: trailing slashes are dropped (`mayor/` is `mayor`).
pub fn normalize_address(address: &str) -> &str {
    address.trim().trim_end_matches('/')
}

impl JsonlMailRouter {
    pub fn new(town_root: &Path) -> Self {
        Self {
            mail_dir: town_root.join("mail"),
        }
    }

    fn mailbox_path(&self, address: &str) -> Result<PathBuf> {
        let address = normalize_address(address);
        if address.is_empty() || address.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::InvalidInput(format!(
                "invalid mail address: {:?}",
                address
            )));
        }
        Ok(self
            .mail_dir
            .join(format!("{}.jsonl", address.replace('/', "__"))))
    }

    fn read_mailbox(&self, address: &str) -> Result<Vec<MailMessage>> {
        let path = self.mailbox_path(address)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Mail(format!("{}: {}", path.display(), e))),
        };

        let mut messages: Vec<MailMessage> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for line in BufReader::new(file).split(b'\n') {
            let line = line?;
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<MailMessage>(line) else {
                continue;
            };
            match index.get(&message.id) {
                Some(&pos) => messages[pos] = message,
                None => {
                    index.insert(message.id.clone(), messages.len());
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    /// Deliver a message to an address.
    pub fn send(&self, address: &str, message: &MailMessage) -> Result<()> {
        let path = self.mailbox_path(address)?;
        fs::create_dir_all(&self.mail_dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        Ok(())
    }
}

fn newest_first(mut messages: Vec<MailMessage>) -> Vec<MailMessage> {
    messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    messages
}

/// Case-insensitive literal match of the query text.
fn query_pattern(query: &str) -> Result<Regex> {
    RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid search query: {}", e)))
}

impl MailRouter for JsonlMailRouter {
    fn count(&self, address: &str) -> Result<MailCount> {
        let messages = self.read_mailbox(address)?;
        Ok(MailCount {
            total: messages.len(),
            unread: messages.iter().filter(|m| !m.read).count(),
        })
    }

    fn list(&self, address: &str) -> Result<Vec<MailMessage>> {
        Ok(newest_first(self.read_mailbox(address)?))
    }

    fn get(&self, address: &str, id: &str) -> Result<MailMessage> {
        self.read_mailbox(address)?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("message not found: {}", id)))
    }

    fn mark_read(&self, address: &str, id: &str) -> Result<()> {
        let mut message = self.get(address, id)?;
        if message.read {
            return Ok(());
        }
        message.read = true;
        self.send(address, &message)
    }

    fn search(&self, address: &str, options: &SearchOptions) -> Result<Vec<MailMessage>> {
        if options.query.trim().is_empty() {
            return Err(Error::InvalidInput("search query is required".to_string()));
        }
        let pattern = query_pattern(&options.query)?;
        let from = options.from_filter.as_deref().map(str::to_lowercase);

        let matches = self
            .read_mailbox(address)?
            .into_iter()
            .filter(|m| match &from {
                Some(from) => m.from.to_lowercase().contains(from),
                None => true,
            })
            .filter(|m| {
                if options.subject_only {
                    pattern.is_match(&m.subject)
                } else if options.body_only {
                    pattern.is_match(&m.body)
                } else {
                    pattern.is_match(&m.subject) || pattern.is_match(&m.body)
                }
            })
            .collect();
        Ok(newest_first(matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn message(id: &str, subject: &str, minutes_ago: i64) -> MailMessage {
        let mut msg = MailMessage::new(id, "acme/witness", "mayor", subject);
        msg.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        msg
    }

    fn create_router() -> (TempDir, JsonlMailRouter) {
        let temp = TempDir::new().unwrap();
        let router = JsonlMailRouter::new(temp.path());
        (temp, router)
    }

    #[test]
    fn test_missing_mailbox_is_empty() {
        let (_temp, router) = create_router();
        assert_eq!(router.count("acme/fox").unwrap(), MailCount::default());
        assert!(router.list("acme/fox").unwrap().is_empty());
    }

    #[test]
    fn test_address_encoding() {
        let (temp, router) = create_router();
        router
            .send("acme/fox", &message("m-1", "hello", 0))
            .unwrap();
        assert!(temp.path().join("mail").join("acme__fox.jsonl").exists());
        assert_eq!(router.count("acme/fox/").unwrap().total, 1);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let (_temp, router) = create_router();
        assert!(matches!(
            router.list("../etc").unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_list_newest_first() {
        let (_temp, router) = create_router();
        router.send(MAYOR_ADDRESS, &message("m-old", "old", 30)).unwrap();
        router.send(MAYOR_ADDRESS, &message("m-new", "new", 1)).unwrap();

        let ids: Vec<String> = router
            .list(MAYOR_ADDRESS)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m-new", "m-old"]);
    }

    #[test]
    fn test_mark_read_updates_count() {
        let (_temp, router) = create_router();
        router.send(MAYOR_ADDRESS, &message("m-1", "one", 2)).unwrap();
        router.send(MAYOR_ADDRESS, &message("m-2", "two", 1)).unwrap();

        router.mark_read(MAYOR_ADDRESS, "m-1").unwrap();
        let count = router.count(MAYOR_ADDRESS).unwrap();
        assert_eq!(count, MailCount { total: 2, unread: 1 });
        assert!(router.get(MAYOR_ADDRESS, "m-1").unwrap().read);
    }

    #[test]
    fn test_mark_read_missing() {
        let (_temp, router) = create_router();
        assert!(router.mark_read(MAYOR_ADDRESS, "m-404").unwrap_err().is_not_found());
    }

    #[test]
    fn test_search() {
        let (_temp, router) = create_router();
        let mut a = message("m-1", "Merge queue stuck", 2);
        a.body = "refinery is blocked".to_string();
        let mut b = message("m-2", "Status", 1);
        b.body = "merge went fine".to_string();
        b.from = "acme/fox".to_string();
        router.send(MAYOR_ADDRESS, &a).unwrap();
        router.send(MAYOR_ADDRESS, &b).unwrap();

        let all = router
            .search(
                MAYOR_ADDRESS,
                &SearchOptions {
                    query: "merge".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.len(), 2);

        let subject_only = router
            .search(
                MAYOR_ADDRESS,
                &SearchOptions {
                    query: "merge".to_string(),
                    subject_only: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(subject_only.len(), 1);
        assert_eq!(subject_only[0].id, "m-1");

        let from_fox = router
            .search(
                MAYOR_ADDRESS,
                &SearchOptions {
                    query: "merge".to_string(),
                    from_filter: Some("fox".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(from_fox.len(), 1);
        assert_eq!(from_fox[0].id, "m-2");
    }

    #[test]
    fn test_search_requires_query() {
        let (_temp, router) = create_router();
        let err = router
            .search(MAYOR_ADDRESS, &SearchOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_search_is_literal() {
        let (_temp, router) = create_router();
        router.send(MAYOR_ADDRESS, &message("m-1", "deploy axb", 2)).unwrap();
        router.send(MAYOR_ADDRESS, &message("m-2", "deploy a.b (retry", 1)).unwrap();

        for query in ["a.b", "A.B (RETRY"] {
            let found = router
                .search(
                    MAYOR_ADDRESS,
                    &SearchOptions {
                        query: query.to_string(),
                        ..Default::default()
                    },
                )
                .unwrap();
            assert_eq!(found.len(), 1, "query {:?}", query);
            assert_eq!(found[0].id, "m-2");
        }
    }

    #[test]
    fn test_invalid_utf8_line_skipped() {
        let (_temp, router) = create_router();
        router.send(MAYOR_ADDRESS, &message("m-1", "First", 2)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(router.mailbox_path(MAYOR_ADDRESS).unwrap())
            .unwrap();
        file.write_all(b"\xff\n").unwrap();
        router.send(MAYOR_ADDRESS, &message("m-2", "Second", 1)).unwrap();

        let messages = router.list(MAYOR_ADDRESS).unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m-2", "m-1"]);
    }
}
