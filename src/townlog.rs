//! Town event feed.
//!
//! Agents and tools append activity to `<town>/.events.jsonl`, one JSON
//! event per line. Readers are tolerant: blank lines, lines that are not
//! UTF-8 and unparsable lines are skipped. The change detector tails the file by byte offset to broadcast
//! new events.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Feed file name relative to the town root.
pub const EVENTS_FILE: &str = ".events.jsonl";

/// One feed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TownEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// When the event happened
    #[serde(rename = "ts", alias = "timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Event type (e.g., "sling", "handoff", "done")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Address of the agent that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TownEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            actor: None,
            rig: None,
            message: None,
            context: None,
            details: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Criteria for [`filter_events`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Agent address; matches the event actor
    pub agent: Option<String>,
    pub event_type: Option<String>,
}

pub fn events_path(town_root: &Path) -> PathBuf {
    town_root.join(EVENTS_FILE)
}

fn parse_line(line: &[u8]) -> Option<TownEvent> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Read the whole feed, oldest first. A missing feed is empty.
pub fn read_events(town_root: &Path) -> Result<Vec<TownEvent>> {
    let file = match File::open(events_path(town_root)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for line in BufReader::new(file).split(b'\n') {
        if let Some(event) = parse_line(&line?) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Events matching a filter, in feed order.
pub fn filter_events(events: Vec<TownEvent>, filter: &EventFilter) -> Vec<TownEvent> {
    let agent = filter.agent.as_deref().map(|a| a.trim_end_matches('/'));
    events
        .into_iter()
        .filter(|event| match agent {
            Some(agent) => event.actor.as_deref().map(|a| a.trim_end_matches('/')) == Some(agent),
            None => true,
        })
        .filter(|event| match &filter.event_type {
            Some(t) => &event.event_type == t,
            None => true,
        })
        .collect()
}

/// Append an event to the feed.
pub fn log_event(town_root: &Path, event: &TownEvent) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path(town_root))?;
    writeln!(file, "{}", serde_json::to_string(event)?)?;
    Ok(())
}

/// Current size of the feed in bytes; 0 when missing.
pub fn feed_len(town_root: &Path) -> Result<u64> {
    match std::fs::metadata(events_path(town_root)) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Read events appended after byte `offset`.
///
/// Returns the events and the offset to resume from. Only complete lines
/// are consumed; a partially written trailing line is left for the next
/// read. A feed shorter than `offset` was truncated and is read from the
/// start.
pub fn read_events_since(town_root: &Path, offset: u64) -> Result<(Vec<TownEvent>, u64)> {
    let mut file = match File::open(events_path(town_root)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    let start = if len < offset { 0 } else { offset };
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let complete = match buf.iter().rposition(|&b| b == b'\n') {
        Some(idx) => idx + 1,
        None => 0,
    };
    let events = buf[..complete]
        .split(|&b| b == b'\n')
        .filter_map(parse_line)
        .collect();
    Ok((events, start + complete as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_feed_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_events(temp.path()).unwrap().is_empty());
        assert_eq!(feed_len(temp.path()).unwrap(), 0);
    }

    #[test]
    fn test_log_and_read() {
        let temp = TempDir::new().unwrap();
        log_event(
            temp.path(),
            &TownEvent::new("sling").with_actor("acme/fox").with_message("took gt-42"),
        )
        .unwrap();
        log_event(temp.path(), &TownEvent::new("done").with_actor("acme/badger")).unwrap();

        let events = read_events(temp.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "sling");
        assert_eq!(events[0].message.as_deref(), Some("took gt-42"));
    }

    #[test]
    fn test_bad_lines_skipped() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            events_path(temp.path()),
            "not json\n\n{\"ts\":\"2026-01-02T03:04:05Z\",\"type\":\"handoff\"}\n",
        )
        .unwrap();
        let events = read_events(temp.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "handoff");
    }

    #[test]
    fn test_filter_by_agent() {
        let events = vec![
            TownEvent::new("sling").with_actor("acme/fox"),
            TownEvent::new("sling").with_actor("acme/badger"),
            TownEvent::new("done").with_actor("acme/fox/"),
            TownEvent::new("boot"),
        ];
        let filtered = filter_events(
            events,
            &EventFilter {
                agent: Some("acme/fox".to_string()),
                event_type: None,
            },
        );
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[1].event_type, "done");
    }

    #[test]
    fn test_read_since_offset() {
        let temp = TempDir::new().unwrap();
        log_event(temp.path(), &TownEvent::new("one")).unwrap();
        let offset = feed_len(temp.path()).unwrap();

        let (events, next) = read_events_since(temp.path(), offset).unwrap();
        assert!(events.is_empty());
        assert_eq!(next, offset);

        log_event(temp.path(), &TownEvent::new("two")).unwrap();
        let (events, next) = read_events_since(temp.path(), offset).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "two");
        assert_eq!(next, feed_len(temp.path()).unwrap());
    }

    #[test]
    fn test_read_since_leaves_partial_line() {
        let temp = TempDir::new().unwrap();
        log_event(temp.path(), &TownEvent::new("one")).unwrap();
        let full = feed_len(temp.path()).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(events_path(temp.path()))
            .unwrap();
        write!(file, "{{\"ts\":\"2026-01-02T03:04:05Z\"").unwrap();

        let (events, next) = read_events_since(temp.path(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(next, full);
    }

    #[test]
    fn test_invalid_utf8_line_skipped() {
        let temp = TempDir::new().unwrap();
        log_event(temp.path(), &TownEvent::new("one")).unwrap();
        let offset = feed_len(temp.path()).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(events_path(temp.path()))
            .unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        log_event(temp.path(), &TownEvent::new("two")).unwrap();

        let all = read_events(temp.path()).unwrap();
        let types: Vec<&str> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["one", "two"]);

        let (events, next) = read_events_since(temp.path(), offset).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "two");
        assert_eq!(next, feed_len(temp.path()).unwrap());
    }

    #[test]
    fn test_read_since_after_truncation() {
        let temp = TempDir::new().unwrap();
        log_event(temp.path(), &TownEvent::new("one")).unwrap();
        log_event(temp.path(), &TownEvent::new("two")).unwrap();
        let offset = feed_len(temp.path()).unwrap();

        std::fs::write(events_path(temp.path()), "").unwrap();
        log_event(temp.path(), &TownEvent::new("three")).unwrap();

        let (events, _) = read_events_since(temp.path(), offset).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "three");
    }
}
