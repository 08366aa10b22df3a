//! Session registry adapter.
//!
//! Agents run as tmux sessions. The status builder asks the registry once per
//! build for the set of live session names and derives every agent's
//! liveness from that set.

pub mod session;

pub use session::{
    DEACON_SESSION, MAYOR_SESSION, refinery_session, rig_agent_session, witness_session,
};

use crate::{Error, Result};
use std::collections::HashSet;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Upper bound on a single `tmux list-sessions` call.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of live session names.
pub trait SessionRegistry: Send + Sync {
    fn list_sessions(&self) -> Result<HashSet<String>>;
}

/// Registry backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    timeout: Duration,
}

impl Default for Tmux {
    fn default() -> Self {
        Self::new()
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
            timeout: LIST_TIMEOUT,
        }
    }

    /// Use a different binary (e.g., a wrapper script).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// stderr fragments tmux prints when no server is running.
fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("error connecting to")
        || stderr.contains("no sessions")
}

fn parse_session_names(stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl SessionRegistry for Tmux {
    fn list_sessions(&self) -> Result<HashSet<String>> {
        let mut child = Command::new(&self.binary)
            .args(["list-sessions", "-F", "#{session_name}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Session(format!("failed to run {}: {}", self.binary, e)))?;

        // Drain pipes on their own threads so a chatty child cannot block on a
        // full pipe while we wait on it.
        let stdout_thread = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_thread = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Session(format!(
                    "{} list-sessions timed out after {}s",
                    self.binary,
                    self.timeout.as_secs()
                )));
            }
            Err(e) => {
                return Err(Error::Session(format!(
                    "failed to wait for {}: {}",
                    self.binary, e
                )));
            }
        };

        let stdout = stdout_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();
        let stderr = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();

        if !status.success() {
            if is_no_server(&stderr) {
                return Ok(HashSet::new());
            }
            return Err(Error::Session(format!(
                "{} list-sessions failed: {}",
                self.binary,
                stderr.trim()
            )));
        }

        Ok(parse_session_names(&stdout))
    }
}

/// Fixed set of sessions, for tests and offline snapshots.
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    sessions: HashSet<String>,
}

impl StaticSessions {
    pub fn new<I, S>(sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sessions: sessions.into_iter().map(Into::into).collect(),
        }
    }
}

impl SessionRegistry for StaticSessions {
    fn list_sessions(&self) -> Result<HashSet<String>> {
        Ok(self.sessions.clone())
    }
}
