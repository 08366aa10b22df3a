//! Change detector.
//!
//! Polls a fast-mode snapshot on a fixed interval, diffs it against the
//! previous poll and emits one message per observed change:
//!
//! - `agent_update` for each agent that appeared, disappeared or changed;
//! - `status_update` when the summary counts change;
//! - `convoy_update` for convoys that appear or change status or completion;
//! - `event` for each line appended to the town feed since the last poll.
//!
//! The previous snapshot lives in the detector and is locked for the whole
//! read-compare-replace of one cycle, so cycles never interleave.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::hub::HubHandle;
use super::protocol::{
    AgentSnapshot, ChangeType, ConvoyUpdatePayload, MessageType, WsMessage,
};
use crate::config::resolver::MIN_POLL_INTERVAL;
use crate::models::IssueStatus;
use crate::status::{ConvoyInfo, ConvoyReader, ConvoyStatusFilter, StatusBuilder, StatusSummary, TownStatus};
use crate::townlog::{self, TownEvent};
use crate::{Error, Result};

/// Agent address to compared fields.
pub type AgentSnapshots = BTreeMap<String, AgentSnapshot>;

/// Where detected changes go. Emission must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, message: WsMessage);
}

impl EventSink for HubHandle {
    fn emit(&self, message: WsMessage) {
        self.publish(message);
    }
}

/// Collects emitted messages in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: StdMutex<Vec<WsMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything emitted so far.
    pub fn take(&self) -> Vec<WsMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl EventSink for MemorySink {
    fn emit(&self, message: WsMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

/// One classified agent difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentChange {
    pub address: String,
    pub change_type: ChangeType,
    /// New values; the last known values for a disconnected agent
    pub snapshot: AgentSnapshot,
}

/// Compared fields of every agent in a status.
pub fn snapshot_agents(status: &TownStatus) -> AgentSnapshots {
    status
        .all_agents()
        .map(|agent| (agent.address.clone(), AgentSnapshot::from(agent)))
        .collect()
}

/// Classify a change between two differing snapshots of one agent.
///
/// Liveness wins over hook, hook over state.
pub fn classify(prev: &AgentSnapshot, next: &AgentSnapshot) -> ChangeType {
    if prev.running != next.running {
        return if next.running {
            ChangeType::Started
        } else {
            ChangeType::Stopped
        };
    }
    if prev.hook_bead != next.hook_bead {
        return if next.hook_bead.as_deref().is_some_and(|h| !h.is_empty()) {
            ChangeType::WorkAssigned
        } else {
            ChangeType::WorkCompleted
        };
    }
    if prev.state != next.state {
        return ChangeType::StateChanged;
    }
    ChangeType::Updated
}

/// Every change from `prev` to `next`, in address order with
/// disconnections last. Pure: the same inputs give the same output.
pub fn diff_snapshots(prev: &AgentSnapshots, next: &AgentSnapshots) -> Vec<AgentChange> {
    let mut changes = Vec::new();

    for (address, current) in next {
        let change_type = match prev.get(address) {
            None => ChangeType::Connected,
            Some(previous) if previous != current => classify(previous, current),
            Some(_) => continue,
        };
        changes.push(AgentChange {
            address: address.clone(),
            change_type,
            snapshot: current.clone(),
        });
    }

    for (address, previous) in prev {
        if !next.contains_key(address) {
            changes.push(AgentChange {
                address: address.clone(),
                change_type: ChangeType::Disconnected,
                snapshot: previous.clone(),
            });
        }
    }

    changes
}

/// Convoy fields whose change is broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConvoyMark {
    status: IssueStatus,
    completed: usize,
    total: usize,
}

impl From<&ConvoyInfo> for ConvoyMark {
    fn from(convoy: &ConvoyInfo) -> Self {
        Self {
            status: convoy.status.clone(),
            completed: convoy.completed,
            total: convoy.total,
        }
    }
}

enum FeedRead {
    /// First poll: remember where the feed ends
    Start(u64),
    New(Vec<TownEvent>, u64),
    Unavailable,
}

/// Everything read in one poll, before diffing.
struct Observation {
    status: TownStatus,
    convoys: Option<Vec<ConvoyInfo>>,
    feed: FeedRead,
}

fn observe(builder: &StatusBuilder, feed_offset: Option<u64>) -> Result<Observation> {
    let status = builder.build(true)?;

    let config = builder.load_config();
    let convoys = match ConvoyReader::new(builder.town_root(), &config, builder.stores().as_ref())
        .list(&ConvoyStatusFilter::All)
    {
        Ok(convoys) => Some(convoys),
        Err(e) => {
            tracing::debug!(error = %e, "convoy poll failed");
            None
        }
    };

    let root = builder.town_root();
    let feed = match feed_offset {
        None => townlog::feed_len(root).map(FeedRead::Start),
        Some(offset) => townlog::read_events_since(root, offset)
            .map(|(events, next)| FeedRead::New(events, next)),
    }
    .unwrap_or_else(|e| {
        tracing::debug!(error = %e, "feed poll failed");
        FeedRead::Unavailable
    });

    Ok(Observation {
        status,
        convoys,
        feed,
    })
}

fn push_message(out: &mut Vec<WsMessage>, message_type: MessageType, payload: impl Serialize) {
    match WsMessage::new(message_type, payload) {
        Ok(message) => out.push(message),
        Err(e) => tracing::warn!(error = %e, ?message_type, "could not encode message"),
    }
}

/// Previous poll, owned by one detector.
#[derive(Debug, Default)]
struct DetectorState {
    agents: AgentSnapshots,
    summary: Option<StatusSummary>,
    convoys: BTreeMap<String, ConvoyMark>,
    feed_offset: Option<u64>,
}

impl DetectorState {
    /// Diff an observation against the previous one, then replace it.
    fn apply(&mut self, observed: Observation) -> Vec<WsMessage> {
        let mut out = Vec::new();

        let agents = snapshot_agents(&observed.status);
        for change in diff_snapshots(&self.agents, &agents) {
            tracing::info!(address = %change.address, change = %change.change_type, "agent change");
            push_message(
                &mut out,
                MessageType::AgentUpdate,
                change.snapshot.to_payload(&change.address, change.change_type),
            );
        }
        self.agents = agents;

        let summary = observed.status.summary;
        if self.summary != Some(summary) {
            push_message(&mut out, MessageType::StatusUpdate, summary);
            self.summary = Some(summary);
        }

        if let Some(convoys) = observed.convoys {
            let mut marks = BTreeMap::new();
            for convoy in &convoys {
                let mark = ConvoyMark::from(convoy);
                if self.convoys.get(&convoy.id) != Some(&mark) {
                    tracing::debug!(convoy = %convoy.id, "convoy change");
                    push_message(
                        &mut out,
                        MessageType::ConvoyUpdate,
                        ConvoyUpdatePayload::from(convoy),
                    );
                }
                marks.insert(convoy.id.clone(), mark);
            }
            self.convoys = marks;
        }

        match observed.feed {
            FeedRead::Start(offset) => self.feed_offset = Some(offset),
            FeedRead::New(events, offset) => {
                for event in events {
                    push_message(&mut out, MessageType::Event, event);
                }
                self.feed_offset = Some(offset);
            }
            FeedRead::Unavailable => {}
        }

        out
    }
}

/// Polls snapshots and emits what changed.
pub struct ChangeDetector {
    builder: Arc<StatusBuilder>,
    sink: Arc<dyn EventSink>,
    state: Mutex<DetectorState>,
}

impl ChangeDetector {
    pub fn new(builder: Arc<StatusBuilder>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            builder,
            sink,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Run one cycle. Returns how many messages were emitted.
    ///
    /// A failed build leaves the previous snapshot in place.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut state = self.state.lock().await;

        let builder = Arc::clone(&self.builder);
        let feed_offset = state.feed_offset;
        let observed = tokio::task::spawn_blocking(move || observe(&builder, feed_offset))
            .await
            .map_err(|e| Error::Other(format!("poll task failed: {}", e)))??;

        let messages = state.apply(observed);
        let count = messages.len();
        for message in messages {
            self.sink.emit(message);
        }
        Ok(count)
    }

    /// Poll immediately, then every `interval` (at least one second), until
    /// stopped.
    pub fn start(self: Arc<Self>, interval: Duration) -> DetectorHandle {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "change detector started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            tracing::warn!(error = %e, "poll cycle failed");
                        }
                    }
                }
            }
            tracing::info!("change detector stopped");
        });

        DetectorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Running detector loop.
pub struct DetectorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DetectorHandle {
    /// Stop ticking and wait for an in-flight cycle to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "change detector task failed");
        }
    }
}
