//! Real-time channel message types.
//!
//! Observers connect to `/api/v1/ws` and receive JSON envelopes:
//!
//! ```json
//! {"type": "agent_update", "timestamp": "2026-01-31T22:00:00Z", "payload": {...}}
//! ```
//!
//! Every message type belongs to one [`Topic`]. An observer starts out
//! subscribed to [`Topic::All`] and narrows its subscription by sending:
//!
//! ```json
//! {"topics": ["agents", "convoys"]}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::models::IssueStatus;
use crate::status::{AgentRuntime, ConvoyInfo};

// ============================================================================
// Topics
// ============================================================================

/// Category of real-time messages an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Wildcard: every message
    All,
    Status,
    Agents,
    Convoys,
    MailQueue,
    Events,
}

impl Topic {
    /// Parse a topic name. `mq` is accepted for `mail-queue`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "all" => Some(Self::All),
            "status" => Some(Self::Status),
            "agents" => Some(Self::Agents),
            "convoys" => Some(Self::Convoys),
            "mail-queue" | "mq" => Some(Self::MailQueue),
            "events" => Some(Self::Events),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Status => "status",
            Self::Agents => "agents",
            Self::Convoys => "convoys",
            Self::MailQueue => "mail-queue",
            Self::Events => "events",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a subscription set admits a topic.
pub fn is_subscribed(topics: &HashSet<Topic>, topic: Topic) -> bool {
    topics.contains(&Topic::All) || topics.contains(&topic)
}

// ============================================================================
// Server -> Observer
// ============================================================================

/// Type tag of a [`WsMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AgentUpdate,
    StatusUpdate,
    ConvoyUpdate,
    /// Reserved for merge-queue activity on the `mail-queue` topic. No
    /// producer emits it yet; observers may subscribe ahead of one.
    MqUpdate,
    Event,
}

impl MessageType {
    pub fn topic(&self) -> Topic {
        match self {
            Self::AgentUpdate => Topic::Agents,
            Self::StatusUpdate => Topic::Status,
            Self::ConvoyUpdate => Topic::Convoys,
            Self::MqUpdate => Topic::MailQueue,
            Self::Event => Topic::Events,
        }
    }
}

/// Envelope for every message sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl WsMessage {
    /// Wrap a payload, stamped with the current time.
    pub fn new(message_type: MessageType, payload: impl Serialize) -> crate::Result<Self> {
        Ok(Self {
            message_type,
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn topic(&self) -> Topic {
        self.message_type.topic()
    }
}

/// Classification of an agent change between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Connected,
    Disconnected,
    Started,
    Stopped,
    WorkAssigned,
    WorkCompleted,
    StateChanged,
    Updated,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::WorkAssigned => "work_assigned",
            Self::WorkCompleted => "work_completed",
            Self::StateChanged => "state_changed",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `agent_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdatePayload {
    pub address: String,
    pub running: bool,
    pub has_work: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_bead: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub change_type: ChangeType,
}

/// Payload of a `convoy_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvoyUpdatePayload {
    pub id: String,
    pub status: IssueStatus,
    pub completed: usize,
    pub total: usize,
    pub progress: f64,
}

impl From<&ConvoyInfo> for ConvoyUpdatePayload {
    fn from(convoy: &ConvoyInfo) -> Self {
        Self {
            id: convoy.id.clone(),
            status: convoy.status.clone(),
            completed: convoy.completed,
            total: convoy.total,
            progress: convoy.progress,
        }
    }
}

/// The fields of an agent the change detector compares between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub running: bool,
    pub has_work: bool,
    pub hook_bead: Option<String>,
    pub state: Option<String>,
    pub work_title: Option<String>,
}

impl From<&AgentRuntime> for AgentSnapshot {
    fn from(agent: &AgentRuntime) -> Self {
        Self {
            running: agent.running,
            has_work: agent.has_work,
            hook_bead: agent.hook_bead.clone(),
            state: agent.state.clone(),
            work_title: agent.work_title.clone(),
        }
    }
}

impl AgentSnapshot {
    pub fn to_payload(&self, address: &str, change_type: ChangeType) -> AgentUpdatePayload {
        AgentUpdatePayload {
            address: address.to_string(),
            running: self.running,
            has_work: self.has_work,
            hook_bead: self.hook_bead.clone(),
            work_title: self.work_title.clone(),
            state: self.state.clone(),
            change_type,
        }
    }
}

// ============================================================================
// Observer -> Server
// ============================================================================

/// Subscription update sent by an observer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub topics: Vec<String>,
}

impl ClientMessage {
    /// The recognized topics listed; unknown names are dropped.
    pub fn recognized_topics(&self) -> HashSet<Topic> {
        self.topics.iter().filter_map(|t| Topic::parse(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse() {
        assert_eq!(Topic::parse("agents"), Some(Topic::Agents));
        assert_eq!(Topic::parse("mq"), Some(Topic::MailQueue));
        assert_eq!(Topic::parse("mail-queue"), Some(Topic::MailQueue));
        assert_eq!(Topic::parse("bogus"), None);
    }

    #[test]
    fn test_every_type_has_a_topic() {
        assert_eq!(MessageType::AgentUpdate.topic(), Topic::Agents);
        assert_eq!(MessageType::StatusUpdate.topic(), Topic::Status);
        assert_eq!(MessageType::ConvoyUpdate.topic(), Topic::Convoys);
        assert_eq!(MessageType::MqUpdate.topic(), Topic::MailQueue);
        assert_eq!(MessageType::Event.topic(), Topic::Events);
    }

    #[test]
    fn test_reserved_mq_update_wire_name() {
        let message = WsMessage::new(MessageType::MqUpdate, serde_json::json!({})).unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "mq_update");
        assert_eq!(message.topic(), Topic::MailQueue);
    }

    #[test]
    fn test_wildcard_subscription() {
        let all: HashSet<Topic> = [Topic::All].into();
        let agents: HashSet<Topic> = [Topic::Agents].into();
        assert!(is_subscribed(&all, Topic::Events));
        assert!(is_subscribed(&agents, Topic::Agents));
        assert!(!is_subscribed(&agents, Topic::Convoys));
    }

    #[test]
    fn test_envelope_json() {
        let snapshot = AgentSnapshot {
            running: true,
            has_work: true,
            hook_bead: Some("gt-42".to_string()),
            ..Default::default()
        };
        let msg = WsMessage::new(
            MessageType::AgentUpdate,
            snapshot.to_payload("acme/fox", ChangeType::WorkAssigned),
        )
        .unwrap();

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "agent_update");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["payload"]["address"], "acme/fox");
        assert_eq!(json["payload"]["change_type"], "work_assigned");
        assert_eq!(json["payload"]["hook_bead"], "gt-42");
        assert!(json["payload"].get("state").is_none());
    }

    #[test]
    fn test_client_message_drops_unknown_topics() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"topics":["agents","nope","mq"]}"#).unwrap();
        let topics = msg.recognized_topics();
        assert_eq!(topics, [Topic::Agents, Topic::MailQueue].into());
    }
}
