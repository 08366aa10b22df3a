//! Observer registry and fan-out.
//!
//! One [`Hub`] task owns the registry. Everything else talks to it through a
//! cloneable [`HubHandle`] over a single bounded intake queue, so registry
//! mutation and fan-out are strictly serialized and need no lock.
//!
//! Delivery is best-effort:
//! - a publish that finds the intake queue full is dropped with a warning;
//! - an observer whose outbound queue is full is disconnected on the spot.
//!
//! Neither case ever blocks the publisher.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::protocol::{Topic, WsMessage, is_subscribed};

/// Capacity of the hub's intake queue.
pub const INTAKE_CAPACITY: usize = 256;

/// Capacity of each observer's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// An observer's topic set, shared between its reader and the hub.
pub type Subscriptions = Arc<RwLock<HashSet<Topic>>>;

/// Read a subscription set, recovering from a poisoned lock.
pub fn read_topics(topics: &Subscriptions) -> HashSet<Topic> {
    topics.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Replace a subscription set.
pub fn replace_topics(topics: &Subscriptions, new: HashSet<Topic>) {
    *topics.write().unwrap_or_else(|e| e.into_inner()) = new;
}

enum HubCommand {
    Register {
        id: Uuid,
        outbound: mpsc::Sender<Arc<str>>,
        topics: Subscriptions,
    },
    Unregister(Uuid),
    Publish(WsMessage),
    Count(oneshot::Sender<usize>),
}

/// A registered observer's end of the hub.
///
/// Dropping `outbound`'s sender side (done by the hub on unregister or slow
/// consumer) ends the stream of messages.
pub struct Observer {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub topics: Subscriptions,
}

struct Client {
    outbound: mpsc::Sender<Arc<str>>,
    topics: Subscriptions,
}

/// Cloneable access to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    outbound_capacity: usize,
}

impl HubHandle {
    /// Register a new observer subscribed to every topic.
    ///
    /// Returns `None` when the hub has stopped.
    pub async fn register(&self) -> Option<Observer> {
        let id = Uuid::new_v4();
        let (outbound_tx, outbound) = mpsc::channel(self.outbound_capacity);
        let topics: Subscriptions = Arc::new(RwLock::new(HashSet::from([Topic::All])));
        self.tx
            .send(HubCommand::Register {
                id,
                outbound: outbound_tx,
                topics: Arc::clone(&topics),
            })
            .await
            .ok()?;
        Some(Observer {
            id,
            outbound,
            topics,
        })
    }

    pub async fn unregister(&self, id: Uuid) {
        let _ = self.tx.send(HubCommand::Unregister(id)).await;
    }

    /// Queue a message for fan-out without waiting.
    ///
    /// Returns false when the message was dropped because the intake queue
    /// is full or the hub has stopped.
    pub fn publish(&self, message: WsMessage) -> bool {
        match self.tx.try_send(HubCommand::Publish(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("hub intake queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("hub stopped, message dropped");
                false
            }
        }
    }

    /// Number of registered observers.
    ///
    /// Answered in queue order, so every command sent before this call has
    /// been applied when it returns.
    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Count(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The registry owner. Run it with [`Hub::run`] or [`Hub::spawn`].
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    clients: HashMap<Uuid, Client>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        Self::with_capacity(INTAKE_CAPACITY, OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(intake: usize, outbound: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(intake);
        let hub = Self {
            rx,
            clients: HashMap::new(),
        };
        let handle = HubHandle {
            tx,
            outbound_capacity: outbound,
        };
        (hub, handle)
    }

    /// Start a hub on the current tokio runtime.
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register {
                    id,
                    outbound,
                    topics,
                } => {
                    self.clients.insert(id, Client { outbound, topics });
                    tracing::info!(observer = %id, clients = self.clients.len(), "observer connected");
                }
                HubCommand::Unregister(id) => {
                    if self.clients.remove(&id).is_some() {
                        tracing::info!(observer = %id, clients = self.clients.len(), "observer disconnected");
                    }
                }
                HubCommand::Publish(message) => self.fan_out(&message),
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.clients.len());
                }
            }
        }
        tracing::debug!("hub stopped");
    }

    fn fan_out(&mut self, message: &WsMessage) {
        let encoded: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::warn!(error = %e, "could not encode message");
                return;
            }
        };
        let topic = message.topic();

        let mut dropped = Vec::new();
        for (id, client) in &self.clients {
            if !is_subscribed(&read_topics(&client.topics), topic) {
                continue;
            }
            match client.outbound.try_send(Arc::clone(&encoded)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(observer = %id, "observer queue full, disconnecting slow consumer");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        for id in dropped {
            self.clients.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::protocol::MessageType;

    fn message(message_type: MessageType) -> WsMessage {
        WsMessage::new(message_type, serde_json::json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let hub = Hub::spawn();
        let observer = hub.register().await.unwrap();
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(read_topics(&observer.topics), HashSet::from([Topic::All]));

        hub.unregister(observer.id).await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let hub = Hub::spawn();
        let mut everything = hub.register().await.unwrap();
        let mut convoys_only = hub.register().await.unwrap();
        replace_topics(&convoys_only.topics, HashSet::from([Topic::Convoys]));

        assert!(hub.publish(message(MessageType::AgentUpdate)));
        assert!(hub.publish(message(MessageType::ConvoyUpdate)));
        hub.client_count().await;

        let first = everything.outbound.recv().await.unwrap();
        assert!(first.contains("agent_update"));
        let second = everything.outbound.recv().await.unwrap();
        assert!(second.contains("convoy_update"));

        let only = convoys_only.outbound.recv().await.unwrap();
        assert!(only.contains("convoy_update"));
        assert!(convoys_only.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_disconnected() {
        let (hub, handle) = Hub::with_capacity(INTAKE_CAPACITY, 2);
        tokio::spawn(hub.run());

        let mut slow = handle.register().await.unwrap();
        let mut fast = handle.register().await.unwrap();

        handle.publish(message(MessageType::Event));
        handle.publish(message(MessageType::Event));
        handle.client_count().await;
        fast.outbound.recv().await.unwrap();
        fast.outbound.recv().await.unwrap();

        // `slow` is full; this publish disconnects it and still reaches `fast`.
        assert!(handle.publish(message(MessageType::StatusUpdate)));
        assert_eq!(handle.client_count().await, 1);

        let delivered = fast.outbound.recv().await.unwrap();
        assert!(delivered.contains("status_update"));

        assert!(slow.outbound.recv().await.is_some());
        assert!(slow.outbound.recv().await.is_some());
        assert!(slow.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_intake_drops_publish() {
        let (_hub, handle) = Hub::with_capacity(1, OUTBOUND_CAPACITY);
        assert!(handle.publish(message(MessageType::Event)));
        assert!(!handle.publish(message(MessageType::Event)));
    }

    #[tokio::test]
    async fn test_stopped_hub() {
        let (hub, handle) = Hub::new();
        drop(hub);
        assert!(handle.register().await.is_none());
        assert!(!handle.publish(message(MessageType::Event)));
        assert_eq!(handle.client_count().await, 0);
    }
}
