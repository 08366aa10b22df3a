//! WebSocket handler for live updates

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use uuid::Uuid;

use super::hub::{HubHandle, Observer, Subscriptions, replace_topics};
use super::protocol::ClientMessage;
use super::server::AppState;

/// Largest inbound frame accepted from an observer.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Time allowed to write one frame.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between inbound frames (pongs included).
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping period; shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Apply a subscription message, replacing the topic set.
///
/// Unparsable messages and topic lists with nothing recognized are ignored.
/// Returns whether the subscription changed.
pub fn apply_subscription(topics: &Subscriptions, text: &str) -> bool {
    let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
        return false;
    };
    let recognized = message.recognized_topics();
    if recognized.is_empty() {
        return false;
    }
    tracing::debug!(topics = ?recognized, "observer subscription updated");
    replace_topics(topics, recognized);
    true
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let Some(Observer {
        id,
        outbound,
        topics,
    }) = hub.register().await
    else {
        return;
    };
    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(write_pump(sender, outbound, id));
    let mut recv_task = tokio::spawn(read_pump(receiver, topics, id));

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    hub.unregister(id).await;
}

/// Drain the outbound queue to the socket, coalescing queued messages into
/// one newline-separated frame, and ping periodically.
async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    id: Uuid,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_PERIOD, PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            message = outbound.recv() => match message {
                Some(first) => Message::Text(coalesce(&first, &mut outbound).into()),
                None => {
                    // The hub dropped us: unregistered or too slow.
                    let _ = timeout(WRITE_WAIT, sender.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(WRITE_WAIT, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(observer = %id, error = %e, "write failed");
                return;
            }
            Err(_) => {
                tracing::debug!(observer = %id, "write timed out");
                return;
            }
        }
    }
}

/// Join `first` with every message already waiting in the queue.
fn coalesce(first: &str, outbound: &mut mpsc::Receiver<Arc<str>>) -> String {
    let mut frame = first.to_string();
    while let Ok(next) = outbound.try_recv() {
        frame.push('\n');
        frame.push_str(&next);
    }
    frame
}

/// Read subscription updates until the peer goes quiet or disconnects.
async fn read_pump(mut receiver: SplitStream<WebSocket>, topics: Subscriptions, id: Uuid) {
    loop {
        let message = match timeout(PONG_WAIT, receiver.next()).await {
            Err(_) => {
                tracing::debug!(observer = %id, "no pong within deadline");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(observer = %id, error = %e, "read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                apply_subscription(&topics, text.as_str());
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}
