//! Dashboard web surface.
//!
//! - [`server`]: the `/api/v1` router and `gt serve` lifecycle
//! - [`hub`]: observer registry and fan-out
//! - [`broadcaster`]: the change detector feeding the hub
//! - [`protocol`]: message envelopes and topics

pub mod broadcaster;
mod handlers;
pub mod hub;
pub mod protocol;
pub mod server;
mod websocket;

pub use broadcaster::{
    AgentChange, AgentSnapshots, ChangeDetector, DetectorHandle, EventSink, MemorySink, classify,
    diff_snapshots, snapshot_agents,
};
pub use hub::{Hub, HubHandle, Observer};
pub use protocol::{ChangeType, MessageType, Topic, WsMessage};
pub use server::{AppState, ServeOptions, router, start_server};
