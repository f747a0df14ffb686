//! Connection lifecycle.

use serde::{Deserialize, Serialize};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where the link currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Device opened, control requests in flight.
    BootstrappingControl,
    /// Reader running, waiting for a `SYNC` to succeed.
    AwaitingSync,
    Synchronized,
}

/// Events broadcast to subscribers of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected { protocol_version: u16 },
    /// The transport failed underneath the reader.
    ConnectionLost { reason: String },
    Disconnected,
}
