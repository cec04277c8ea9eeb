//! Persistent duplex channel to the backend
//!
//! [`ConnectionManager`] owns the socket and everything around it: heartbeat,
//! reconnect with backoff, outbound rate limiting and queueing, low-priority
//! batching, and request/response correlation. Dependents observe it through
//! [`ChannelEvent`] subscriptions and a status watch.

pub mod backoff;
pub mod frame;
pub mod manager;
pub mod outbound;
pub mod rate_limit;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::stream::event::ExecutionEvent;

pub use manager::ConnectionManager;

/// Health of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected, not trying
    Disconnected,
    /// Explicit connect in progress
    Connecting,
    /// Channel open
    Connected,
    /// Lost unexpectedly; reconnect scheduled
    Reconnecting,
    /// Reconnect attempts exhausted; waits for an explicit connect
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything the channel publishes to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Status transition
    StatusChanged {
        /// Status before the transition
        previous: ConnectionStatus,
        /// Status after the transition
        current: ConnectionStatus,
    },
    /// Execution lifecycle event
    Execution(ExecutionEvent),
    /// Server-pushed session snapshot
    SessionUpdate {
        /// Session the snapshot belongs to
        session_id: String,
        /// Full remote snapshot
        snapshot: Map<String, Value>,
    },
    /// Any other inbound frame
    Message(Value),
    /// Outbound frames discarded by the overflow policy
    FramesDropped {
        /// Number of frames lost
        count: usize,
    },
}
