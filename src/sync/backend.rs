//! Remote session operations
//!
//! The same five operations travel over the live channel
//! ([`ChannelBackend`]) or the point-to-point fallback
//! ([`super::http::HttpBackend`]) with identical payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::session::{Change, Snapshot};
use crate::channel::ConnectionManager;
use crate::error::Result;

/// Request type: create a session
pub const SESSION_CREATE: &str = "session:create";
/// Request type: check a stored session id
pub const SESSION_VALIDATE: &str = "session:validate";
/// Request type: push pending changes
pub const SESSION_SYNC: &str = "session:sync";
/// Request type: close a session
pub const SESSION_END: &str = "session:end";
/// Request type: persist a chat message
pub const MESSAGE_SAVE: &str = "message:save";

/// A session as the remote side describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Assigned identifier
    pub session_id: String,
    /// Remote snapshot
    #[serde(default)]
    pub snapshot: Snapshot,
}

/// Answer to a validation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    /// Whether the id may be resumed
    pub valid: bool,
    /// Remote snapshot when valid
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
}

/// Pending changes pushed in one flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Target session
    pub session_id: String,
    /// Changes, oldest first
    pub changes: Vec<Change>,
    /// Local snapshot after applying `changes`
    pub snapshot: Snapshot,
}

/// Acknowledgement of a flush
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncAck {
    /// Remote snapshot after applying the changes, if the remote sends it
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
}

/// A chat transcript entry to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role (`user`, `assistant`, ...)
    pub role: String,
    /// Message text
    pub content: String,
    /// When the message was produced
    pub timestamp: DateTime<Utc>,
    /// Free-form extras
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl ChatMessage {
    /// Message stamped now, without metadata.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Value::Null,
        }
    }
}

/// Remote store of sessions.
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the transport can carry a request right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Create a session seeded with `initial`.
    async fn create(&self, initial: &Snapshot) -> Result<SessionInfo>;

    /// Check whether `session_id` may be resumed.
    async fn validate(&self, session_id: &str) -> Result<Validation>;

    /// Push pending changes.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncAck>;

    /// Close a session.
    async fn end(&self, session_id: &str) -> Result<()>;

    /// Persist one chat message.
    async fn save_message(&self, session_id: &str, message: &ChatMessage) -> Result<()>;
}

/// Sessions over the live channel's correlated requests.
#[derive(Debug, Clone)]
pub struct ChannelBackend {
    manager: ConnectionManager,
    timeout: Option<Duration>,
}

impl ChannelBackend {
    /// Use `manager` with its default request timeout.
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            timeout: None,
        }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait::async_trait]
impl SessionBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn is_available(&self) -> bool {
        self.manager.is_connected()
    }

    async fn create(&self, initial: &Snapshot) -> Result<SessionInfo> {
        self.manager
            .request(SESSION_CREATE, json!({ "snapshot": initial }), self.timeout)
            .await
    }

    async fn validate(&self, session_id: &str) -> Result<Validation> {
        self.manager
            .request(
                SESSION_VALIDATE,
                json!({ "sessionId": session_id }),
                self.timeout,
            )
            .await
    }

    async fn sync(&self, request: &SyncRequest) -> Result<SyncAck> {
        let ack: Option<SyncAck> = self
            .manager
            .request(SESSION_SYNC, request, self.timeout)
            .await?;
        Ok(ack.unwrap_or_default())
    }

    async fn end(&self, session_id: &str) -> Result<()> {
        let _: Value = self
            .manager
            .request(SESSION_END, json!({ "sessionId": session_id }), self.timeout)
            .await?;
        Ok(())
    }

    async fn save_message(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        let _: Value = self
            .manager
            .request(
                MESSAGE_SAVE,
                json!({ "sessionId": session_id, "message": message }),
                self.timeout,
            )
            .await?;
        Ok(())
    }
}
