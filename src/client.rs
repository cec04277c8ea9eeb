//! Process-wide client handle
//!
//! [`LiveClient`] owns one [`ConnectionManager`], the [`SyncEngine`] that
//! rides on it and an [`ExecutionStreamFormatter`] attached to its event
//! feed. It has an explicit lifecycle: build it, call
//! [`LiveClient::init`], pass clones to whatever needs the channel, and call
//! [`LiveClient::shutdown`] before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::channel::transport::websocket::WebSocketConnector;
use crate::channel::transport::Connector;
use crate::channel::{ConnectionManager, ConnectionStatus};
use crate::config::Config;
use crate::error::{ChatlinkError, Result};
use crate::stream::{ExecutionStreamFormatter, StreamState};
use crate::sync::{ChatMessage, HttpBackend, SessionBackend, SessionStore, SyncEngine};

/// Request type: round-trip probe
pub const HEALTH_CHECK: &str = "health:check";
/// Request type: start an execution for a prompt
pub const EXECUTION_START: &str = "execution:start";

/// Outcome of a prompt execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Execution id assigned by the backend, if any
    pub execution_id: Option<String>,
    /// Final rendered content
    pub content: String,
    /// Terminal artifact, if any
    pub summary: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionAccepted {
    #[serde(default)]
    execution_id: Option<String>,
}

/// Connection, session sync and execution streaming behind one handle.
#[derive(Debug, Clone)]
pub struct LiveClient {
    config: Arc<Config>,
    manager: ConnectionManager,
    engine: SyncEngine,
    formatter: ExecutionStreamFormatter,
}

impl LiveClient {
    /// Client over WebSocket, with the configured store and fallback.
    ///
    /// # Errors
    ///
    /// Invalid stream or fallback settings, or an unopenable store.
    pub fn new(config: Config) -> Result<Self> {
        let store = SessionStore::open(&config.storage)?;
        Self::with_parts(config, Arc::new(WebSocketConnector::new()), Some(store))
    }

    /// Client over an arbitrary connector.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        store: Option<SessionStore>,
    ) -> Result<Self> {
        let manager = ConnectionManager::new(config.connection.clone(), connector);
        let fallback = HttpBackend::from_config(&config.fallback)?
            .map(|backend| Arc::new(backend) as Arc<dyn SessionBackend>);
        let engine = SyncEngine::new(config.sync.clone(), manager.clone(), fallback, store);
        let formatter = ExecutionStreamFormatter::new(config.stream.clone())?;

        Ok(Self {
            config: Arc::new(config),
            manager,
            engine,
            formatter,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The channel.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// The session sync engine.
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// The execution stream formatter.
    pub fn formatter(&self) -> &ExecutionStreamFormatter {
        &self.formatter
    }

    /// Connect, start background sync and activate a session.
    ///
    /// `session_id` is resumed when still valid; otherwise the stored id is
    /// tried, then a new session is created. If the channel cannot be opened
    /// but a fallback transport is configured, the session is initialized
    /// over the fallback while the channel keeps reconnecting.
    pub async fn init(&self, session_id: Option<String>) -> Result<String> {
        if let Err(e) = self.manager.connect(&self.config.connection.endpoint).await {
            if self.config.fallback.base_url.is_none() {
                return Err(e);
            }
            tracing::warn!("Channel unavailable, using fallback transport: {e:#}");
        }
        self.formatter.attach(&self.manager);
        self.engine.start().await;
        self.engine.init_session(session_id).await
    }

    /// Round-trip time of one correlated request.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let _: Value = self
            .manager
            .request(HEALTH_CHECK, json!({}), None)
            .await?;
        Ok(started.elapsed())
    }

    /// Start an execution for `prompt` and wait until its stream finishes.
    ///
    /// The prompt and the final answer are saved as chat messages; failing
    /// to save them is logged, not returned.
    pub async fn run_prompt(&self, prompt: &str) -> Result<ExecutionResult> {
        let session_id = self
            .engine
            .session_id()
            .await
            .ok_or(ChatlinkError::NoSession)?;
        self.save_message(ChatMessage::new("user", prompt)).await;

        // A finished previous execution would satisfy wait_finished at once.
        if matches!(
            self.formatter.state(),
            StreamState::Complete | StreamState::Failed
        ) {
            self.formatter.reset();
            self.formatter.attach(&self.manager);
        }

        let accepted: Option<ExecutionAccepted> = self
            .manager
            .request(
                EXECUTION_START,
                json!({ "sessionId": session_id, "prompt": prompt }),
                None,
            )
            .await?;
        let execution_id = accepted.and_then(|a| a.execution_id);
        tracing::info!(?execution_id, "Execution accepted");

        let content = self.wait_for_execution().await?;
        self.save_message(ChatMessage::new("assistant", content.clone()))
            .await;

        Ok(ExecutionResult {
            execution_id: execution_id.or_else(|| self.formatter.execution_id()),
            content,
            summary: self.formatter.summary(),
        })
    }

    /// Wait for the formatter to finish. A channel lost before the execution
    /// starts streaming fails here; once it streams, the formatter reports
    /// the loss itself after revealing what it has.
    async fn wait_for_execution(&self) -> Result<String> {
        let mut status = self.manager.watch_status();
        let lost_before_start = async {
            loop {
                let current = *status.borrow_and_update();
                if matches!(
                    current,
                    ConnectionStatus::Error | ConnectionStatus::Disconnected
                ) && self.formatter.state() == StreamState::Idle
                {
                    return current;
                }
                if status.changed().await.is_err() {
                    return ConnectionStatus::Disconnected;
                }
            }
        };

        tokio::select! {
            biased;
            result = self.formatter.wait_finished() => result,
            current = lost_before_start => {
                tracing::warn!(%current, "Channel lost before the execution started");
                Err(ChatlinkError::ExecutionFailed(format!("connection {current}")).into())
            }
        }
    }

    async fn save_message(&self, message: ChatMessage) {
        if let Err(e) = self.engine.save_message(&message).await {
            tracing::warn!(role = %message.role, "Failed to save chat message: {e:#}");
        }
    }

    /// Flush pending changes, stop background work and close the channel.
    ///
    /// A failed final flush is logged; the changes stay in the local store
    /// for the next run.
    pub async fn shutdown(&self) -> Result<()> {
        if self.engine.pending_count().await > 0 {
            if let Err(e) = self.engine.flush(true).await {
                tracing::warn!("Final flush failed; changes kept locally: {e:#}");
            }
        }
        self.engine.shutdown().await;
        self.formatter.detach();
        self.manager.disconnect().await
    }
}
