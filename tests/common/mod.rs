//! Shared helpers for integration tests
//!
//! [`FakeBackend`] plays the server side of every connection a
//! [`FakeConnector`] opens: it records frames, answers session requests and
//! heartbeats, and can drop the connection or push frames on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatlink::channel::transport::fake::{FakeConnector, FakePeer, FakeServer};
use chatlink::config::{ConnectionConfig, SyncConfig};
use chatlink::ConnectionManager;

pub const ENDPOINT: &str = "ws://fake/ws";

enum Control {
    HangUp,
    Push(Value),
}

#[derive(Default)]
struct BackendState {
    frames: Mutex<Vec<Value>>,
    sessions: Mutex<HashMap<String, Value>>,
    responding: AtomicBool,
    next_session: AtomicU32,
    connections: AtomicU32,
}

/// Scripted server answering every accepted fake connection.
pub struct FakeBackend {
    state: Arc<BackendState>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeBackend {
    /// Serve every connection accepted by `server`.
    pub fn spawn(server: FakeServer) -> Self {
        let state = Arc::new(BackendState::default());
        state.responding.store(true, Ordering::SeqCst);
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(server, Arc::clone(&state), control_rx));
        Self {
            state,
            control,
            task,
        }
    }

    /// Every frame received so far, batch members included.
    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().unwrap().clone()
    }

    /// Frames of one `type`.
    pub fn frames_of(&self, frame_type: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["type"] == frame_type)
            .collect()
    }

    /// Number of frames of one `type`.
    pub fn count(&self, frame_type: &str) -> usize {
        self.frames_of(frame_type).len()
    }

    /// Stop answering requests and heartbeats (frames are still recorded).
    pub fn set_responding(&self, responding: bool) {
        self.state.responding.store(responding, Ordering::SeqCst);
    }

    /// Close the current connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.control.send(Control::HangUp);
    }

    /// Push a frame to the client on the current connection.
    pub fn push(&self, frame: Value) {
        let _ = self.control.send(Control::Push(frame));
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Register a session id that `session:validate` accepts.
    pub fn add_session(&self, session_id: &str, snapshot: Value) {
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), snapshot);
    }

    /// Snapshot last synced for `session_id`.
    pub fn session_snapshot(&self, session_id: &str) -> Option<Value> {
        self.state.sessions.lock().unwrap().get(session_id).cloned()
    }
}

async fn serve(
    mut server: FakeServer,
    state: Arc<BackendState>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    while let Some(mut peer) = server.accept().await {
        state.connections.fetch_add(1, Ordering::SeqCst);
        loop {
            tokio::select! {
                frame = peer.recv() => match frame {
                    Some(frame) => handle_frame(&state, &peer, frame),
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(Control::HangUp) => {
                        peer.hang_up();
                        break;
                    }
                    Some(Control::Push(frame)) => {
                        peer.send(frame);
                    }
                    None => return,
                },
            }
        }
    }
}

fn handle_frame(state: &BackendState, peer: &FakePeer, frame: Value) {
    if frame["type"] == "batch" {
        if let Some(messages) = frame["messages"].as_array() {
            for message in messages.clone() {
                handle_frame(state, peer, message);
            }
        }
        return;
    }

    state.frames.lock().unwrap().push(frame.clone());
    if !state.responding.load(Ordering::SeqCst) {
        return;
    }

    let frame_type = frame["type"].as_str().unwrap_or_default();
    if frame_type == "ping" {
        peer.send(json!({ "type": "pong", "timestamp": frame["timestamp"] }));
        return;
    }
    let Some(request_id) = frame.get("requestId").cloned() else {
        return;
    };

    let payload = &frame["payload"];
    let (success, data) = match frame_type {
        "session:create" => {
            let n = state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("session-{n}");
            let snapshot = payload.get("snapshot").cloned().unwrap_or(json!({}));
            state
                .sessions
                .lock()
                .unwrap()
                .insert(session_id.clone(), snapshot.clone());
            (true, json!({ "sessionId": session_id, "snapshot": snapshot }))
        }
        "session:validate" => {
            let sessions = state.sessions.lock().unwrap();
            let id = payload["sessionId"].as_str().unwrap_or_default();
            match sessions.get(id) {
                Some(snapshot) => (true, json!({ "valid": true, "snapshot": snapshot })),
                None => (true, json!({ "valid": false })),
            }
        }
        "session:sync" => {
            let id = payload["sessionId"].as_str().unwrap_or_default().to_string();
            let snapshot = payload["snapshot"].clone();
            state
                .sessions
                .lock()
                .unwrap()
                .insert(id, snapshot.clone());
            (true, json!({ "snapshot": snapshot }))
        }
        "session:end" | "message:save" | "health:check" => (true, json!({})),
        _ => (false, Value::Null),
    };

    let mut response = json!({
        "type": "response",
        "requestId": request_id,
        "success": success,
        "data": data,
    });
    if !success {
        response["error"] = json!(format!("unsupported request type {frame_type}"));
    }
    peer.send(response);
}

/// Connection settings with short, deterministic timings.
pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        endpoint: ENDPOINT.to_string(),
        heartbeat_interval_ms: 1_000,
        heartbeat_timeout_ms: 3_000,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 1_000,
        max_reconnect_attempts: 3,
        reconnect_jitter: 0.0,
        request_timeout_ms: 5_000,
        ..ConnectionConfig::default()
    }
}

/// Sync settings with short, deterministic timings.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 200,
        max_wait_ms: 1_000,
        auto_sync_interval_ms: 60_000,
        retry_delay_ms: 200,
        max_retries: 2,
    }
}

/// Manager over a fake connector, served by a fresh [`FakeBackend`].
pub fn manager(config: ConnectionConfig) -> (ConnectionManager, FakeConnector, FakeBackend) {
    let (connector, server) = FakeConnector::new();
    let manager = ConnectionManager::new(config, Arc::new(connector.clone()));
    (manager, connector, FakeBackend::spawn(server))
}

/// Poll `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
