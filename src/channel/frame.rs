//! Wire frames exchanged over the live channel
//!
//! Every frame is a JSON object with a string `type` discriminator:
//!
//! ```text
//! request   {"type": <request type>, "requestId": <uuid>, "payload": ...}
//! response  {"type": "response", "requestId": ..., "success": bool, "data"?, "error"?}
//! ping/pong {"type": "ping" | "pong", "timestamp": <ms since epoch>}
//! event     {"type": "execution" | "agent" | "tool" | "node", "subtype", "status", "data", "executionId"?}
//! push      {"type": "session:update", "sessionId": ..., "snapshot": {...}}
//! batch     {"type": "batch", "messages": [<frame>, ...]}
//! ```
//!
//! Anything else is handed to subscribers as an untyped message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::stream::event::{EventKind, ExecutionEvent};

/// Discriminator of correlated responses
pub const RESPONSE: &str = "response";
/// Discriminator of heartbeat probes
pub const PING: &str = "ping";
/// Discriminator of heartbeat acknowledgements
pub const PONG: &str = "pong";
/// Discriminator of aggregated frames
pub const BATCH: &str = "batch";
/// Discriminator of server-pushed session snapshots
pub const SESSION_UPDATE: &str = "session:update";

/// Reply to a correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Correlation id echoed from the request
    pub request_id: String,
    /// Whether the request succeeded
    #[serde(default)]
    pub success: bool,
    /// Result payload
    #[serde(default)]
    pub data: Option<Value>,
    /// Failure reason when `success` is false
    #[serde(default)]
    pub error: Option<String>,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Correlated response
    Response(ResponseFrame),
    /// Heartbeat probe from the remote side
    Ping {
        /// Echoed back in the pong
        timestamp: Option<Value>,
    },
    /// Heartbeat acknowledgement
    Pong,
    /// Aggregated frames, in order
    Batch(Vec<Value>),
    /// Execution lifecycle event
    Execution(ExecutionEvent),
    /// Authoritative session snapshot pushed by the server
    SessionUpdate {
        /// Session the snapshot belongs to
        session_id: String,
        /// Full remote snapshot
        snapshot: Map<String, Value>,
    },
    /// Any other frame
    Message(Value),
}

/// Classify a decoded inbound frame.
///
/// Frames that claim a known type but fail to decode are passed through as
/// [`InboundFrame::Message`] rather than dropped.
pub fn classify(value: Value) -> InboundFrame {
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match frame_type.as_str() {
        RESPONSE => match serde_json::from_value::<ResponseFrame>(value.clone()) {
            Ok(resp) => InboundFrame::Response(resp),
            Err(e) => {
                tracing::warn!("Malformed response frame: {e}");
                InboundFrame::Message(value)
            }
        },
        PING => InboundFrame::Ping {
            timestamp: value.get("timestamp").cloned(),
        },
        PONG => InboundFrame::Pong,
        BATCH => match value.get("messages").and_then(Value::as_array) {
            Some(messages) => InboundFrame::Batch(messages.clone()),
            None => InboundFrame::Message(value),
        },
        SESSION_UPDATE => {
            let session_id = value.get("sessionId").and_then(Value::as_str);
            let snapshot = value.get("snapshot").and_then(Value::as_object);
            match (session_id, snapshot) {
                (Some(id), Some(snapshot)) => InboundFrame::SessionUpdate {
                    session_id: id.to_string(),
                    snapshot: snapshot.clone(),
                },
                _ => InboundFrame::Message(value),
            }
        }
        other if EventKind::parse(other).is_some() => {
            match serde_json::from_value::<ExecutionEvent>(value.clone()) {
                Ok(event) => InboundFrame::Execution(event),
                Err(e) => {
                    tracing::warn!("Malformed {other} event frame: {e}");
                    InboundFrame::Message(value)
                }
            }
        }
        _ => InboundFrame::Message(value),
    }
}

/// Build a correlated request frame.
pub fn request(request_type: &str, request_id: &str, payload: Value) -> Value {
    json!({
        "type": request_type,
        "requestId": request_id,
        "payload": payload,
    })
}

/// Build a heartbeat probe stamped with the current wall-clock time.
pub fn ping() -> Value {
    json!({ "type": PING, "timestamp": chrono::Utc::now().timestamp_millis() })
}

/// Build a heartbeat acknowledgement echoing the probe's timestamp.
pub fn pong(timestamp: Option<Value>) -> Value {
    let timestamp = timestamp.unwrap_or_else(|| json!(chrono::Utc::now().timestamp_millis()));
    json!({ "type": PONG, "timestamp": timestamp })
}

/// Aggregate several frames into one.
pub fn batch(messages: Vec<Value>) -> Value {
    json!({ "type": BATCH, "messages": messages })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response() {
        let frame = classify(json!({
            "type": "response",
            "requestId": "abc",
            "success": true,
            "data": { "ok": 1 }
        }));
        match frame {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.request_id, "abc");
                assert!(resp.success);
                assert_eq!(resp.data, Some(json!({ "ok": 1 })));
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_without_request_id_is_message() {
        let frame = classify(json!({ "type": "response", "success": true }));
        assert!(matches!(frame, InboundFrame::Message(_)));
    }

    #[test]
    fn test_classify_ping_keeps_timestamp() {
        let frame = classify(json!({ "type": "ping", "timestamp": 42 }));
        assert_eq!(
            frame,
            InboundFrame::Ping {
                timestamp: Some(json!(42))
            }
        );
    }

    #[test]
    fn test_classify_event_kinds() {
        for kind in ["execution", "agent", "tool", "node"] {
            let frame = classify(json!({ "type": kind, "subtype": "progress" }));
            assert!(
                matches!(frame, InboundFrame::Execution(ref e) if e.kind.as_str() == kind),
                "kind {kind} not classified as event"
            );
        }
    }

    #[test]
    fn test_classify_session_update() {
        let frame = classify(json!({
            "type": "session:update",
            "sessionId": "s1",
            "snapshot": { "view": "list" }
        }));
        match frame {
            InboundFrame::SessionUpdate {
                session_id,
                snapshot,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(snapshot.get("view"), Some(&json!("list")));
            }
            other => panic!("expected session update, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_batch_preserves_order() {
        let frame = classify(batch(vec![json!({ "type": "a" }), json!({ "type": "b" })]));
        match frame {
            InboundFrame::Batch(messages) => {
                assert_eq!(messages[0]["type"], "a");
                assert_eq!(messages[1]["type"], "b");
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_message() {
        let value = json!({ "type": "notice", "text": "hi" });
        assert_eq!(classify(value.clone()), InboundFrame::Message(value));
    }

    #[test]
    fn test_request_shape() {
        let frame = request("session:sync", "id-1", json!({ "changes": [] }));
        assert_eq!(frame["type"], "session:sync");
        assert_eq!(frame["requestId"], "id-1");
        assert_eq!(frame["payload"]["changes"], json!([]));
    }

    #[test]
    fn test_pong_echoes_timestamp() {
        assert_eq!(pong(Some(json!(7)))["timestamp"], 7);
        assert!(pong(None)["timestamp"].is_i64());
    }
}
