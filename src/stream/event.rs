//! Typed execution-lifecycle events
//!
//! Events arrive on the channel as frames whose `type` is one of
//! `execution`, `agent`, `tool` or `node`. The subtype and status vocabularies
//! are open, so they are kept as strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Source of an execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Whole-task lifecycle
    Execution,
    /// Agent reasoning and chat
    Agent,
    /// Tool invocations
    Tool,
    /// Workflow node transitions
    Node,
}

impl EventKind {
    /// Parse a frame `type` discriminator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(Self::Execution),
            "agent" => Some(Self::Agent),
            "tool" => Some(Self::Tool),
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification from a long-running backend task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// Event source
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Lifecycle marker (`start`, `progress`, `end`, `decision`, `chat`, ...)
    #[serde(default)]
    pub subtype: String,
    /// Status code scoped to `(kind, subtype)`
    #[serde(default)]
    pub status: String,
    /// Opaque payload
    #[serde(default)]
    pub data: Value,
    /// Backend-assigned execution id; may be absent on early events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl ExecutionEvent {
    /// Build an event without an execution id.
    pub fn new(
        kind: EventKind,
        subtype: impl Into<String>,
        status: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            subtype: subtype.into(),
            status: status.into(),
            data,
            execution_id: None,
        }
    }

    /// Attach an execution id.
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    /// `execution/start`
    pub fn is_start(&self) -> bool {
        self.kind == EventKind::Execution && self.subtype == "start"
    }

    /// `execution/end`
    pub fn is_end(&self) -> bool {
        self.kind == EventKind::Execution && self.subtype == "end"
    }

    /// Backend-reported failure of the whole execution.
    pub fn is_failure(&self) -> bool {
        self.kind == EventKind::Execution
            && (self.subtype == "error" || self.status == "error" || self.status == "failed")
    }

    /// Terminal artifact carried by this event, if any.
    ///
    /// Either a `summary` subtype whose data is the artifact, or any event whose
    /// data has a non-null `summary` field.
    pub fn summary(&self) -> Option<&Value> {
        if self.subtype == "summary" && !self.data.is_null() {
            return Some(&self.data);
        }
        self.data.get("summary").filter(|v| !v.is_null())
    }

    /// First non-empty text field of the payload.
    pub fn text(&self) -> Option<&str> {
        if let Some(s) = self.data.as_str() {
            return (!s.is_empty()).then_some(s);
        }
        ["message", "content", "text", "answer"]
            .iter()
            .filter_map(|key| self.data.get(*key).and_then(Value::as_str))
            .find(|s| !s.is_empty())
    }

    /// Human-readable failure reason.
    pub fn error_message(&self) -> String {
        self.data
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| self.text())
            .unwrap_or("execution failed")
            .to_string()
    }
}
