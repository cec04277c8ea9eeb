//! Event to fragment lookup
//!
//! Rules are keyed by `(type, subtype, status)`; a status of `*` matches any
//! status. An exact status match wins over the wildcard. Events without a
//! matching rule, or whose rule renders to nothing, are dropped.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use super::event::{EventKind, ExecutionEvent};

/// Wildcard status
pub const ANY_STATUS: &str = "*";

/// One formatted piece of narrative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Text to reveal
    pub content: String,
    /// Replace everything revealed so far instead of appending
    pub overwrite: bool,
}

impl Fragment {
    /// Fragment appended after the separator.
    pub fn append(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            overwrite: false,
        }
    }

    /// Fragment replacing the buffer.
    pub fn overwrite(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            overwrite: true,
        }
    }
}

/// How a matched event becomes text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Render {
    /// The event's own text ([`ExecutionEvent::text`])
    Text,
    /// `{field}` placeholders filled from the payload; `{text}` is the event text
    Template(String),
}

/// A lookup entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRule {
    /// How to render
    pub render: Render,
    /// Whether the fragment replaces the buffer
    pub overwrite: bool,
}

impl FormatRule {
    /// Append the event text.
    pub fn text() -> Self {
        Self {
            render: Render::Text,
            overwrite: false,
        }
    }

    /// Append a rendered template.
    pub fn template(template: impl Into<String>) -> Self {
        Self {
            render: Render::Template(template.into()),
            overwrite: false,
        }
    }

    /// Make this rule replace the buffer.
    pub fn replacing(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

type RuleKey = (EventKind, String, String);

/// `(type, subtype, status)` lookup table
#[derive(Debug, Clone)]
pub struct FormatTable {
    rules: HashMap<RuleKey, FormatRule>,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid")
    })
}

impl Default for FormatTable {
    /// Progress, chat and decision narration from every source, and a final
    /// answer that supersedes the narration.
    fn default() -> Self {
        let mut table = Self::empty();
        for kind in [
            EventKind::Execution,
            EventKind::Agent,
            EventKind::Tool,
            EventKind::Node,
        ] {
            table.insert(kind, "progress", ANY_STATUS, FormatRule::text());
        }
        table.insert(EventKind::Agent, "chat", ANY_STATUS, FormatRule::text());
        table.insert(EventKind::Agent, "decision", ANY_STATUS, FormatRule::text());
        table.insert(EventKind::Node, "decision", ANY_STATUS, FormatRule::text());
        table.insert(EventKind::Tool, "end", ANY_STATUS, FormatRule::text());
        table.insert(
            EventKind::Agent,
            "answer",
            ANY_STATUS,
            FormatRule::text().replacing(),
        );
        table.insert(
            EventKind::Execution,
            "answer",
            ANY_STATUS,
            FormatRule::text().replacing(),
        );
        table
    }
}

impl FormatTable {
    /// A table without rules.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Add or replace a rule. `status` may be [`ANY_STATUS`].
    pub fn insert(&mut self, kind: EventKind, subtype: &str, status: &str, rule: FormatRule) {
        self.rules
            .insert((kind, subtype.to_string(), status.to_string()), rule);
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn lookup(&self, event: &ExecutionEvent) -> Option<&FormatRule> {
        let exact = (event.kind, event.subtype.clone(), event.status.clone());
        self.rules.get(&exact).or_else(|| {
            self.rules
                .get(&(event.kind, event.subtype.clone(), ANY_STATUS.to_string()))
        })
    }

    /// Map an event to a fragment, or `None` if it has no user-facing text.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatlink::stream::event::{EventKind, ExecutionEvent};
    /// use chatlink::stream::format::{FormatTable, Fragment};
    /// use serde_json::json;
    ///
    /// let table = FormatTable::default();
    /// let event = ExecutionEvent::new(EventKind::Agent, "progress", "", json!("Reading files"));
    /// assert_eq!(table.format(&event), Some(Fragment::append("Reading files")));
    /// ```
    pub fn format(&self, event: &ExecutionEvent) -> Option<Fragment> {
        let rule = self.lookup(event)?;
        let content = match &rule.render {
            Render::Text => event.text()?.to_string(),
            Render::Template(template) => self.render_template(template, event),
        };
        if content.trim().is_empty() {
            return None;
        }
        Some(Fragment {
            content,
            overwrite: rule.overwrite,
        })
    }

    fn render_template(&self, template: &str, event: &ExecutionEvent) -> String {
        placeholder()
            .replace_all(template, |caps: &Captures| {
                let name = &caps[1];
                if name == "text" {
                    return event.text().unwrap_or_default().to_string();
                }
                match event.data.get(name) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, subtype: &str, status: &str, data: Value) -> ExecutionEvent {
        ExecutionEvent::new(kind, subtype, status, data)
    }

    #[test]
    fn test_default_progress_appends_text() {
        let table = FormatTable::default();
        let fragment = table
            .format(&event(EventKind::Node, "progress", "running", json!({ "message": "X" })))
            .unwrap();
        assert_eq!(fragment, Fragment::append("X"));
    }

    #[test]
    fn test_answer_overwrites() {
        let table = FormatTable::default();
        let fragment = table
            .format(&event(EventKind::Agent, "answer", "", json!({ "answer": "42" })))
            .unwrap();
        assert!(fragment.overwrite);
        assert_eq!(fragment.content, "42");
    }

    #[test]
    fn test_unmapped_event_is_dropped() {
        let table = FormatTable::default();
        assert!(table
            .format(&event(EventKind::Tool, "heartbeat", "", json!("tick")))
            .is_none());
    }

    #[test]
    fn test_empty_text_is_dropped() {
        let table = FormatTable::default();
        assert!(table
            .format(&event(EventKind::Agent, "chat", "", json!({ "message": "   " })))
            .is_none());
        assert!(table
            .format(&event(EventKind::Agent, "chat", "", Value::Null))
            .is_none());
    }

    #[test]
    fn test_exact_status_beats_wildcard() {
        let mut table = FormatTable::default();
        table.insert(
            EventKind::Tool,
            "progress",
            "failed",
            FormatRule::template("Tool {tool} failed: {text}"),
        );

        let failed = table
            .format(&event(
                EventKind::Tool,
                "progress",
                "failed",
                json!({ "tool": "search", "message": "timeout" }),
            ))
            .unwrap();
        assert_eq!(failed.content, "Tool search failed: timeout");

        let running = table
            .format(&event(
                EventKind::Tool,
                "progress",
                "running",
                json!({ "tool": "search", "message": "querying" }),
            ))
            .unwrap();
        assert_eq!(running.content, "querying");
    }

    #[test]
    fn test_template_renders_non_string_fields() {
        let mut table = FormatTable::empty();
        table.insert(
            EventKind::Node,
            "end",
            ANY_STATUS,
            FormatRule::template("Step {step} done ({missing})"),
        );
        let fragment = table
            .format(&event(EventKind::Node, "end", "ok", json!({ "step": 3 })))
            .unwrap();
        assert_eq!(fragment.content, "Step 3 done ()");
    }

    #[test]
    fn test_template_fills_text_and_repeated_fields() {
        let mut table = FormatTable::empty();
        table.insert(
            EventKind::Tool,
            "start",
            ANY_STATUS,
            FormatRule::template("{name}: {text} [{name}] {not-a-field}"),
        );
        let fragment = table
            .clone()
            .format(&event(
                EventKind::Tool,
                "start",
                "",
                json!({ "name": "search", "message": "querying" }),
            ))
            .unwrap();
        assert_eq!(fragment.content, "search: querying [search] {not-a-field}");
    }

    #[test]
    fn test_custom_rule_replaces_default() {
        let mut table = FormatTable::default();
        let before = table.len();
        table.insert(
            EventKind::Agent,
            "chat",
            ANY_STATUS,
            FormatRule::text().replacing(),
        );
        assert_eq!(table.len(), before);
        let fragment = table
            .format(&event(EventKind::Agent, "chat", "", json!("hello")))
            .unwrap();
        assert!(fragment.overwrite);
    }
}
