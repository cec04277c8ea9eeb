//! Structural noise filtering for execution events
//!
//! Sub-step lifecycle markers (an agent or tool `start`/`end` with nothing to
//! say) carry no user-facing meaning and are dropped before formatting.
//! Execution-level events always pass: the formatter drives its state
//! machine from them.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;

use super::event::{EventKind, ExecutionEvent};
use crate::config::StreamConfig;
use crate::error::{ChatlinkError, Result};

/// Decides which events reach the format table.
#[derive(Debug, Clone)]
pub struct EventFilter {
    noise_subtypes: HashSet<String>,
    noise_regex: Option<Arc<Regex>>,
}

impl EventFilter {
    /// Build a filter from stream configuration.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::Config`] when `noise_pattern` does not compile.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatlink::config::StreamConfig;
    /// use chatlink::stream::filter::EventFilter;
    /// use chatlink::stream::event::{EventKind, ExecutionEvent};
    /// use serde_json::Value;
    ///
    /// let filter = EventFilter::new(&StreamConfig::default()).unwrap();
    /// let bare = ExecutionEvent::new(EventKind::Tool, "start", "", Value::Null);
    /// assert!(!filter.should_process(&bare));
    /// ```
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let noise_regex = match &config.noise_pattern {
            Some(pattern) => Some(Arc::new(Regex::new(pattern).map_err(|e| {
                ChatlinkError::Config(format!("invalid noise pattern '{pattern}': {e}"))
            })?)),
            None => None,
        };

        Ok(Self {
            noise_subtypes: config.noise_subtypes.iter().cloned().collect(),
            noise_regex,
        })
    }

    /// Whether `event` should be formatted.
    pub fn should_process(&self, event: &ExecutionEvent) -> bool {
        if event.kind == EventKind::Execution {
            return true;
        }

        // Bare lifecycle marker
        if self.noise_subtypes.contains(&event.subtype) && event.text().is_none() {
            return false;
        }

        if let (Some(regex), Some(text)) = (&self.noise_regex, event.text()) {
            if regex.is_match(text) {
                return false;
            }
        }

        true
    }
}
