//! Paced rendering of one execution's event stream
//!
//! Events are filtered, mapped to fragments and queued. A single drain task
//! reveals one fragment per `message_delay`, so bursts from the backend turn
//! into a steady typing effect. Completion and failure are reported exactly
//! once, and only after the queue is empty.
//!
//! ```text
//! idle --start--> streaming --end/error--> draining --queue empty--> complete | failed
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::event::{EventKind, ExecutionEvent};
use super::filter::EventFilter;
use super::format::{FormatRule, FormatTable, Fragment};
use crate::channel::{ChannelEvent, ConnectionManager, ConnectionStatus};
use crate::config::StreamConfig;
use crate::error::{ChatlinkError, Result};
use crate::metrics;

/// Formatter lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// No execution tracked
    Idle,
    /// Receiving events
    Streaming,
    /// Ended or failed; revealing what is still queued
    Draining,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed,
}

impl StreamState {
    /// Whether an execution is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Streaming | Self::Draining)
    }
}

/// Notifications for the rendering side
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A new execution began; content is empty
    Started {
        /// Execution id, if already known
        execution_id: Option<String>,
    },
    /// A fragment was revealed
    Content(String),
    /// A terminal artifact arrived
    Summary(Value),
    /// All content revealed; the execution succeeded
    Completed {
        /// Final content
        content: String,
        /// Terminal artifact, if any
        summary: Option<Value>,
    },
    /// All content revealed; the execution failed
    Failed {
        /// Failure reason
        error: String,
        /// Final content, including the error line
        content: String,
    },
}

#[derive(Debug)]
struct FormatterState {
    phase: StreamState,
    generation: u64,
    execution_id: Option<String>,
    queue: VecDeque<Fragment>,
    content: String,
    summary: Option<Value>,
    ended: bool,
    failure: Option<String>,
    draining: bool,
    drain_task: Option<JoinHandle<()>>,
}

impl FormatterState {
    fn new() -> Self {
        Self {
            phase: StreamState::Idle,
            generation: 0,
            execution_id: None,
            queue: VecDeque::new(),
            content: String::new(),
            summary: None,
            ended: false,
            failure: None,
            draining: false,
            drain_task: None,
        }
    }

    /// Drop everything about the current execution.
    fn clear(&mut self) {
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
        self.generation += 1;
        self.execution_id = None;
        self.queue.clear();
        self.content.clear();
        self.summary = None;
        self.ended = false;
        self.failure = None;
        self.draining = false;
    }
}

/// Turns execution events into a paced, growing text buffer.
///
/// Tracks one execution at a time; use one formatter per concurrent
/// execution.
#[derive(Clone)]
pub struct ExecutionStreamFormatter {
    inner: Arc<FormatterInner>,
}

impl std::fmt::Debug for ExecutionStreamFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStreamFormatter")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct FormatterInner {
    config: StreamConfig,
    filter: EventFilter,
    table: Mutex<FormatTable>,
    state: Mutex<FormatterState>,
    attachment: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<StreamUpdate>,
    content_tx: watch::Sender<String>,
    state_tx: watch::Sender<StreamState>,
}

impl Drop for FormatterInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.attachment).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.state).drain_task.take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExecutionStreamFormatter {
    /// Formatter with the default format table.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::Config`] when the noise pattern does not compile.
    pub fn new(config: StreamConfig) -> Result<Self> {
        Self::with_table(config, FormatTable::default())
    }

    /// Formatter with a caller-supplied format table.
    pub fn with_table(config: StreamConfig, table: FormatTable) -> Result<Self> {
        let filter = EventFilter::new(&config)?;
        let (updates, _) = broadcast::channel(256);
        let (content_tx, _) = watch::channel(String::new());
        let (state_tx, _) = watch::channel(StreamState::Idle);
        Ok(Self {
            inner: Arc::new(FormatterInner {
                config,
                filter,
                table: Mutex::new(table),
                state: Mutex::new(FormatterState::new()),
                attachment: Mutex::new(None),
                updates,
                content_tx,
                state_tx,
            }),
        })
    }

    /// Register an extra `(type, subtype, status)` rule.
    pub fn add_rule(&self, kind: EventKind, subtype: &str, status: &str, rule: FormatRule) {
        lock(&self.inner.table).insert(kind, subtype, status, rule);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.inner.state_tx.borrow()
    }

    /// Content revealed so far.
    pub fn content(&self) -> String {
        self.inner.content_tx.borrow().clone()
    }

    /// Terminal artifact, if one arrived.
    pub fn summary(&self) -> Option<Value> {
        lock(&self.inner.state).summary.clone()
    }

    /// Id of the tracked execution, once known.
    pub fn execution_id(&self) -> Option<String> {
        lock(&self.inner.state).execution_id.clone()
    }

    /// Fragments waiting to be revealed.
    pub fn queued(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Subscribe to stream updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate> {
        self.inner.updates.subscribe()
    }

    /// Watch the revealed content.
    pub fn watch_content(&self) -> watch::Receiver<String> {
        self.inner.content_tx.subscribe()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state_tx.subscribe()
    }

    /// Feed one event.
    pub fn handle_event(&self, event: ExecutionEvent) {
        self.inner.handle_event(event);
    }

    /// Fail the tracked execution from outside, e.g. on channel loss.
    ///
    /// Content already queued is still revealed, followed by an error line.
    /// No-op when nothing is in progress or the execution already ended.
    pub fn fail(&self, reason: &str) {
        self.inner.fail(reason);
    }

    /// Forward execution events from `manager` until reset or drop.
    ///
    /// A channel that gives up or is closed while an execution is in
    /// progress fails the execution.
    pub fn attach(&self, manager: &ConnectionManager) {
        let rx = manager.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(forward_events(weak, rx));
        if let Some(previous) = lock(&self.inner.attachment).replace(task) {
            previous.abort();
        }
    }

    /// Stop forwarding channel events.
    pub fn detach(&self) {
        if let Some(task) = lock(&self.inner.attachment).take() {
            task.abort();
        }
    }

    /// Drop the tracked execution immediately: the queue, the drain timer and
    /// the channel attachment. No update is published for it afterwards.
    pub fn reset(&self) {
        self.detach();
        let mut st = lock(&self.inner.state);
        st.clear();
        st.phase = StreamState::Idle;
        drop(st);
        self.inner.content_tx.send_replace(String::new());
        self.inner.state_tx.send_replace(StreamState::Idle);
        tracing::debug!("Stream formatter reset");
    }

    /// Wait for the tracked execution to finish.
    ///
    /// Returns the final content, or [`ChatlinkError::ExecutionFailed`].
    pub async fn wait_finished(&self) -> Result<String> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                StreamState::Complete => return Ok(self.content()),
                StreamState::Failed => {
                    let reason = lock(&self.inner.state)
                        .failure
                        .clone()
                        .unwrap_or_else(|| "execution failed".to_string());
                    return Err(ChatlinkError::ExecutionFailed(reason).into());
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChatlinkError::Cancelled("stream formatter dropped".into()).into());
            }
        }
    }
}

impl FormatterInner {
    fn publish(&self, update: StreamUpdate) {
        let _ = self.updates.send(update);
    }

    fn set_phase(&self, st: &mut FormatterState, phase: StreamState) {
        if st.phase != phase {
            tracing::debug!(from = ?st.phase, to = ?phase, "Stream state changed");
        }
        st.phase = phase;
        self.state_tx.send_replace(phase);
    }

    fn handle_event(self: &Arc<Self>, event: ExecutionEvent) {
        let mut st = lock(&self.state);

        if event.is_start() {
            if st.phase.is_active() {
                tracing::warn!(
                    previous = ?st.execution_id,
                    dropped = st.queue.len(),
                    "New execution started while another was active; dropping its queue"
                );
            }
            st.clear();
            st.execution_id = event.execution_id.clone();
            self.set_phase(&mut st, StreamState::Streaming);
            self.content_tx.send_replace(String::new());
            self.publish(StreamUpdate::Started {
                execution_id: event.execution_id,
            });
            return;
        }

        if !st.phase.is_active() {
            // A finished execution still accepts its late summary.
            let finished = matches!(st.phase, StreamState::Complete | StreamState::Failed);
            let same_execution = match (&event.execution_id, &st.execution_id) {
                (Some(id), Some(current)) => id == current,
                _ => true,
            };
            if finished && same_execution {
                self.store_summary(&mut st, &event);
            } else {
                tracing::trace!(kind = %event.kind, subtype = %event.subtype, "No active execution; event ignored");
            }
            return;
        }

        if let Some(id) = &event.execution_id {
            match st.execution_id.clone() {
                None => {
                    tracing::debug!(execution_id = %id, "Execution id assigned");
                    st.execution_id = Some(id.clone());
                }
                Some(current) if &current != id => {
                    tracing::debug!(execution_id = %id, %current, "Event for another execution dropped");
                    return;
                }
                Some(_) => {}
            }
        }

        self.store_summary(&mut st, &event);

        if st.ended {
            tracing::trace!(subtype = %event.subtype, "Execution already ended; event ignored");
            return;
        }

        if event.is_failure() {
            let reason = event.error_message();
            self.begin_failure(&mut st, reason);
            return;
        }

        if event.is_end() {
            st.ended = true;
            self.set_phase(&mut st, StreamState::Draining);
            self.ensure_drain(&mut st);
            return;
        }

        if !self.filter.should_process(&event) {
            return;
        }
        let fragment = lock(&self.table).format(&event);
        if let Some(fragment) = fragment {
            st.queue.push_back(fragment);
            self.ensure_drain(&mut st);
        }
    }

    fn store_summary(&self, st: &mut FormatterState, event: &ExecutionEvent) {
        if let Some(summary) = event.summary() {
            if st.summary.as_ref() != Some(summary) {
                st.summary = Some(summary.clone());
                self.publish(StreamUpdate::Summary(summary.clone()));
            }
        }
    }

    fn fail(self: &Arc<Self>, reason: &str) {
        let mut st = lock(&self.state);
        if !st.phase.is_active() || st.ended {
            return;
        }
        self.begin_failure(&mut st, reason.to_string());
    }

    fn begin_failure(self: &Arc<Self>, st: &mut FormatterState, reason: String) {
        tracing::warn!(execution_id = ?st.execution_id, "Execution failed: {reason}");
        st.queue.push_back(Fragment::append(format!("Error: {reason}")));
        st.failure = Some(reason);
        st.ended = true;
        self.set_phase(st, StreamState::Draining);
        self.ensure_drain(st);
    }

    /// Start the drain task unless one is running; finalize if nothing is
    /// left to reveal.
    fn ensure_drain(self: &Arc<Self>, st: &mut FormatterState) {
        if st.draining {
            return;
        }
        if st.queue.is_empty() {
            if st.ended {
                self.finalize(st);
            }
            return;
        }
        st.draining = true;
        let inner = Arc::clone(self);
        st.drain_task = Some(tokio::spawn(inner.drain(st.generation)));
    }

    async fn drain(self: Arc<Self>, generation: u64) {
        let delay = self.config.message_delay();
        loop {
            {
                let mut st = lock(&self.state);
                if st.generation != generation {
                    return;
                }
                match st.queue.pop_front() {
                    Some(fragment) => {
                        if fragment.overwrite || st.content.is_empty() {
                            st.content = fragment.content;
                        } else {
                            st.content.push_str(&self.config.separator);
                            st.content.push_str(&fragment.content);
                        }
                        metrics::record_fragment();
                        let content = st.content.clone();
                        self.content_tx.send_replace(content.clone());
                        self.publish(StreamUpdate::Content(content));
                    }
                    None => {
                        st.draining = false;
                        st.drain_task = None;
                        if st.ended {
                            self.finalize(&mut st);
                        }
                        return;
                    }
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn finalize(&self, st: &mut FormatterState) {
        if matches!(st.phase, StreamState::Complete | StreamState::Failed) {
            return;
        }
        let content = st.content.clone();
        match st.failure.clone() {
            Some(error) => {
                self.set_phase(st, StreamState::Failed);
                self.publish(StreamUpdate::Failed { error, content });
            }
            None => {
                self.set_phase(st, StreamState::Complete);
                tracing::info!(
                    execution_id = ?st.execution_id,
                    chars = content.len(),
                    "Execution stream complete"
                );
                self.publish(StreamUpdate::Completed {
                    content,
                    summary: st.summary.clone(),
                });
            }
        }
    }
}

async fn forward_events(weak: Weak<FormatterInner>, mut rx: broadcast::Receiver<ChannelEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Stream formatter lagged behind channel events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Execution(event) => inner.handle_event(event),
            ChannelEvent::StatusChanged { current, .. }
                if matches!(
                    current,
                    ConnectionStatus::Error | ConnectionStatus::Disconnected
                ) =>
            {
                inner.fail(&format!("connection {current}"));
            }
            _ => {}
        }
    }
}
