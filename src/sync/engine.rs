//! Session synchronization engine
//!
//! [`SyncEngine`] exclusively owns the local [`Session`]. Mutations apply to
//! the snapshot immediately and join the pending log; flushes push the log to
//! the remote side and fold acknowledged changes into the base.
//!
//! # Flush triggers
//!
//! - Debounce: restarted by every mutation, bounded by `max_wait_ms`.
//! - Auto-sync: a fixed interval safety net.
//! - Reconnect: once per new channel epoch while changes are pending.
//! - Retry: after a failed flush, up to `max_retries` with doubling delay.
//!
//! Flushes are serialized by a lock and each one takes a fixed prefix of the
//! pending log, so no change is ever part of two in-flight flushes. Timers
//! never run a flush inline; they spawn it, so cancelling a timer cannot cut
//! a flush short.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backend::{ChannelBackend, ChatMessage, SessionBackend, SyncRequest};
use super::session::{MergeOutcome, Mutation, Session, Snapshot, SyncStatus};
use super::store::SessionStore;
use crate::channel::{ChannelEvent, ConnectionManager, ConnectionStatus};
use crate::config::SyncConfig;
use crate::error::{ChatlinkError, Result};
use crate::metrics;

/// What a flush did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to send
    Idle,
    /// `count` changes acknowledged
    Flushed {
        /// Changes acknowledged by the remote side
        count: usize,
    },
    /// Channel down; the reconnect trigger will flush
    Deferred,
    /// Another flush is running; it will reschedule if needed
    InFlight,
}

/// Notifications for sync consumers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Sync status transition
    StatusChanged(SyncStatus),
    /// A session became active
    SessionStarted {
        /// Active session
        session_id: String,
        /// Whether an existing session was resumed
        resumed: bool,
    },
    /// Changes acknowledged by the remote side
    Flushed {
        /// Number of changes
        count: usize,
    },
    /// A flush failed; pending changes are kept
    FlushFailed {
        /// Failure reason
        error: String,
    },
    /// A remote push was merged
    Merged {
        /// Fields taken from the remote snapshot
        applied: Vec<String>,
        /// Fields kept because they are locally pending
        skipped: Vec<String>,
    },
    /// A remote push touched only locally pending fields
    Conflict {
        /// Fields the push tried to overwrite
        fields: Vec<String>,
    },
    /// The session was ended or reset
    SessionClosed {
        /// Closed session
        session_id: String,
    },
}

/// Handle to the sync engine. Clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

struct EngineInner {
    config: SyncConfig,
    manager: ConnectionManager,
    primary: Arc<dyn SessionBackend>,
    fallback: Option<Arc<dyn SessionBackend>>,
    store: Option<SessionStore>,
    state: Mutex<EngineState>,
    flush_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    status_tx: watch::Sender<SyncStatus>,
}

#[derive(Default)]
struct EngineState {
    session: Option<Session>,
    debounce: Option<JoinHandle<()>>,
    first_unflushed_at: Option<Instant>,
    retry: Option<JoinHandle<()>>,
    retries: u32,
    flush_token: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl EngineState {
    fn clear_timers(&mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        if let Some(timer) = self.retry.take() {
            timer.abort();
        }
        self.first_unflushed_at = None;
        self.retries = 0;
    }
}

impl SyncEngine {
    /// Engine that syncs over `manager`, with an optional fallback and store.
    pub fn new(
        config: SyncConfig,
        manager: ConnectionManager,
        fallback: Option<Arc<dyn SessionBackend>>,
        store: Option<SessionStore>,
    ) -> Self {
        let primary: Arc<dyn SessionBackend> = Arc::new(ChannelBackend::new(manager.clone()));
        Self::with_backends(config, manager, primary, fallback, store)
    }

    /// Engine with an explicit primary backend.
    pub fn with_backends(
        config: SyncConfig,
        manager: ConnectionManager,
        primary: Arc<dyn SessionBackend>,
        fallback: Option<Arc<dyn SessionBackend>>,
        store: Option<SessionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (status_tx, _) = watch::channel(SyncStatus::Synced);
        Self {
            inner: Arc::new(EngineInner {
                config,
                manager,
                primary,
                fallback,
                store,
                state: Mutex::new(EngineState::default()),
                flush_lock: Mutex::new(()),
                events,
                status_tx,
            }),
        }
    }

    /// Start the auto-sync timer, the reconnect trigger and the remote push
    /// listener. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if !st.background.is_empty() {
            return;
        }

        // Subscribe before spawning so nothing published from here on is missed.
        let status_rx = self.inner.manager.watch_status();
        let channel_rx = self.inner.manager.subscribe();
        let epoch = self.inner.manager.epoch();

        st.background.push(tokio::spawn(
            Arc::clone(&self.inner).auto_sync_loop(),
        ));
        st.background.push(tokio::spawn(
            Arc::clone(&self.inner).reconnect_trigger(status_rx, epoch),
        ));
        st.background.push(tokio::spawn(
            Arc::clone(&self.inner).remote_push_listener(channel_rx),
        ));
        tracing::debug!("Sync engine started");
    }

    /// Stop every timer and background task. Pending changes stay in memory
    /// and in the store.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        st.clear_timers();
        for task in st.background.drain(..) {
            task.abort();
        }
        tracing::debug!("Sync engine stopped");
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch sync status transitions.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Active session id.
    pub async fn session_id(&self) -> Option<String> {
        let st = self.inner.state.lock().await;
        st.session.as_ref().map(|s| s.session_id.clone())
    }

    /// Copy of the current local snapshot.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        let st = self.inner.state.lock().await;
        st.session.as_ref().map(|s| s.snapshot.clone())
    }

    /// Copy of the whole session.
    pub async fn session(&self) -> Option<Session> {
        self.inner.state.lock().await.session.clone()
    }

    /// Number of unacknowledged changes.
    pub async fn pending_count(&self) -> usize {
        let st = self.inner.state.lock().await;
        st.session
            .as_ref()
            .map_or(0, |s| s.pending_changes.len())
    }

    /// Reason for the last failed flush.
    pub async fn last_error(&self) -> Option<String> {
        let st = self.inner.state.lock().await;
        st.session.as_ref().and_then(|s| s.last_error.clone())
    }

    /// Activate a session.
    ///
    /// The candidate id (or, without one, the stored id) is validated against
    /// the remote side. A valid id is resumed, restoring persisted pending
    /// changes when the store holds the same session. Otherwise a new session
    /// is created. Returns the active id; if a session is already active it
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// Fails without creating a session when the remote side cannot be
    /// reached, so a live session is never abandoned because of an outage.
    pub async fn init_session(&self, candidate: Option<String>) -> Result<String> {
        let inner = &self.inner;
        if let Some(id) = self.session_id().await {
            tracing::debug!(session_id = %id, "Session already active");
            return Ok(id);
        }

        let persisted = match &inner.store {
            Some(store) => store.load().unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable stored session: {e:#}");
                None
            }),
            None => None,
        };
        let candidate = candidate
            .filter(|id| !id.trim().is_empty())
            .or_else(|| persisted.as_ref().map(|p| p.session_id.clone()));
        let backend = inner.control_backend()?;

        let mut resumed = None;
        if let Some(id) = candidate {
            let validation = backend.validate(&id).await?;
            if validation.valid {
                let session = match persisted {
                    Some(p) if p.session_id == id => Session::restore(id, p.base, p.pending),
                    _ => Session::new(id, validation.snapshot.unwrap_or_default()),
                };
                tracing::info!(
                    session_id = %session.session_id,
                    pending = session.pending_changes.len(),
                    "Resuming session"
                );
                resumed = Some(session);
            } else {
                tracing::info!(session_id = %id, "Stored session is no longer valid; creating a new one");
            }
        }

        let is_resumed = resumed.is_some();
        let session = match resumed {
            Some(session) => session,
            None => {
                let info = backend.create(&Snapshot::new()).await?;
                tracing::info!(session_id = %info.session_id, backend = backend.name(), "Session created");
                Session::new(info.session_id, info.snapshot)
            }
        };

        let session_id = session.session_id.clone();
        let mut st = inner.state.lock().await;
        if let Some(existing) = &st.session {
            // Lost a race with a concurrent init.
            return Ok(existing.session_id.clone());
        }
        let has_pending = !session.pending_changes.is_empty();
        let status = session.sync_status;
        st.session = Some(session);
        inner.persist(&st);
        inner.publish_status(status);
        metrics::set_pending_changes(st.session.as_ref().map_or(0, |s| s.pending_changes.len()));
        if has_pending {
            inner.schedule_debounce(&mut st);
        }
        drop(st);

        inner.publish(SyncEvent::SessionStarted {
            session_id: session_id.clone(),
            resumed: is_resumed,
        });
        Ok(session_id)
    }

    /// Apply a change locally and schedule a debounced flush.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::NoSession`] before [`SyncEngine::init_session`].
    pub async fn mutate(&self, mutation: Mutation) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        let session = st.session.as_mut().ok_or(ChatlinkError::NoSession)?;

        session.apply(mutation);
        let pending = session.pending_changes.len();
        if session.sync_status == SyncStatus::Synced {
            session.sync_status = SyncStatus::Pending;
            inner.publish_status(SyncStatus::Pending);
        }
        tracing::trace!(pending, "Mutation applied");
        metrics::set_pending_changes(pending);

        inner.persist(&st);
        inner.schedule_debounce(&mut st);
        Ok(())
    }

    /// Push pending changes to the remote side.
    ///
    /// Without `force`, an empty log is a no-op, a running flush is left
    /// alone, and a down channel defers the flush to the reconnect trigger.
    /// With `force`, the call waits for any running flush and uses the
    /// fallback transport when the channel is down.
    ///
    /// # Errors
    ///
    /// The delivery error, after recording it as the session's last error
    /// and scheduling a bounded retry. Pending changes are never dropped.
    pub async fn flush(&self, force: bool) -> Result<FlushOutcome> {
        self.inner.flush(force).await
    }

    /// Merge a snapshot pushed by the remote side.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::SyncConflict`] when every differing field has a
    /// pending local change; local state is kept.
    pub async fn merge_remote(&self, remote: &Snapshot) -> Result<MergeOutcome> {
        self.inner.merge_remote(remote).await
    }

    /// Persist a chat message for the active session.
    pub async fn save_message(&self, message: &ChatMessage) -> Result<()> {
        let session_id = self.session_id().await.ok_or(ChatlinkError::NoSession)?;
        let backend = self.inner.control_backend()?;
        backend.save_message(&session_id, message).await
    }

    /// Flush everything, then close the session remotely and forget it.
    ///
    /// # Errors
    ///
    /// If the final flush fails the session stays active with its pending
    /// changes, so the caller can retry.
    pub async fn end_session(&self) -> Result<()> {
        let inner = &self.inner;
        let session_id = self.session_id().await.ok_or(ChatlinkError::NoSession)?;

        if self.pending_count().await > 0 {
            self.flush(true).await?;
        }
        inner.control_backend()?.end(&session_id).await?;

        let mut st = inner.state.lock().await;
        st.clear_timers();
        st.session = None;
        inner.clear_store();
        drop(st);

        inner.publish_status(SyncStatus::Synced);
        metrics::set_pending_changes(0);
        inner.publish(SyncEvent::SessionClosed {
            session_id: session_id.clone(),
        });
        tracing::info!(%session_id, "Session ended");
        Ok(())
    }

    /// Drop the session locally.
    ///
    /// Cancels an in-flight flush and every timer. The session id is not
    /// reused: the next [`SyncEngine::init_session`] without an explicit id
    /// creates a new session.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::UnsyncedChanges`] when changes are pending and
    /// `discard_unsynced` is false. Nothing is touched in that case.
    pub async fn reset(&self, discard_unsynced: bool) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        let count = st.session.as_ref().map_or(0, |s| s.pending_changes.len());
        if count > 0 && !discard_unsynced {
            return Err(ChatlinkError::UnsyncedChanges { count }.into());
        }

        st.flush_token.cancel();
        st.flush_token = CancellationToken::new();
        st.clear_timers();
        let closed = st.session.take().map(|s| s.session_id);
        inner.clear_store();
        drop(st);

        if count > 0 {
            tracing::warn!(count, "Discarded unsynced changes on reset");
        }
        inner.publish_status(SyncStatus::Synced);
        metrics::set_pending_changes(0);
        if let Some(session_id) = closed {
            tracing::info!(%session_id, "Session reset");
            inner.publish(SyncEvent::SessionClosed { session_id });
        }
        Ok(())
    }
}

impl EngineInner {
    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn publish_status(&self, status: SyncStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::debug!(%previous, current = %status, "Sync status changed");
            self.publish(SyncEvent::StatusChanged(status));
        }
    }

    fn set_status(&self, session: &mut Session, status: SyncStatus) {
        session.sync_status = status;
        self.publish_status(status);
    }

    fn persist(&self, st: &EngineState) {
        let (Some(store), Some(session)) = (&self.store, &st.session) else {
            return;
        };
        if let Err(e) = store.save(&session.session_id, &session.base, &session.pending_changes) {
            tracing::warn!("Failed to persist session: {e:#}");
        }
    }

    fn clear_store(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                tracing::warn!("Failed to clear stored session: {e:#}");
            }
        }
    }

    /// Backend for session control: the channel when open, else the fallback.
    fn control_backend(&self) -> Result<Arc<dyn SessionBackend>> {
        if self.primary.is_available() {
            return Ok(Arc::clone(&self.primary));
        }
        match &self.fallback {
            Some(fallback) => Ok(Arc::clone(fallback)),
            None => Err(ChatlinkError::Transport(
                "channel is down and no fallback transport is configured".into(),
            )
            .into()),
        }
    }

    fn spawn_flush(self: &Arc<Self>, trigger: &'static str) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.flush(false).await {
                Ok(outcome) => tracing::trace!(trigger, ?outcome, "Background flush finished"),
                Err(e) => tracing::debug!(trigger, "Background flush failed: {e}"),
            }
        });
    }

    fn schedule_debounce(self: &Arc<Self>, st: &mut EngineState) {
        let now = Instant::now();
        let first = *st.first_unflushed_at.get_or_insert(now);
        let deadline = (now + self.config.debounce()).min(first + self.config.max_wait());

        if let Some(timer) = st.debounce.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        st.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.spawn_flush("debounce");
        }));
    }

    fn schedule_retry(self: &Arc<Self>, st: &mut EngineState) {
        if st.retries >= self.config.max_retries {
            tracing::warn!(
                retries = st.retries,
                "Flush retries exhausted; waiting for the next trigger"
            );
            return;
        }
        let delay = self.config.retry_delay(st.retries);
        st.retries += 1;
        tracing::info!(
            retry = st.retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling flush retry"
        );

        if let Some(timer) = st.retry.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        st.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.spawn_flush("retry");
        }));
    }

    async fn flush(self: &Arc<Self>, force: bool) -> Result<FlushOutcome> {
        let _flushing = if force {
            self.flush_lock.lock().await
        } else {
            match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(FlushOutcome::InFlight),
            }
        };

        let (request, count, token, backend) = {
            let mut st = self.state.lock().await;
            let Some(session) = st.session.as_ref() else {
                return if force {
                    Err(ChatlinkError::NoSession.into())
                } else {
                    Ok(FlushOutcome::Idle)
                };
            };
            if session.pending_changes.is_empty() && !force {
                return Ok(FlushOutcome::Idle);
            }

            let backend = if self.primary.is_available() {
                Arc::clone(&self.primary)
            } else if !force {
                tracing::debug!(
                    pending = session.pending_changes.len(),
                    "Channel down; deferring flush until reconnect"
                );
                return Ok(FlushOutcome::Deferred);
            } else if let Some(fallback) = &self.fallback {
                Arc::clone(fallback)
            } else {
                return Err(ChatlinkError::Transport(
                    "channel is down and no fallback transport is configured".into(),
                )
                .into());
            };

            let request = SyncRequest {
                session_id: session.session_id.clone(),
                changes: session.pending_changes.clone(),
                snapshot: session.snapshot.clone(),
            };
            let count = request.changes.len();

            if let Some(timer) = st.debounce.take() {
                timer.abort();
            }
            st.first_unflushed_at = None;
            let token = st.flush_token.clone();
            if let Some(session) = st.session.as_mut() {
                self.set_status(session, SyncStatus::Syncing);
            }
            (request, count, token, backend)
        };

        tracing::debug!(count, backend = backend.name(), force, "Flushing changes");
        let result = tokio::select! {
            _ = token.cancelled() => {
                return Err(ChatlinkError::Cancelled("flush cancelled by reset".into()).into());
            }
            result = backend.sync(&request) => result,
        };

        let mut st = self.state.lock().await;
        let current = st
            .session
            .as_ref()
            .is_some_and(|s| s.session_id == request.session_id);
        if token.is_cancelled() || !current {
            return Err(ChatlinkError::Cancelled("session changed during flush".into()).into());
        }

        match result {
            Ok(ack) => {
                st.retries = 0;
                if let Some(timer) = st.retry.take() {
                    timer.abort();
                }
                let mut reschedule = false;
                if let Some(session) = st.session.as_mut() {
                    session.acknowledge(count);
                    if let Some(remote) = ack.snapshot.as_ref() {
                        if let Err(e) = session.merge_remote(remote) {
                            tracing::debug!("Acknowledged snapshot not merged: {e}");
                        }
                    }
                    let remaining = session.pending_changes.len();
                    let status = if remaining == 0 {
                        SyncStatus::Synced
                    } else {
                        SyncStatus::Pending
                    };
                    self.set_status(session, status);
                    metrics::set_pending_changes(remaining);
                    reschedule = remaining > 0;
                }
                self.persist(&st);
                if reschedule {
                    self.schedule_debounce(&mut st);
                }
                drop(st);

                metrics::record_flush("ok");
                tracing::info!(count, "Changes synced");
                self.publish(SyncEvent::Flushed { count });
                Ok(FlushOutcome::Flushed { count })
            }
            Err(e) => {
                let reason = e.to_string();
                if let Some(session) = st.session.as_mut() {
                    session.last_error = Some(reason.clone());
                    self.set_status(session, SyncStatus::Error);
                }
                self.schedule_retry(&mut st);
                drop(st);

                metrics::record_flush("error");
                tracing::warn!(count, "Flush failed: {reason}");
                self.publish(SyncEvent::FlushFailed { error: reason });
                Err(e)
            }
        }
    }

    async fn merge_remote(&self, remote: &Snapshot) -> Result<MergeOutcome> {
        let mut st = self.state.lock().await;
        let session = st.session.as_mut().ok_or(ChatlinkError::NoSession)?;

        match session.merge_remote(remote) {
            Ok(MergeOutcome::Unchanged) => Ok(MergeOutcome::Unchanged),
            Ok(MergeOutcome::Merged { applied, skipped }) => {
                self.persist(&st);
                drop(st);
                if !skipped.is_empty() {
                    metrics::record_merge_conflicts(skipped.len());
                    tracing::debug!(?skipped, "Kept locally pending fields during merge");
                }
                self.publish(SyncEvent::Merged {
                    applied: applied.clone(),
                    skipped: skipped.clone(),
                });
                Ok(MergeOutcome::Merged { applied, skipped })
            }
            Err(e) => {
                drop(st);
                if let ChatlinkError::SyncConflict { fields } = &e {
                    metrics::record_merge_conflicts(fields.len());
                    tracing::info!(?fields, "Remote push rejected: local changes are newer");
                    self.publish(SyncEvent::Conflict {
                        fields: fields.clone(),
                    });
                }
                Err(e.into())
            }
        }
    }

    async fn auto_sync_loop(self: Arc<Self>) {
        let period = self.config.auto_sync_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.spawn_flush("auto-sync");
        }
    }

    /// Flush once per new channel epoch while changes are pending.
    async fn reconnect_trigger(
        self: Arc<Self>,
        mut status_rx: watch::Receiver<ConnectionStatus>,
        mut last_epoch: u64,
    ) {
        while status_rx.changed().await.is_ok() {
            if *status_rx.borrow_and_update() != ConnectionStatus::Connected {
                continue;
            }
            let epoch = self.manager.epoch();
            if epoch == last_epoch {
                continue;
            }
            last_epoch = epoch;

            let pending = {
                let st = self.state.lock().await;
                st.session.as_ref().map_or(0, |s| s.pending_changes.len())
            };
            if pending > 0 {
                tracing::info!(epoch, pending, "Channel reconnected; flushing pending changes");
                self.spawn_flush("reconnect");
            }
        }
    }

    async fn remote_push_listener(self: Arc<Self>, mut rx: broadcast::Receiver<ChannelEvent>) {
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::SessionUpdate {
                    session_id,
                    snapshot,
                }) => {
                    let active = {
                        let st = self.state.lock().await;
                        st.session.as_ref().map(|s| s.session_id.clone())
                    };
                    if active.as_deref() != Some(session_id.as_str()) {
                        tracing::debug!(%session_id, "Ignoring push for inactive session");
                        continue;
                    }
                    if let Err(e) = self.merge_remote(&snapshot).await {
                        tracing::debug!("Remote push not merged: {e}");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Sync engine lagged behind channel events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
