//! Connection manager
//!
//! [`ConnectionManager`] is a cheap-to-clone handle over shared state. All
//! sends funnel through one state lock, so the outbound queue, the rate
//! limiter and the batch buffer see a single ordered stream of frames.
//!
//! # Design
//!
//! - Each open connection gets a generation number and a
//!   [`CancellationToken`]. The read loop and heartbeat task stop when the
//!   token is cancelled, and loss reports carrying a stale generation are
//!   ignored.
//! - In-flight requests are tracked in a `pending` map keyed by request id.
//!   The entry is registered before the frame is sent and removed by exactly
//!   one of: the matching response, the caller's timeout, eviction from a full
//!   queue, or `disconnect()`.
//! - Unexpected loss starts a single reconnect loop that walks the
//!   [`Backoff`] schedule until a connection opens or the attempt budget is
//!   spent, at which point the status becomes [`ConnectionStatus::Error`].
//! - Pending requests survive a reconnect and keep their original deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::Backoff;
use super::frame::{self, InboundFrame, ResponseFrame};
use super::outbound::{OutboundQueue, QueuedFrame};
use super::rate_limit::RateLimiter;
use super::transport::{Connector, Transport};
use super::{ChannelEvent, ConnectionStatus};
use crate::config::ConnectionConfig;
use crate::error::{ChatlinkError, Result};
use crate::metrics;

/// Why a pending request was resolved without a successful response.
#[derive(Debug)]
enum PendingFailure {
    Remote(String),
    Cancelled(String),
}

type PendingOutcome = std::result::Result<Value, PendingFailure>;

struct PendingRequest {
    tx: oneshot::Sender<PendingOutcome>,
    request_type: String,
}

/// Correlation table: request id to waiting caller.
type PendingMap = HashMap<String, PendingRequest>;

type ConnectWaiter = oneshot::Sender<std::result::Result<(), String>>;

/// Handle to the live channel.
///
/// Clones share the same connection.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use chatlink::channel::ConnectionManager;
/// use chatlink::channel::transport::websocket::WebSocketConnector;
/// use chatlink::config::ConnectionConfig;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let manager = ConnectionManager::new(
///     ConnectionConfig::default(),
///     Arc::new(WebSocketConnector::new()),
/// );
/// manager.connect("ws://localhost:8080/ws").await?;
/// let reply: serde_json::Value = manager
///     .request("session:create", serde_json::json!({}), None)
///     .await?;
/// println!("{reply}");
/// manager.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    pending: Mutex<PendingMap>,
    events: broadcast::Sender<ChannelEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Reference point for `last_inbound_ms`
    clock_origin: Instant,
    last_inbound_ms: AtomicU64,
    /// Incremented on every successful open
    epoch: AtomicU64,
}

struct State {
    endpoint: Option<Url>,
    transport: Option<Arc<dyn Transport>>,
    connection_token: Option<CancellationToken>,
    generation: u64,
    backoff: Backoff,
    manual_close: bool,
    outbound: OutboundQueue,
    limiter: RateLimiter,
    draining: bool,
    drain_task: Option<JoinHandle<()>>,
    reconnecting: bool,
    reconnect_task: Option<JoinHandle<()>>,
    batch: Vec<Value>,
    batch_generation: u64,
    batch_task: Option<JoinHandle<()>>,
    connect_waiters: Vec<ConnectWaiter>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let state = State {
            endpoint: None,
            transport: None,
            connection_token: None,
            generation: 0,
            backoff: Backoff::from_config(&config),
            manual_close: false,
            outbound: OutboundQueue::new(config.outbound_queue_max, config.overflow_policy),
            limiter: RateLimiter::new(config.rate_limit_window(), config.rate_limit_max_requests),
            draining: false,
            drain_task: None,
            reconnecting: false,
            reconnect_task: None,
            batch: Vec::new(),
            batch_generation: 0,
            batch_task: None,
            connect_waiters: Vec::new(),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(state),
                pending: Mutex::new(HashMap::new()),
                events,
                status_tx,
                clock_origin: Instant::now(),
                last_inbound_ms: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Channel settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to everything the channel publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Number of successful opens so far. Changes exactly once per connect
    /// or reconnect.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Reconnect attempts scheduled since the last successful open.
    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.state.lock().await.backoff.attempt()
    }

    /// Frames waiting for the channel.
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.outbound.len()
    }

    /// Requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Open the channel to `endpoint`.
    ///
    /// Returns immediately when already connected. While a connect or
    /// reconnect is in progress, waits for its outcome instead of opening a
    /// second channel. From [`ConnectionStatus::Error`] or
    /// [`ConnectionStatus::Disconnected`] the reconnect budget starts over.
    ///
    /// # Errors
    ///
    /// - [`ChatlinkError::Transport`] if the connection cannot be opened. A
    ///   reconnect is still scheduled in the background.
    /// - [`ChatlinkError::Url`] if `endpoint` does not parse.
    /// - [`ChatlinkError::Config`] if the scheme is not `ws` or `wss`. Nothing
    ///   is scheduled for it.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let url = Url::parse(endpoint).map_err(ChatlinkError::from)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChatlinkError::Config(format!(
                "unsupported endpoint scheme '{}', expected ws or wss",
                url.scheme()
            ))
            .into());
        }

        let waiter = {
            let mut st = self.inner.state.lock().await;
            match self.status() {
                ConnectionStatus::Connected => {
                    tracing::debug!(%url, "connect() while connected; reusing channel");
                    return Ok(());
                }
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                    let (tx, rx) = oneshot::channel();
                    st.connect_waiters.push(tx);
                    Some(rx)
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                    if let Some(task) = st.reconnect_task.take() {
                        task.abort();
                    }
                    st.reconnecting = false;
                    st.endpoint = Some(url.clone());
                    st.manual_close = false;
                    st.backoff.reset();
                    self.inner.set_status(ConnectionStatus::Connecting);
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(ChatlinkError::Transport(reason).into()),
                Err(_) => Err(ChatlinkError::Cancelled("connect attempt abandoned".into()).into()),
            };
        }

        tracing::info!(%url, "Connecting channel");
        match self.inner.open(&url).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(%url, "Connect failed: {reason}");
                let mut st = self.inner.state.lock().await;
                for waiter in st.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(reason.clone()));
                }
                if !st.manual_close {
                    self.inner.schedule_reconnect(&mut st);
                }
                Err(e)
            }
        }
    }

    /// Send a frame.
    ///
    /// Transmits immediately when connected, the queue is empty and the rate
    /// limit allows; otherwise appends to the outbound queue. Any pending
    /// low-priority batch goes out first.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::QueueFull`] when the queue is full and the overflow
    /// policy is `reject_new`.
    pub async fn send(&self, message: Value) -> Result<()> {
        let frame = serde_json::to_string(&message)?;
        let mut st = self.inner.state.lock().await;
        self.inner.flush_batch(&mut st).await;
        self.inner
            .transmit(&mut st, QueuedFrame::new(frame, None))
            .await
    }

    /// Send a frame that may be coalesced with others.
    ///
    /// Frames are held for up to `batch_delay_ms` or until `max_batch_size`
    /// accumulate, then go out as a single `batch` frame.
    pub async fn send_low_priority(&self, message: Value) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;

        if inner.config.max_batch_size <= 1 {
            let frame = serde_json::to_string(&message)?;
            return inner.transmit(&mut st, QueuedFrame::new(frame, None)).await;
        }

        st.batch.push(message);
        if st.batch.len() >= inner.config.max_batch_size {
            inner.flush_batch(&mut st).await;
        } else if st.batch.len() == 1 {
            let timer_inner = Arc::clone(inner);
            let generation = st.batch_generation;
            let delay = inner.config.batch_delay();
            st.batch_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut st = timer_inner.state.lock().await;
                if st.batch_generation == generation {
                    timer_inner.flush_batch(&mut st).await;
                }
            }));
        }
        Ok(())
    }

    /// Send a correlated request and wait for its response.
    ///
    /// The request is registered before the frame is handed to the queue, so
    /// it can be issued while disconnected; the deadline still applies.
    ///
    /// # Errors
    ///
    /// - [`ChatlinkError::RequestTimeout`] when no response arrives within
    ///   `timeout` (default `request_timeout_ms`). The pending entry is
    ///   removed first, so a late response is ignored.
    /// - [`ChatlinkError::Remote`] when the response reports failure.
    /// - [`ChatlinkError::Cancelled`] when `disconnect()` runs or the queued
    ///   frame is evicted.
    pub async fn request<P, R>(
        &self,
        request_type: &str,
        payload: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let frame =
            frame::request(request_type, &request_id, serde_json::to_value(payload)?).to_string();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                tx,
                request_type: request_type.to_string(),
            },
        );

        let started = Instant::now();
        let sent = {
            let mut st = self.inner.state.lock().await;
            self.inner.flush_batch(&mut st).await;
            self.inner
                .transmit(&mut st, QueuedFrame::new(frame, Some(request_id.clone())))
                .await
        };
        if let Err(e) = sent {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        tracing::debug!(%request_id, request_type, "Request sent");

        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                metrics::record_request(request_type, "cancelled", started.elapsed());
                return Err(
                    ChatlinkError::Cancelled(format!("{request_type} request abandoned")).into(),
                );
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                let timeout_ms = deadline.as_millis() as u64;
                tracing::warn!(%request_id, request_type, timeout_ms, "Request timed out");
                metrics::record_request(request_type, "timeout", started.elapsed());
                return Err(ChatlinkError::RequestTimeout {
                    request_type: request_type.to_string(),
                    timeout_ms,
                }
                .into());
            }
        };

        match outcome {
            Ok(value) => {
                metrics::record_request(request_type, "ok", started.elapsed());
                Ok(serde_json::from_value(value)?)
            }
            Err(PendingFailure::Remote(message)) => {
                metrics::record_request(request_type, "error", started.elapsed());
                Err(ChatlinkError::Remote(message).into())
            }
            Err(PendingFailure::Cancelled(reason)) => {
                metrics::record_request(request_type, "cancelled", started.elapsed());
                Err(ChatlinkError::Cancelled(reason).into())
            }
        }
    }

    /// Close deliberately.
    ///
    /// Suppresses reconnection, discards queued and batched frames, and
    /// resolves every pending request with [`ChatlinkError::Cancelled`].
    pub async fn disconnect(&self) -> Result<()> {
        let (transport, dropped, waiters) = {
            let mut st = self.inner.state.lock().await;
            st.manual_close = true;
            st.reconnecting = false;
            st.draining = false;
            for task in [
                st.reconnect_task.take(),
                st.drain_task.take(),
                st.batch_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            if let Some(token) = st.connection_token.take() {
                token.cancel();
            }
            let dropped = st.outbound.drain_all().len() + std::mem::take(&mut st.batch).len();
            self.inner.set_status(ConnectionStatus::Disconnected);
            (
                st.transport.take(),
                dropped,
                std::mem::take(&mut st.connect_waiters),
            )
        };

        for waiter in waiters {
            let _ = waiter.send(Err("disconnected".to_string()));
        }
        if dropped > 0 {
            tracing::warn!(count = dropped, "Discarding unsent frames on disconnect");
            metrics::record_dropped("disconnect", dropped);
        }

        let cancelled: Vec<_> = self.inner.pending.lock().await.drain().collect();
        if !cancelled.is_empty() {
            tracing::debug!(count = cancelled.len(), "Cancelling pending requests");
        }
        for (_, request) in cancelled {
            let _ = request
                .tx
                .send(Err(PendingFailure::Cancelled("channel disconnected".into())));
        }

        if let Some(transport) = transport {
            transport.close().await?;
        }
        tracing::info!("Channel disconnected");
        Ok(())
    }
}

impl Inner {
    fn publish(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::debug!(%previous, current = %status, "Connection status changed");
            self.publish(ChannelEvent::StatusChanged {
                previous,
                current: status,
            });
        }
    }

    fn touch(&self) {
        let elapsed = self.clock_origin.elapsed().as_millis() as u64;
        self.last_inbound_ms.store(elapsed, Ordering::SeqCst);
    }

    fn last_inbound(&self) -> Instant {
        self.clock_origin + Duration::from_millis(self.last_inbound_ms.load(Ordering::SeqCst))
    }

    /// Open a transport and start its tasks.
    async fn open(self: &Arc<Self>, url: &Url) -> Result<()> {
        let timeout = self.config.connect_timeout();
        let transport = match tokio::time::timeout(timeout, self.connector.connect(url)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ChatlinkError::Transport(format!(
                    "connect to {url} timed out after {}ms",
                    timeout.as_millis()
                ))
                .into())
            }
        };

        let mut st = self.state.lock().await;
        if st.manual_close {
            drop(st);
            let _ = transport.close().await;
            return Err(ChatlinkError::Cancelled("disconnected while connecting".into()).into());
        }

        st.generation += 1;
        let generation = st.generation;
        let token = CancellationToken::new();
        st.transport = Some(Arc::clone(&transport));
        st.connection_token = Some(token.clone());
        st.backoff.reset();
        st.reconnecting = false;
        self.touch();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        self.spawn_read_loop(Arc::clone(&transport), token.clone(), generation);
        self.spawn_heartbeat(transport, token, generation);
        self.set_status(ConnectionStatus::Connected);

        for waiter in st.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if !st.outbound.is_empty() {
            tracing::debug!(queued = st.outbound.len(), "Flushing outbound queue");
            self.schedule_drain(&mut st);
        }
        tracing::info!(%url, generation, "Channel connected");
        Ok(())
    }

    fn spawn_read_loop(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        token: CancellationToken,
        generation: u64,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut stream = transport.receive();
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    next = stream.next() => match next {
                        Some(raw) => {
                            inner.touch();
                            inner.dispatch(&raw, &transport).await;
                        }
                        None => break,
                    },
                }
            }
            drop(stream);
            inner.connection_lost(generation, "transport closed").await;
        });
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        token: CancellationToken,
        generation: u64,
    ) {
        let inner = Arc::clone(self);
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let deadline = inner.last_inbound() + timeout;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        if inner.last_inbound() + timeout <= Instant::now() {
                            tracing::warn!(
                                timeout_ms = timeout.as_millis() as u64,
                                "No inbound traffic within heartbeat timeout; declaring channel dead"
                            );
                            inner.connection_lost(generation, "heartbeat timeout").await;
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = transport.send(frame::ping().to_string()).await {
                            tracing::debug!("Heartbeat send failed: {e}");
                            inner.connection_lost(generation, "heartbeat send failed").await;
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, raw: &str, transport: &Arc<dyn Transport>) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Dropping undecodable inbound frame: {e}");
                return;
            }
        };

        // Batches unpack onto the stack in reverse so members dispatch in order.
        let mut stack = vec![value];
        while let Some(value) = stack.pop() {
            match frame::classify(value) {
                InboundFrame::Response(response) => self.resolve_response(response).await,
                InboundFrame::Ping { timestamp } => {
                    if let Err(e) = transport.send(frame::pong(timestamp).to_string()).await {
                        tracing::debug!("Failed to answer ping: {e}");
                    }
                }
                InboundFrame::Pong => tracing::trace!("Heartbeat acknowledged"),
                InboundFrame::Batch(messages) => stack.extend(messages.into_iter().rev()),
                InboundFrame::Execution(event) => self.publish(ChannelEvent::Execution(event)),
                InboundFrame::SessionUpdate {
                    session_id,
                    snapshot,
                } => self.publish(ChannelEvent::SessionUpdate {
                    session_id,
                    snapshot,
                }),
                InboundFrame::Message(value) => self.publish(ChannelEvent::Message(value)),
            }
        }
    }

    async fn resolve_response(&self, response: ResponseFrame) {
        let entry = self.pending.lock().await.remove(&response.request_id);
        let Some(entry) = entry else {
            tracing::debug!(
                request_id = %response.request_id,
                "Response for unknown or expired request; ignoring"
            );
            return;
        };

        let outcome = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(PendingFailure::Remote(response.error.unwrap_or_else(|| {
                format!("{} failed without a reason", entry.request_type)
            })))
        };
        let _ = entry.tx.send(outcome);
    }

    async fn cancel_pending(&self, request_id: &str, reason: &str) {
        if let Some(entry) = self.pending.lock().await.remove(request_id) {
            let _ = entry.tx.send(Err(PendingFailure::Cancelled(reason.to_string())));
        }
    }

    /// Tear down the connection of `generation` and start reconnecting.
    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut st = self.state.lock().await;
        if generation != st.generation || st.transport.is_none() {
            return;
        }

        if let Some(token) = st.connection_token.take() {
            token.cancel();
        }
        if let Some(transport) = st.transport.take() {
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
        if let Some(task) = st.drain_task.take() {
            task.abort();
        }
        st.draining = false;

        if st.manual_close {
            return;
        }
        tracing::warn!(generation, "Channel lost: {reason}");
        self.schedule_reconnect(&mut st);
    }

    fn spawn_connection_lost(self: &Arc<Self>, generation: u64, reason: &'static str) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.connection_lost(generation, reason).await });
    }

    fn schedule_reconnect(self: &Arc<Self>, st: &mut State) {
        if st.reconnecting {
            return;
        }
        if st.backoff.exhausted() {
            self.give_up(st);
            return;
        }
        st.reconnecting = true;
        self.set_status(ConnectionStatus::Reconnecting);
        let inner = Arc::clone(self);
        st.reconnect_task = Some(tokio::spawn(async move { inner.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let (delay, attempt, url) = {
                let mut st = self.state.lock().await;
                if st.manual_close || !st.reconnecting {
                    return;
                }
                if st.backoff.exhausted() {
                    self.give_up(&mut st);
                    return;
                }
                let delay = st.backoff.next_delay();
                (delay, st.backoff.attempt(), st.endpoint.clone())
            };
            let Some(url) = url else {
                return;
            };

            metrics::record_reconnect_attempt(attempt);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            match self.open(&url).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(attempt, "Reconnect attempt failed: {e}"),
            }
        }
    }

    fn give_up(&self, st: &mut State) {
        let attempts = st.backoff.attempt();
        st.reconnecting = false;
        tracing::error!(
            attempts,
            "Reconnect attempts exhausted; channel stays down until connect() is called"
        );
        self.set_status(ConnectionStatus::Error);
        let reason = format!("gave up after {attempts} reconnect attempt(s)");
        for waiter in st.connect_waiters.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    /// Send now if possible, otherwise queue.
    async fn transmit(self: &Arc<Self>, st: &mut State, queued: QueuedFrame) -> Result<()> {
        let mut broken = false;
        if st.outbound.is_empty() && self.status() == ConnectionStatus::Connected {
            if let Some(transport) = st.transport.clone() {
                if st.limiter.try_acquire() {
                    match transport.send(queued.frame.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::warn!("Send failed; queueing frame: {e}");
                            broken = true;
                            self.spawn_connection_lost(st.generation, "send failed");
                        }
                    }
                }
            }
        }

        self.enqueue(st, queued).await?;
        if !broken && self.status() == ConnectionStatus::Connected {
            self.schedule_drain(st);
        }
        Ok(())
    }

    async fn enqueue(&self, st: &mut State, queued: QueuedFrame) -> Result<()> {
        match st.outbound.push(queued) {
            Ok(None) => Ok(()),
            Ok(Some(evicted)) => {
                tracing::warn!(
                    capacity = self.config.outbound_queue_max,
                    "Outbound queue full; dropped oldest frame"
                );
                metrics::record_dropped("overflow", 1);
                if let Some(request_id) = evicted.request_id {
                    self.cancel_pending(&request_id, "request evicted from full outbound queue")
                        .await;
                }
                self.publish(ChannelEvent::FramesDropped { count: 1 });
                Ok(())
            }
            Err(e) => {
                metrics::record_dropped("rejected", 1);
                Err(e.into())
            }
        }
    }

    fn schedule_drain(self: &Arc<Self>, st: &mut State) {
        if st.draining {
            return;
        }
        st.draining = true;
        let inner = Arc::clone(self);
        st.drain_task = Some(tokio::spawn(async move { inner.drain_outbound().await }));
    }

    /// Send queued frames in order, waiting out the rate limit as needed.
    async fn drain_outbound(self: Arc<Self>) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let transport = match (&st.transport, self.status()) {
                    (Some(transport), ConnectionStatus::Connected) => Arc::clone(transport),
                    _ => {
                        st.draining = false;
                        return;
                    }
                };
                if st.outbound.is_empty() {
                    st.draining = false;
                    return;
                }

                if st.limiter.try_acquire() {
                    let Some(queued) = st.outbound.pop_front() else {
                        st.draining = false;
                        return;
                    };
                    if let Err(e) = transport.send(queued.frame.clone()).await {
                        tracing::warn!("Queued send failed: {e}");
                        st.outbound.push_front(queued);
                        st.draining = false;
                        self.spawn_connection_lost(st.generation, "send failed");
                        return;
                    }
                    None
                } else {
                    Some(st.limiter.retry_after())
                }
            };

            if let Some(wait) = wait {
                tracing::debug!(
                    wait_ms = wait.as_millis() as u64,
                    "Rate limited; deferring queued frames"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Move the low-priority batch into the send path.
    async fn flush_batch(self: &Arc<Self>, st: &mut State) {
        if st.batch.is_empty() {
            return;
        }
        st.batch_generation = st.batch_generation.wrapping_add(1);
        // A stale timer sees the new generation and does nothing.
        st.batch_task = None;

        let mut messages = std::mem::take(&mut st.batch);
        let count = messages.len();
        let frame = if count == 1 {
            messages.remove(0)
        } else {
            frame::batch(messages)
        };

        if let Err(e) = self
            .transmit(st, QueuedFrame::new(frame.to_string(), None))
            .await
        {
            tracing::warn!(count, "Dropping batched frames: {e}");
            metrics::record_dropped("rejected", count);
        }
    }
}
