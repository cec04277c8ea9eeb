//! In-process fake connector and transport
//!
//! [`FakeConnector::new`] returns the connector together with a [`FakeServer`].
//! Every successful `connect()` hands the server side of the new connection,
//! a [`FakePeer`], to the server, so tests can observe outbound frames, inject
//! inbound frames, and drop connections.
//!
//! ```text
//! manager send()  ---> outbound_tx ---> peer.outbound_rx  (peer.recv())
//! peer.send()     ---> inbound_tx  ---> transport.receive()
//! ```
//!
//! Connect failures and hangs are scripted on the connector.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Connector, Transport};
use crate::error::{ChatlinkError, Result};

#[derive(Debug, Default)]
struct Script {
    fail_next: AtomicU32,
    refuse_all: AtomicBool,
    hang: AtomicBool,
    attempts: AtomicU32,
}

/// Connector producing in-memory transports.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    script: Arc<Script>,
    accepted_tx: mpsc::UnboundedSender<FakePeer>,
}

/// Receives the server side of every accepted connection.
#[derive(Debug)]
pub struct FakeServer {
    accepted_rx: mpsc::UnboundedReceiver<FakePeer>,
}

impl FakeConnector {
    /// Create a connector and its server.
    pub fn new() -> (Self, FakeServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::new(Script::default()),
                accepted_tx,
            },
            FakeServer { accepted_rx },
        )
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next(&self, n: u32) {
        self.script.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.script.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Make connect attempts never complete until switched off.
    pub fn hang(&self, hang: bool) {
        self.script.hang.store(hang, Ordering::SeqCst);
    }

    /// Number of connect attempts made so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.script.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Arc<dyn Transport>> {
        self.script.attempts.fetch_add(1, Ordering::SeqCst);

        if self.script.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.script.refuse_all.load(Ordering::SeqCst) {
            return Err(ChatlinkError::Transport(format!("{endpoint} refused connection")).into());
        }
        let failing = self
            .script
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatlinkError::Transport(format!("{endpoint} unreachable")).into());
        }

        let (transport, peer) = FakeTransport::pair();
        self.accepted_tx
            .send(peer)
            .map_err(|_| ChatlinkError::Transport("fake server dropped".into()))?;
        Ok(Arc::new(transport))
    }
}

impl FakeServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<FakePeer> {
        self.accepted_rx.recv().await
    }

    /// Accepted connection, if one is already waiting.
    pub fn try_accept(&mut self) -> Option<FakePeer> {
        self.accepted_rx.try_recv().ok()
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    closed: CancellationToken,
}

impl FakeTransport {
    /// Create a connected `(transport, peer)` pair.
    pub fn pair() -> (Self, FakePeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let closed = CancellationToken::new();
        (
            Self {
                outbound_tx,
                inbound_rx: Arc::new(Mutex::new(inbound_rx)),
                closed: closed.clone(),
            },
            FakePeer {
                outbound_rx,
                inbound_tx: Some(inbound_tx),
                closed,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ChatlinkError::Transport("fake transport closed".into()).into());
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| ChatlinkError::Transport("fake peer hung up".into()))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.inbound_rx);
        let closed = self.closed.clone();
        Box::pin(futures::stream::unfold(
            (rx, closed),
            |(rx, closed)| async move {
                let next = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        _ = closed.cancelled() => None,
                        msg = guard.recv() => msg,
                    }
                };
                next.map(|msg| (msg, (rx, closed)))
            },
        ))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct FakePeer {
    /// Frames the client sent, in order
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: Option<mpsc::UnboundedSender<String>>,
    closed: CancellationToken,
}

impl FakePeer {
    /// Push a frame to the client. Returns false once the connection is gone.
    pub fn send(&self, frame: Value) -> bool {
        self.send_raw(frame.to_string())
    }

    /// Push raw text to the client.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        match &self.inbound_tx {
            Some(tx) if !self.closed.is_cancelled() => tx.send(text.into()).is_ok(),
            _ => false,
        }
    }

    /// Next frame the client sent, decoded.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let raw = self.outbound_rx.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!("fake peer received undecodable frame: {e}"),
            }
        }
    }

    /// Every frame already sent by the client, decoded.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.outbound_rx.try_recv() {
            if let Ok(value) = serde_json::from_str(&raw) {
                frames.push(value);
            }
        }
        frames
    }

    /// Simulate the server closing the connection.
    pub fn hang_up(&mut self) {
        self.inbound_tx = None;
    }

    /// Whether the client closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
