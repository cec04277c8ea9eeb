//! Duplex transport abstraction
//!
//! The connection manager never touches sockets directly. A [`Connector`]
//! opens a [`Transport`] for an endpoint; the transport carries complete JSON
//! frames as strings in both directions.
//!
//! - [`websocket::WebSocketConnector`] opens real WebSocket connections.
//! - [`fake::FakeConnector`] hands out in-process transports for tests.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use url::Url;

use crate::error::Result;

/// One open duplex connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send one complete serialized frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ChatlinkError::Transport`] once the connection
    /// is closed.
    async fn send(&self, message: String) -> Result<()>;

    /// Stream of inbound serialized frames.
    ///
    /// The stream ends when the connection closes from either side.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Factory for transports.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a connection to `endpoint`.
    async fn connect(&self, endpoint: &Url) -> Result<Arc<dyn Transport>>;
}

pub mod fake;
pub mod websocket;
