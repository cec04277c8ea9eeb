//! WebSocket transport built on `tokio-tungstenite`
//!
//! The socket is split into a writer task fed by an mpsc channel and a reader
//! task that forwards text frames. Protocol-level ping/pong is answered by
//! tungstenite itself; application heartbeats travel as ordinary frames.

use std::pin::Pin;
use std::sync::Arc;

use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Connector, Transport};
use crate::error::{ChatlinkError, Result};

/// Opens [`WebSocketTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Arc<dyn Transport>> {
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ChatlinkError::Config(format!(
                    "unsupported endpoint scheme '{other}', expected ws or wss"
                ))
                .into())
            }
        }

        let (stream, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| ChatlinkError::Transport(format!("connect to {endpoint} failed: {e}")))?;
        tracing::debug!(%endpoint, "WebSocket handshake complete");

        Ok(Arc::new(WebSocketTransport::spawn(stream)))
    }
}

/// One open WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl WebSocketTransport {
    fn spawn<S>(stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    next = outbound_rx.recv() => match next {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                tracing::warn!("WebSocket write failed: {e}");
                                writer_shutdown.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = source.next() => match next {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(text.as_str().to_owned()).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if inbound_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Err(_) => tracing::warn!("Ignoring non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            tracing::debug!(?frame, "WebSocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("WebSocket read failed: {e}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            // Dropping inbound_tx ends the receive() stream.
            reader_shutdown.cancel();
        });

        Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            shutdown,
        }
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ChatlinkError::Transport("WebSocket is closed".into()).into());
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| ChatlinkError::Transport("WebSocket writer has exited".into()))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.inbound_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|text| (text, rx))
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_websocket_scheme() {
        let connector = WebSocketConnector::new();
        let url = Url::parse("http://localhost:1/ws").unwrap();
        let err = connector.connect(&url).await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ChatlinkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let connector = WebSocketConnector::new();
        // Port 9 (discard) is not listening in test environments.
        let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
        let err = connector.connect(&url).await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ChatlinkError::Transport(_))
        ));
    }
}
