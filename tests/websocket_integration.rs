//! WebSocket transport integration tests
//!
//! A real `tokio-tungstenite` server on a loopback port answers requests and
//! heartbeats; a `bye` frame makes it close the connection.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chatlink::channel::transport::websocket::WebSocketConnector;
use chatlink::ConnectionManager;

use common::{connection_config, wait_until};

async fn spawn_server() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let reply = match frame["type"].as_str() {
                        Some("ping") => json!({ "type": "pong", "timestamp": frame["timestamp"] }),
                        Some("bye") => {
                            let _ = socket.close(None).await;
                            return;
                        }
                        _ => match frame.get("requestId") {
                            Some(id) => json!({
                                "type": "response",
                                "requestId": id,
                                "success": true,
                                "data": { "connection": n, "echo": frame["payload"] }
                            }),
                            None => continue,
                        },
                    };
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/ws"), connections)
}

#[tokio::test]
async fn test_request_round_trip_over_websocket() {
    let (endpoint, _connections) = spawn_server().await;
    let manager = ConnectionManager::new(connection_config(), Arc::new(WebSocketConnector::new()));
    manager.connect(&endpoint).await.unwrap();
    assert!(manager.is_connected());

    let reply: Value = manager
        .request("echo:test", json!({ "value": 42 }), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply["echo"]["value"], 42);
    assert_eq!(reply["connection"], 1);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let (endpoint, connections) = spawn_server().await;
    let manager = ConnectionManager::new(connection_config(), Arc::new(WebSocketConnector::new()));
    manager.connect(&endpoint).await.unwrap();
    let epoch = manager.epoch();

    manager.send(json!({ "type": "bye" })).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.epoch() > epoch).await);
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    let reply: Value = manager
        .request("echo:test", json!({}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply["connection"], 2);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let manager = ConnectionManager::new(connection_config(), Arc::new(WebSocketConnector::new()));
    assert!(manager.connect(&format!("ws://{addr}/ws")).await.is_err());
    assert!(!manager.is_connected());
    manager.disconnect().await.unwrap();
}
