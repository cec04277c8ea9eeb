//! Connection manager integration tests
//!
//! Drive a `ConnectionManager` against the scripted fake backend with paused
//! time: request timeouts, reconnect backoff, heartbeat loss and the
//! outbound queue policies.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use chatlink::config::OverflowPolicy;
use chatlink::error::kind_of;
use chatlink::{ChatlinkError, ConnectionStatus};

use common::{connection_config, manager, wait_until, ENDPOINT};

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out_and_is_forgotten() {
    let mut config = connection_config();
    config.heartbeat_interval_ms = 10_000;
    config.heartbeat_timeout_ms = 30_000;
    let (manager, _connector, backend) = manager(config);
    manager.connect(ENDPOINT).await.unwrap();
    backend.set_responding(false);

    let started = Instant::now();
    let err = manager
        .request::<_, Value>(
            "session:validate",
            json!({ "sessionId": "s" }),
            Some(Duration::from_millis(5_000)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        kind_of(&err),
        Some(ChatlinkError::RequestTimeout {
            timeout_ms: 5_000,
            ..
        })
    ));
    assert!(elapsed >= Duration::from_millis(5_000));
    assert!(elapsed < Duration::from_millis(5_100));
    assert_eq!(manager.pending_requests().await, 0);
    assert_eq!(backend.count("session:validate"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_round_trip() {
    let (manager, _connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();

    let info: Value = manager
        .request("session:create", json!({ "snapshot": {} }), None)
        .await
        .unwrap();
    assert_eq!(info["sessionId"], "session-1");

    let err = manager
        .request::<_, Value>("unknown:op", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), Some(ChatlinkError::Remote(_))));
    assert_eq!(backend.count("unknown:op"), 1);
    assert_eq!(manager.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_exhaustion_then_explicit_connect() {
    let (manager, connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();
    let mut status = manager.watch_status();

    connector.refuse_all(true);
    backend.hang_up();

    // 100 + 200 + 400ms of backoff, then the manager gives up.
    assert!(
        wait_until(Duration::from_secs(5), || manager.status()
            == ConnectionStatus::Error)
        .await
    );
    assert_eq!(connector.attempts(), 1 + 3);
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Error);

    // No further retries once in the terminal state.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 4);
    assert_eq!(manager.status(), ConnectionStatus::Error);

    connector.refuse_all(false);
    manager.connect(ENDPOINT).await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(manager.reconnect_attempt().await, 0);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_server_close() {
    let (manager, connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();
    let epoch = manager.epoch();

    connector.fail_next(1);
    backend.hang_up();

    assert!(wait_until(Duration::from_secs(2), || manager.epoch() == epoch + 1).await);
    assert!(manager.is_connected());
    assert_eq!(connector.attempts(), 3);
    assert_eq!(manager.reconnect_attempt().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_channel_declared_dead_by_heartbeat() {
    let (manager, _connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();
    let mut events = manager.subscribe();

    // The transport stays open but nothing comes back, not even pongs.
    backend.set_responding(false);
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert!(backend.count("ping") >= 2);
    assert_eq!(backend.connections(), 2);
    let mut saw_reconnecting = false;
    while let Ok(event) = events.try_recv() {
        if let chatlink::ChannelEvent::StatusChanged { current, .. } = event {
            saw_reconnecting |= current == ConnectionStatus::Reconnecting;
        }
    }
    assert!(saw_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeats_keep_channel_alive() {
    let (manager, _connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(manager.is_connected());
    assert_eq!(backend.connections(), 1);
    assert!(backend.count("ping") >= 9);
}

#[tokio::test(start_paused = true)]
async fn test_queued_frames_flush_in_order_on_connect() {
    let (manager, _connector, backend) = manager(connection_config());

    for n in 0..3 {
        manager.send(json!({ "type": "note", "n": n })).await.unwrap();
    }
    assert_eq!(manager.queued().await, 3);

    manager.connect(ENDPOINT).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || backend.count("note") == 3).await);
    let order: Vec<i64> = backend
        .frames_of("note")
        .iter()
        .map(|f| f["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(manager.queued().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_oldest_evicts_and_cancels_queued_request() {
    let mut config = connection_config();
    config.outbound_queue_max = 2;
    config.overflow_policy = OverflowPolicy::DropOldest;
    let (manager, _connector, _backend) = manager(config);

    let requester = manager.clone();
    let request = tokio::spawn(async move {
        requester
            .request::<_, Value>("session:create", json!({}), Some(Duration::from_secs(60)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.queued().await, 1);
    assert_eq!(manager.pending_requests().await, 1);

    manager.send(json!({ "type": "a" })).await.unwrap();
    manager.send(json!({ "type": "b" })).await.unwrap();
    assert_eq!(manager.queued().await, 2);

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(kind_of(&err), Some(ChatlinkError::Cancelled(_))));
    assert_eq!(manager.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reject_new_fails_send_when_full() {
    let mut config = connection_config();
    config.outbound_queue_max = 2;
    config.overflow_policy = OverflowPolicy::RejectNew;
    let (manager, _connector, backend) = manager(config);

    manager.send(json!({ "type": "a" })).await.unwrap();
    manager.send(json!({ "type": "b" })).await.unwrap();
    let err = manager.send(json!({ "type": "c" })).await.unwrap_err();
    assert!(matches!(
        kind_of(&err),
        Some(ChatlinkError::QueueFull { capacity: 2 })
    ));

    manager.connect(ENDPOINT).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || backend.count("b") == 1).await);
    assert_eq!(backend.count("a"), 1);
    assert_eq!(backend.count("c"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_and_stops_reconnecting() {
    let (manager, connector, backend) = manager(connection_config());
    manager.connect(ENDPOINT).await.unwrap();
    backend.set_responding(false);

    let requester = manager.clone();
    let request = tokio::spawn(async move {
        requester
            .request::<_, Value>("session:sync", json!({}), None)
            .await
    });
    assert!(wait_until(Duration::from_secs(1), || backend.count("session:sync") == 1).await);

    manager.disconnect().await.unwrap();
    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(kind_of(&err), Some(ChatlinkError::Cancelled(_))));
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}
