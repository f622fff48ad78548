//! Worker connection tests.
//!
//! Exercises the handshake and the health stream of a single connection
//! against a fake worker.


use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_relay::config::ConnectionConfig;
use fleet_relay::error::FleetError;
use fleet_relay::proto;
use fleet_relay::workers::{HealthStatus, WorkerConnection};
use test_harness::FakeWorker;

fn connection(fake: &FakeWorker, parent: &CancellationToken) -> WorkerConnection {
    WorkerConnection::new(
        &fake.worker_id,
        &fake.address(),
        ConnectionConfig {
            connect_timeout_ms: 1_000,
            ..Default::default()
        },
        parent,
    )
}

/// The handshake marks the worker eligible and publishes its first snapshot.
#[tokio::test]
async fn test_handshake_publishes_health() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let parent = CancellationToken::new();
    let conn = connection(&fake, &parent);
    let mut health = conn.health_broadcast().subscribe();

    assert!(!conn.is_healthy());
    conn.start().await.expect("start");

    assert!(conn.is_healthy());
    assert!(conn.is_accepting_jobs());
    assert!(conn.channel().is_ok());

    let snapshot = health.recv().await.expect("first snapshot");
    assert_eq!(snapshot.worker_id, "w1");
    assert_eq!(snapshot.status, HealthStatus::Healthy);
    assert!(snapshot.accepting_jobs);
    assert_eq!(fake.handshakes(), 1);

    let err = conn.start().await.unwrap_err();
    assert!(matches!(err, FleetError::AlreadyStarted));
}

/// Health changes pushed by the worker update the connection and reach
/// subscribers.
#[tokio::test]
async fn test_health_updates_are_published() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let parent = CancellationToken::new();
    let conn = connection(&fake, &parent);
    conn.start().await.expect("start");
    let mut health = conn.health_broadcast().subscribe();

    fake.set_health(false, false);

    let changed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match health.recv().await {
                Some(snapshot) if snapshot.status == HealthStatus::Unhealthy => return snapshot,
                Some(_) => continue,
                None => panic!("health broadcast closed"),
            }
        }
    })
    .await
    .expect("unhealthy snapshot in time");

    assert!(!changed.accepting_jobs);
    assert!(!conn.is_healthy());
    assert!(!conn.is_accepting_jobs());
}

/// The end of the health stream cancels the connection and everything
/// hanging off it.
#[tokio::test]
async fn test_health_stream_end_cancels_connection() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let parent = CancellationToken::new();
    let conn = connection(&fake, &parent);
    conn.start().await.expect("start");
    let child = conn.child_token();

    fake.end_health_streams();

    tokio::time::timeout(Duration::from_secs(5), conn.cancelled())
        .await
        .expect("connection should be cancelled");
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
    assert!(!conn.is_healthy());
    assert!(matches!(conn.channel(), Err(FleetError::ConnectionClosed)));
}

/// Cancelling the owner's token stops the connection.
#[tokio::test]
async fn test_parent_cancel_stops_connection() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Launcher).await;
    let parent = CancellationToken::new();
    let conn = connection(&fake, &parent);
    conn.start().await.expect("start");

    parent.cancel();

    assert!(conn.is_cancelled());
    assert!(!conn.is_healthy());
    assert!(!conn.is_accepting_jobs());
    assert!(matches!(conn.channel(), Err(FleetError::ConnectionClosed)));
}

/// A connection that failed its handshake is cancelled.
#[tokio::test]
async fn test_unreachable_worker_fails_start() {
    let parent = CancellationToken::new();
    let conn = WorkerConnection::new(
        "ghost",
        "127.0.0.1:1",
        ConnectionConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        },
        &parent,
    );

    let err = conn.start().await.unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err}");
    assert!(conn.is_cancelled());
    assert!(matches!(conn.channel(), Err(FleetError::ConnectionClosed)));
}

/// A stopped connection closes its health broadcast.
#[tokio::test]
async fn test_stop_closes_health_broadcast() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Remote).await;
    let parent = CancellationToken::new();
    let conn = connection(&fake, &parent);
    conn.start().await.expect("start");
    let mut health = conn.health_broadcast().subscribe();

    conn.stop();
    conn.stop();

    while health.recv().await.is_some() {}
    assert!(conn.health_broadcast().is_closed());
    assert!(conn.is_cancelled());
}
