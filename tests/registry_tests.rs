//! Worker registry integration tests.
//!
//! Registers fake workers over real gRPC connections and checks the live set,
//! the selection strategies and removal when a worker's health stream ends.


use std::collections::HashSet;
use std::time::Duration;

use fleet_relay::config::AddressMap;
use fleet_relay::error::FleetError;
use fleet_relay::proto;
use fleet_relay::workers::{WorkerHandle, WorkerType};
use test_harness::{assert_eventually, test_registry, test_registry_with_map, FakeWorker};

/// A registered worker is pickable until its health stream ends, then it is
/// removed from the live set.
#[tokio::test]
async fn test_worker_removed_when_health_stream_ends() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let registry = test_registry();

    registry
        .register_worker("w1", &fake.address(), WorkerType::Runner)
        .await
        .expect("register");

    let picked = registry
        .pick_worker_randomly(WorkerType::Runner)
        .expect("a runner should be eligible");
    assert_eq!(picked.worker_id(), "w1");

    fake.end_health_streams();

    assert_eventually(
        || async { registry.get_worker("w1").is_none() },
        Duration::from_secs(5),
        "worker should be unregistered after its health stream ends",
    )
    .await;
    assert!(registry.pick_worker_randomly(WorkerType::Runner).is_none());
    assert!(picked.connection().is_cancelled());
}

/// A failed health stream removes the worker just like a clean end.
#[tokio::test]
async fn test_worker_removed_when_health_stream_fails() {
    let fake = FakeWorker::start("w-fail", proto::WorkerType::Launcher).await;
    let registry = test_registry();

    registry
        .register_worker("w-fail", &fake.address(), WorkerType::Launcher)
        .await
        .expect("register");
    assert_eq!(registry.len(), 1);

    fake.fail_health_streams();

    assert_eventually(
        || async { registry.is_empty() },
        Duration::from_secs(5),
        "worker should be unregistered after its health stream fails",
    )
    .await;
}

/// Registering a live id again does not open a second connection.
#[tokio::test]
async fn test_register_is_idempotent() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let registry = test_registry();

    registry
        .register_worker("w1", &fake.address(), WorkerType::Runner)
        .await
        .expect("first register");
    let first = registry.get_worker("w1").expect("registered");

    registry
        .register_worker("w1", &fake.address(), WorkerType::Runner)
        .await
        .expect("second register");
    let second = registry.get_worker("w1").expect("still registered");

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(fake.handshakes(), 1);
    assert_eq!(registry.len(), 1);
}

/// Concurrent registrations of the same id serialize into one connection.
#[tokio::test]
async fn test_concurrent_registration_connects_once() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let registry = test_registry();
    let address = fake.address();

    let (a, b, c) = tokio::join!(
        registry.register_worker("w1", &address, WorkerType::Runner),
        registry.register_worker("w1", &address, WorkerType::Runner),
        registry.register_worker("w1", &address, WorkerType::Runner),
    );
    a.expect("register a");
    b.expect("register b");
    c.expect("register c");

    assert_eq!(fake.handshakes(), 1);
    assert_eq!(registry.len(), 1);
}

/// An unreachable address fails registration with a retryable error and
/// leaves nothing behind.
#[tokio::test]
async fn test_register_unreachable_worker_fails() {
    let registry = test_registry();

    let err = registry
        .register_worker("ghost", "127.0.0.1:1", WorkerType::Runner)
        .await
        .unwrap_err();

    assert!(err.is_retryable(), "unexpected error: {err}");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_register_rejects_empty_fields() {
    let registry = test_registry();

    let err = registry
        .register_worker("", "127.0.0.1:9000", WorkerType::Runner)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));

    let err = registry
        .register_worker("w1", " ", WorkerType::Runner)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidConfig(_)));
}

/// Workers reporting unhealthy or not accepting jobs are skipped by every
/// picker, and come back once they recover.
#[tokio::test]
async fn test_ineligible_workers_are_not_picked() {
    let fake = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let registry = test_registry();
    registry
        .register_worker("w1", &fake.address(), WorkerType::Runner)
        .await
        .expect("register");

    fake.set_health(true, false);
    assert_eventually(
        || async { registry.pick_worker_randomly(WorkerType::Runner).is_none() },
        Duration::from_secs(5),
        "worker not accepting jobs should not be picked",
    )
    .await;
    assert!(registry
        .pick_worker_by_key("session-1", WorkerType::Runner)
        .is_none());
    assert!(registry
        .pick_worker_by_hash(WorkerType::Runner, b"alpine")
        .is_none());
    // still registered, just not eligible
    assert!(registry.get_worker("w1").is_some());

    fake.set_health(false, true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.pick_worker_randomly(WorkerType::Runner).is_none());

    fake.set_health(true, true);
    assert_eventually(
        || async { registry.pick_worker_randomly(WorkerType::Runner).is_some() },
        Duration::from_secs(5),
        "recovered worker should be picked again",
    )
    .await;
}

/// Pickers only consider workers of the requested type.
#[tokio::test]
async fn test_pick_filters_by_type() {
    let runner = FakeWorker::start("runner-1", proto::WorkerType::Runner).await;
    let launcher = FakeWorker::start("launcher-1", proto::WorkerType::Launcher).await;
    let registry = test_registry();

    registry
        .register_worker("runner-1", &runner.address(), WorkerType::Runner)
        .await
        .expect("register runner");
    registry
        .register_worker("launcher-1", &launcher.address(), WorkerType::Launcher)
        .await
        .expect("register launcher");

    for _ in 0..20 {
        let picked = registry
            .pick_worker_randomly(WorkerType::Launcher)
            .expect("launcher available");
        assert_eq!(picked.worker_id(), "launcher-1");
        assert!(picked.as_launcher().is_some());
    }
    assert!(registry.pick_worker_randomly(WorkerType::Remote).is_none());

    let runners = registry.list_workers_by_type(WorkerType::Runner);
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].worker_id(), "runner-1");
}

/// Random picks spread over every eligible worker.
#[tokio::test]
async fn test_random_pick_reaches_every_worker() {
    let mut fakes = Vec::new();
    let registry = test_registry();
    for id in ["r-a", "r-b", "r-c"] {
        let fake = FakeWorker::start(id, proto::WorkerType::Runner).await;
        registry
            .register_worker(id, &fake.address(), WorkerType::Runner)
            .await
            .expect("register");
        fakes.push(fake);
    }

    let mut seen = HashSet::new();
    for _ in 0..200 {
        let picked = registry
            .pick_worker_randomly(WorkerType::Runner)
            .expect("runner available");
        seen.insert(picked.worker_id().to_string());
    }
    assert_eq!(seen.len(), 3);
}

/// Keyed picks are stable, and removing a different worker does not move
/// the key.
#[tokio::test]
async fn test_pick_by_key_is_stable() {
    let mut fakes = Vec::new();
    let registry = test_registry();
    for id in ["k-a", "k-b", "k-c"] {
        let fake = FakeWorker::start(id, proto::WorkerType::Runner).await;
        registry
            .register_worker(id, &fake.address(), WorkerType::Runner)
            .await
            .expect("register");
        fakes.push(fake);
    }

    let winner = registry
        .pick_worker_by_key("tenant-42", WorkerType::Runner)
        .expect("pick")
        .worker_id()
        .to_string();
    for _ in 0..10 {
        let again = registry
            .pick_worker_by_key("tenant-42", WorkerType::Runner)
            .expect("pick");
        assert_eq!(again.worker_id(), winner);
    }

    let loser = fakes
        .iter()
        .find(|fake| fake.worker_id != winner)
        .expect("another worker");
    let loser_id = loser.worker_id.clone();
    loser.disconnect();
    assert_eventually(
        || async { registry.get_worker(&loser_id).is_none() },
        Duration::from_secs(5),
        "disconnected worker should be unregistered",
    )
    .await;

    let after = registry
        .pick_worker_by_key("tenant-42", WorkerType::Runner)
        .expect("pick");
    assert_eq!(after.worker_id(), winner);
}

/// Hash picks are deterministic and skip ineligible workers.
#[tokio::test]
async fn test_pick_by_hash_walks_to_eligible_worker() {
    let mut fakes = Vec::new();
    let registry = test_registry();
    for id in ["h-a", "h-b"] {
        let fake = FakeWorker::start(id, proto::WorkerType::Remote).await;
        registry
            .register_worker(id, &fake.address(), WorkerType::Remote)
            .await
            .expect("register");
        fakes.push(fake);
    }

    let first = registry
        .pick_worker_by_hash(WorkerType::Remote, b"https://mcp.example.com/sse")
        .expect("pick");
    let again = registry
        .pick_worker_by_hash(WorkerType::Remote, b"https://mcp.example.com/sse")
        .expect("pick");
    assert_eq!(first.worker_id(), again.worker_id());

    let first_id = first.worker_id().to_string();
    let busy = fakes
        .iter()
        .find(|fake| fake.worker_id == first_id)
        .expect("fake for picked worker");
    busy.set_health(true, false);

    assert_eventually(
        || async {
            registry
                .pick_worker_by_hash(WorkerType::Remote, b"https://mcp.example.com/sse")
                .is_some_and(|w| w.worker_id() != first_id)
        },
        Duration::from_secs(5),
        "hash pick should move to the other eligible worker",
    )
    .await;
}

/// Standalone workers get a generated id and survive the end of their
/// health stream, but are no longer eligible.
#[tokio::test]
async fn test_standalone_worker_is_not_unregistered() {
    let fake = FakeWorker::start("standalone", proto::WorkerType::Runner).await;
    let registry = test_registry();

    let worker_id = registry
        .register_standalone(WorkerType::Runner, &fake.address())
        .await
        .expect("register standalone");
    assert!(uuid::Uuid::parse_str(&worker_id).is_ok());

    let summary = registry
        .list_workers()
        .into_iter()
        .find(|w| w.worker_id == worker_id)
        .expect("listed");
    assert!(summary.standalone);

    fake.end_health_streams();
    assert_eventually(
        || async { registry.pick_worker_randomly(WorkerType::Runner).is_none() },
        Duration::from_secs(5),
        "standalone worker should stop being eligible",
    )
    .await;

    registry.self_unregister_worker(&worker_id);
    assert!(registry.get_worker(&worker_id).is_some());
}

/// An id freed by a dead worker can be registered again, and the old
/// worker's monitor does not remove the new one.
#[tokio::test]
async fn test_reregister_after_disconnect() {
    let first = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    let registry = test_registry();

    registry
        .register_worker("w1", &first.address(), WorkerType::Runner)
        .await
        .expect("register first");
    first.disconnect();
    assert_eventually(
        || async { registry.get_worker("w1").is_none() },
        Duration::from_secs(5),
        "first instance should be unregistered",
    )
    .await;

    let second = FakeWorker::start("w1", proto::WorkerType::Runner).await;
    registry
        .register_worker("w1", &second.address(), WorkerType::Runner)
        .await
        .expect("register second");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let worker = registry.get_worker("w1").expect("second instance registered");
    assert_eq!(worker.address(), second.address());
    assert!(worker.is_eligible());
}

/// Advertised addresses are rewritten through the address map before dialing.
#[tokio::test]
async fn test_address_map_rewrites_worker_address() {
    let fake = FakeWorker::start("mapped", proto::WorkerType::Runner).await;
    let registry =
        test_registry_with_map(AddressMap::default().with_entry("worker-host", "127.0.0.1"));

    let advertised = format!("worker-host:{}", fake.port());
    registry
        .register_worker("mapped", &advertised, WorkerType::Runner)
        .await
        .expect("register through address map");

    let worker = registry.get_worker("mapped").expect("registered");
    assert_eq!(worker.address(), fake.address());
}

/// Stopping the registry closes every connection and empties it.
#[tokio::test]
async fn test_stop_closes_all_workers() {
    let a = FakeWorker::start("s-a", proto::WorkerType::Runner).await;
    let b = FakeWorker::start("s-b", proto::WorkerType::Launcher).await;
    let registry = test_registry();

    registry
        .register_worker("s-a", &a.address(), WorkerType::Runner)
        .await
        .expect("register a");
    registry
        .register_standalone(WorkerType::Launcher, &b.address())
        .await
        .expect("register b");
    let held = registry.get_worker("s-a").expect("registered");

    registry.stop();

    assert!(registry.is_empty());
    assert!(held.connection().is_cancelled());
    assert!(!held.is_eligible());
}

#[tokio::test]
async fn test_list_workers_reports_health() {
    let fake = FakeWorker::start("listed", proto::WorkerType::Remote).await;
    let registry = test_registry();
    registry
        .register_worker("listed", &fake.address(), WorkerType::Remote)
        .await
        .expect("register");

    let workers = registry.list_workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_type, WorkerType::Remote);
    assert!(workers[0].healthy);
    assert!(workers[0].accepting_jobs);
    assert!(!workers[0].standalone);

    fake.set_health(false, false);
    assert_eventually(
        || async {
            registry
                .list_workers()
                .first()
                .is_some_and(|w| !w.healthy && !w.accepting_jobs)
        },
        Duration::from_secs(5),
        "listing should reflect the latest health snapshot",
    )
    .await;
}
