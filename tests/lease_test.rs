//! Tests for the lease lifecycle: join, queue, timeout, release.

use std::sync::Arc;
use std::time::Duration;

use residency_core::residency::{
    CoordinatorConfig, MockRuntime, ModelState, ResidencyCoordinator, ResidencyError,
};

const BUDGET_MB: u64 = 12_000;

/// Every model loads at `footprint_mb`, which is also the admission estimate.
fn setup(footprint_mb: u64, latency_ms: u64) -> (Arc<MockRuntime>, Arc<ResidencyCoordinator>) {
    let runtime = Arc::new(
        MockRuntime::new(footprint_mb).with_latency(Duration::from_millis(latency_ms)),
    );
    let config = CoordinatorConfig {
        budget_mb: BUDGET_MB,
        default_estimate_mb: footprint_mb,
        ..Default::default()
    };
    let coordinator = Arc::new(ResidencyCoordinator::new(config, runtime.clone()));
    (runtime, coordinator)
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_load() {
    let (rt, coordinator) = setup(4700, 100);
    let timeout = Duration::from_secs(5);

    let (a, b, c) = futures::join!(
        coordinator.acquire("ocr", timeout),
        coordinator.acquire("ocr", timeout),
        coordinator.acquire("ocr", timeout),
    );
    let leases = [a.unwrap(), b.unwrap(), c.unwrap()];

    assert_eq!(rt.load_calls("ocr"), 1);
    let mut grants: Vec<_> = leases.iter().map(|l| l.grant_id()).collect();
    grants.sort();
    grants.dedup();
    assert_eq!(grants.len(), 3, "every caller gets its own grant");

    let status = coordinator.status();
    let ocr = status.model("ocr").unwrap();
    assert_eq!(ocr.state, ModelState::Resident);
    assert_eq!(ocr.waiter_count, 3);
    assert_eq!(status.metrics.leases_granted, 3);

    drop(leases);
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 0);
}

#[tokio::test]
async fn test_joined_callers_share_a_load_failure() {
    let (rt, coordinator) = setup(4700, 50);
    rt.set_load_failure("ocr", true);
    let timeout = Duration::from_secs(5);

    let (a, b) = futures::join!(
        coordinator.acquire("ocr", timeout),
        coordinator.acquire("ocr", timeout),
    );
    let expected = ResidencyError::LoadFailed("ocr".to_string());
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(rt.load_calls("ocr"), 1);

    let status = coordinator.status();
    let ocr = status.model("ocr").unwrap();
    assert_eq!(ocr.state, ModelState::Unloaded);
    assert_eq!(ocr.waiter_count, 0);
    assert!(ocr.last_error.as_deref().unwrap().contains("injected load failure"));
    assert_eq!(status.metrics.load_failures, 1);

    // Entry is consistent again, so a retry goes back to the adapter.
    rt.set_load_failure("ocr", false);
    let lease = coordinator.acquire("ocr", timeout).await.unwrap();
    assert_eq!(rt.load_calls("ocr"), 2);
    lease.release().unwrap();
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (_rt, coordinator) = setup(1000, 0);

    let first = coordinator.acquire("ocr", Duration::from_secs(1)).await.unwrap();
    let second = coordinator.acquire("ocr", Duration::from_secs(1)).await.unwrap();
    let grant = first.grant_id();

    coordinator.release_grant(grant).unwrap();
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 1);

    let err = coordinator.release_grant(grant).unwrap_err();
    assert_eq!(err, ResidencyError::Usage(grant));
    assert!(err.is_usage_error());

    // The lease itself now reports the double release, and dropping it
    // must not take the other caller's count.
    assert_eq!(first.release().unwrap_err(), ResidencyError::Usage(grant));
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 1);

    second.release().unwrap();
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 0);
}

#[tokio::test]
async fn test_dropped_lease_releases() {
    let (_rt, coordinator) = setup(1000, 0);
    {
        let lease = coordinator.acquire("ocr", Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.model(), "ocr");
        assert!(!lease.is_bypass());
        assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 1);
    }
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 0);
}

#[tokio::test]
async fn test_with_lease_releases_after_work() {
    let (_rt, coordinator) = setup(1000, 0);

    let inner = coordinator.clone();
    let during = coordinator
        .with_lease("ocr", || async move {
            inner.status().model("ocr").unwrap().waiter_count
        })
        .await
        .unwrap();
    assert_eq!(during, 1);
    assert_eq!(coordinator.status().model("ocr").unwrap().waiter_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_acquire_proceeds_after_release() {
    let (rt, coordinator) = setup(8000, 0);

    let held = coordinator.acquire("a", Duration::from_secs(1)).await.unwrap();
    let queued = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.acquire("b", Duration::from_secs(10)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!queued.is_finished());
    assert_eq!(rt.load_calls("b"), 0);

    held.release().unwrap();
    let lease = queued.await.unwrap().unwrap();
    assert_eq!(lease.model(), "b");

    let status = coordinator.status();
    assert_eq!(status.resident(), vec!["b"]);
    assert_eq!(rt.unload_calls("a"), 1);
}

#[tokio::test]
async fn test_timeout_is_bounded() {
    let (_rt, coordinator) = setup(8000, 0);
    let _held = coordinator.acquire("a", Duration::from_secs(1)).await.unwrap();

    let started = std::time::Instant::now();
    let err = coordinator
        .acquire("b", Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ResidencyError::Timeout { ref model, waited_ms } => {
            assert_eq!(model, "b");
            assert!(waited_ms >= 200);
        }
        ref other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(coordinator.status().model("b").unwrap().waiter_count, 0);
}

#[tokio::test]
async fn test_cancelled_caller_leaves_no_waiter() {
    let (rt, coordinator) = setup(4700, 200);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(30),
        coordinator.acquire("ocr", Duration::from_secs(10)),
    )
    .await;
    assert!(cancelled.is_err());

    // The detached load still finishes and leaves a consistent entry.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = coordinator.status();
    let ocr = status.model("ocr").unwrap();
    assert_eq!(ocr.state, ModelState::Resident);
    assert_eq!(ocr.waiter_count, 0);
    assert_eq!(status.metrics.leases_granted, 0);

    let lease = coordinator.acquire("ocr", Duration::from_secs(1)).await.unwrap();
    assert_eq!(rt.load_calls("ocr"), 1);
    lease.release().unwrap();
}

#[tokio::test]
async fn test_join_timeout_does_not_strand_load() {
    let (rt, coordinator) = setup(4700, 300);

    let err = coordinator
        .acquire("ocr", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ResidencyError::Timeout { .. }));
    assert_eq!(coordinator.status().model("ocr").unwrap().state, ModelState::Loading);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = coordinator.status();
    let ocr = status.model("ocr").unwrap();
    assert_eq!(ocr.state, ModelState::Resident);
    assert_eq!(ocr.waiter_count, 0);
    assert_eq!(status.metrics.admission_timeouts, 1);
}

#[tokio::test]
async fn test_unload_failure_keeps_model_resident() {
    let (rt, coordinator) = setup(8000, 0);
    coordinator
        .acquire("a", Duration::from_secs(1))
        .await
        .unwrap()
        .release()
        .unwrap();
    rt.set_unload_failure("a", true);

    let err = coordinator
        .acquire("b", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, ResidencyError::UnloadFailed("a".to_string()));

    let status = coordinator.status();
    let a = status.model("a").unwrap();
    assert_eq!(a.state, ModelState::Resident);
    assert!(a.last_error.is_some());
    assert_eq!(status.used_mb, 8000);
    assert_eq!(status.metrics.unload_failures, 1);
    assert_eq!(rt.load_calls("b"), 0);

    rt.set_unload_failure("a", false);
    let lease = coordinator.acquire("b", Duration::from_secs(1)).await.unwrap();
    assert_eq!(coordinator.status().resident(), vec!["b"]);
    lease.release().unwrap();
}

#[tokio::test]
async fn test_cancelled_evictor_does_not_strand_unload() {
    let (rt, coordinator) = setup(8000, 200);
    coordinator
        .acquire("a", Duration::from_secs(1))
        .await
        .unwrap()
        .release()
        .unwrap();

    // Cancelled while "a" is being unloaded on its behalf.
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        coordinator.acquire("b", Duration::from_secs(10)),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(coordinator.status().model("a").unwrap().state, ModelState::Unloading);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = coordinator.status();
    assert_eq!(status.model("a").unwrap().state, ModelState::Unloaded);
    assert_eq!(status.used_mb, 0);
    assert_eq!(status.metrics.evictions, 1);
    assert_eq!(rt.unload_calls("a"), 1);
    assert_eq!(rt.load_calls("b"), 0);

    let b = coordinator.acquire("b", Duration::from_secs(1)).await.unwrap();
    b.release().unwrap();
    let a = coordinator.acquire("a", Duration::from_secs(1)).await.unwrap();
    assert_eq!(coordinator.status().resident(), vec!["a"]);
    a.release().unwrap();
}

#[tokio::test]
async fn test_unload_failure_wakes_callers_waiting_on_it() {
    let (rt, coordinator) = setup(8000, 200);
    coordinator
        .acquire("a", Duration::from_secs(1))
        .await
        .unwrap()
        .release()
        .unwrap();
    rt.set_unload_failure("a", true);

    let evictor = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.acquire("b", Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.status().model("a").unwrap().state, ModelState::Unloading);

    // Queued behind the unload; must wake when it fails, not at the deadline.
    let started = std::time::Instant::now();
    let lease = coordinator.acquire("a", Duration::from_secs(2)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(coordinator.status().model("a").unwrap().state, ModelState::Resident);

    let err = evictor.await.unwrap().unwrap_err();
    assert_eq!(err, ResidencyError::UnloadFailed("a".to_string()));
    lease.release().unwrap();
}

#[tokio::test]
async fn test_acquire_after_shutdown_is_rejected() {
    let (rt, coordinator) = setup(1000, 0);
    coordinator.shutdown(Duration::from_millis(10)).await;

    let err = coordinator
        .acquire("ocr", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, ResidencyError::ShuttingDown);
    assert_eq!(rt.load_calls("ocr"), 0);
}
