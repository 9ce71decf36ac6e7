//! Smoke tests against a live Redis instance.
//!
//! Ignored by default; run with a server available:
//!
//! ```text
//! TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -p vestibule-queue -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::AsyncTypedCommands;
use deadpool_redis::{Config, Runtime};

use vestibule_core::{KeyPrefix, Placement, StoreCapacity};
use vestibule_queue::backend::{AtomicOps, RedisBackend};
use vestibule_queue::control::AdmissionControl;

const VALIDATED: Duration = Duration::from_secs(600);
const QUARANTINE: Duration = Duration::from_secs(45);

fn redis_url() -> String {
    std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| String::from("redis://127.0.0.1:6379"))
}

async fn connect(prefix: &str) -> (Arc<RedisBackend>, AdmissionControl, KeyPrefix) {
    let backend = RedisBackend::connect(
        redis_url(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .expect("backend");
    backend.init().await.expect("script registration");

    let backend = Arc::new(backend);
    let control = AdmissionControl::new(backend.clone(), VALIDATED, QUARANTINE, Duration::ZERO);
    (backend, control, KeyPrefix::new(prefix))
}

async fn clean(prefix: &KeyPrefix) {
    let pool = Config::from_url(redis_url())
        .create_pool(Some(Runtime::Tokio1))
        .expect("cleanup pool");
    let mut conn = pool.get().await.expect("cleanup connection");
    let keys = conn
        .keys(format!("{prefix}:*"))
        .await
        .expect("list keys");
    for key in keys {
        conn.del(&key).await.expect("delete key");
    }
}

#[tokio::test]
#[ignore = "requires a running Redis at TEST_REDIS_URL"]
async fn admits_queues_and_promotes() {
    let (backend, control, prefix) = connect("vestibule_it_admit").await;
    clean(&prefix).await;

    control
        .init(&prefix, true, StoreCapacity::Sized(1))
        .await
        .expect("init");

    let first = control.new_id();
    let second = control.new_id();

    let admission = control
        .position_or_add(&prefix, first, None)
        .await
        .expect("first");
    assert_eq!(admission.placement, Placement::Store);

    let admission = control
        .position_or_add(&prefix, second, None)
        .await
        .expect("second");
    assert_eq!(admission.placement, Placement::Queued(1));

    // Free the slot and promote
    control.remove(&prefix, first, None).await.expect("remove");
    assert_eq!(backend.store_promote(&prefix).await.expect("promote"), 1);

    let admission = control
        .position_or_add(&prefix, second, None)
        .await
        .expect("touch");
    assert_eq!(admission.placement, Placement::Store);

    clean(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis at TEST_REDIS_URL"]
async fn sweep_expires_and_stamps() {
    let (_, control, prefix) = connect("vestibule_it_sweep").await;
    clean(&prefix).await;

    control
        .init(&prefix, true, StoreCapacity::Sized(0))
        .await
        .expect("init");

    let past = chrono::DateTime::from_timestamp(1000, 0);
    for _ in 0..3 {
        control
            .position_or_add(&prefix, control.new_id(), past)
            .await
            .expect("add");
    }

    let report = control.sweep(&prefix, None).await.expect("sweep");
    assert_eq!(report.queue_expired, 3);

    let status = control.status(&prefix).await.expect("status");
    assert_eq!(status.queue_size, 0);
    assert!(status.updated.is_some());

    clean(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis at TEST_REDIS_URL"]
async fn lease_gates_concurrent_housekeepers() {
    let (_, control, prefix) = connect("vestibule_it_lease").await;
    clean(&prefix).await;

    let ttl = Duration::from_secs(5);
    assert!(control
        .try_lease(&prefix, "worker-a", ttl)
        .await
        .expect("first lease"));
    assert!(!control
        .try_lease(&prefix, "worker-b", ttl)
        .await
        .expect("second lease"));
    assert!(control
        .try_lease(&prefix, "worker-a", ttl)
        .await
        .expect("renewal"));

    clean(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis at TEST_REDIS_URL"]
async fn events_cross_the_wire() {
    let (_, control, prefix) = connect("vestibule_it_events").await;
    clean(&prefix).await;

    control
        .init(&prefix, true, StoreCapacity::Sized(1))
        .await
        .expect("init");

    let mut events = control.subscribe(&prefix).await.expect("subscribe");

    control
        .position_or_add(&prefix, control.new_id(), None)
        .await
        .expect("add");

    let payload = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timely")
        .expect("event received");
    assert_eq!(payload, "store:added");

    clean(&prefix).await;
}
