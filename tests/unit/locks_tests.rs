use std::sync::Arc;
use std::time::Duration;

use botfoundry::locks::InstanceLocks;

#[tokio::test]
async fn acquire_serializes_access_per_instance() {
    let locks = Arc::new(InstanceLocks::default());
    let guard = locks.acquire("bot-1").await;

    let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("bot-1")).await;
    assert!(blocked.is_err(), "second acquire must wait for the guard");

    drop(guard);
    let _reacquired = locks.acquire("bot-1").await;
}

#[tokio::test]
async fn distinct_instances_do_not_contend() {
    let locks = InstanceLocks::default();
    let _a = locks.acquire("bot-a").await;

    let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("bot-b")).await;
    assert!(b.is_ok(), "locks are per instance, not global");
}

#[tokio::test]
async fn forget_defers_to_an_outstanding_guard() {
    let locks = Arc::new(InstanceLocks::default());
    let guard = locks.acquire("bot-1").await;

    // Forgetting while the guard is live must not mint a second mutex
    // for the same instance.
    locks.forget("bot-1").await;
    let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("bot-1")).await;
    assert!(blocked.is_err(), "old guard still excludes new acquires");

    drop(guard);
    locks.forget("bot-1").await;
    let _fresh = locks.acquire("bot-1").await;
}
