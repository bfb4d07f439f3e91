//! Lease-gated singleton execution.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use conveyor::testing::{MemoryStore, SimulatedClock};
use conveyor::{
    run_exclusive, AcquireReply, CancellationToken, LeaseRunner, LeaseRunnerConfig, LeaseStore,
};

fn store() -> Arc<MemoryStore> {
    let clock = SimulatedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    MemoryStore::new(clock)
}

#[tokio::test(start_paused = true)]
async fn exclusive_body_runs_under_the_lease_and_releases_after() {
    let store = store();
    let runs = Arc::new(AtomicU32::new(0));
    let shutdown = CancellationToken::new();

    {
        let runs = runs.clone();
        let shutdown_inner = shutdown.clone();
        run_exclusive(
            store.clone(),
            "singleton:ticker",
            "worker-1",
            Duration::from_secs(30),
            LeaseRunnerConfig::default(),
            Duration::from_secs(5),
            shutdown.clone(),
            move |cancel| {
                let runs = runs.clone();
                let shutdown_inner = shutdown_inner.clone();
                async move {
                    assert!(!cancel.is_cancelled());
                    runs.fetch_add(1, Ordering::SeqCst);
                    // Stop the loop after the first protected run.
                    shutdown_inner.cancel();
                    Ok::<(), anyhow::Error>(())
                }
            },
        )
        .await
        .unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The lease was released: a new owner acquires immediately, with a
    // higher fencing token.
    let reply = store
        .acquire("singleton:ticker", "worker-2", Duration::from_secs(30))
        .await
        .unwrap();
    let AcquireReply::Acquired(grant) = reply else {
        panic!("released lease should be free");
    };
    assert!(grant.fencing_token > 1);
}

#[tokio::test(start_paused = true)]
async fn second_runner_is_refused_while_the_lease_is_held() {
    let store = store();

    let first = LeaseRunner::acquire(
        store.clone(),
        "singleton:ticker",
        "worker-1",
        Duration::from_secs(30),
        LeaseRunnerConfig::default(),
    )
    .await
    .unwrap()
    .expect("first worker acquires");

    let second = LeaseRunner::acquire(
        store.clone(),
        "singleton:ticker",
        "worker-2",
        Duration::from_secs(30),
        LeaseRunnerConfig::default(),
    )
    .await
    .unwrap();
    assert!(second.is_none());

    let first_token = first.fencing_token();
    first.release().await;

    let third = LeaseRunner::acquire(
        store.clone(),
        "singleton:ticker",
        "worker-2",
        Duration::from_secs(30),
        LeaseRunnerConfig::default(),
    )
    .await
    .unwrap()
    .expect("released lease is acquirable");
    assert!(third.fencing_token() > first_token);
    third.release().await;
}
