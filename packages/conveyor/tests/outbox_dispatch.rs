//! End-to-end outbox dispatch scenarios against the in-memory store.
//!
//! All tests run under paused tokio time with a [`SimulatedClock`], so wall
//! clock and timers advance together and the scenarios are deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use conveyor::testing::{MemoryStore, SimulatedClock};
use conveyor::{
    async_trait, CancellationToken, Clock, ConfiguredStoreProvider, DispatchContext, Handler,
    HandlerError, HandlerRegistry, NewOutboxMessage, Outbox, OutboxRow, OutboxStore, Poller,
    PollerConfig, RegistryProcessor, RoundRobin, StoreHandle, StoreProvider, UnknownTopicPolicy,
    WorkQueue, WorkStatus,
};
use uuid::Uuid;

// =============================================================================
// Harness
// =============================================================================

fn start() -> (Arc<SimulatedClock>, Arc<MemoryStore>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let clock = SimulatedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store = MemoryStore::new(clock.clone());
    (clock, store)
}

fn provider(store: &Arc<MemoryStore>) -> Arc<dyn StoreProvider<MemoryStore>> {
    Arc::new(ConfiguredStoreProvider::single("tenant-1", store.clone()))
}

fn poller(
    provider: Arc<dyn StoreProvider<MemoryStore>>,
    registry: HandlerRegistry<OutboxRow>,
    config: PollerConfig,
) -> Poller<MemoryStore, OutboxRow, RegistryProcessor<OutboxRow>> {
    Poller::new(
        provider,
        Arc::new(RoundRobin::new()),
        Arc::new(RegistryProcessor::new(Arc::new(registry))),
        config,
    )
}

async fn wait_until_done(store: &Arc<MemoryStore>, id: Uuid) -> OutboxRow {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if let Some(row) = WorkQueue::<OutboxRow>::get(&**store, id).await.unwrap() {
                if row.status == WorkStatus::Done {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("row should reach Done")
}

struct CountingHandler {
    calls: AtomicU32,
}

impl CountingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Handler<OutboxRow> for CountingHandler {
    async fn handle(
        &self,
        _row: &OutboxRow,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Handler<OutboxRow> for FlakyHandler {
    async fn handle(
        &self,
        _row: &OutboxRow,
        _ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::transient(anyhow::anyhow!("downstream 503")))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn outbox_happy_path_completes_within_one_interval() {
    let (_clock, store) = start();
    let handler = CountingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_shared("t", handler.clone());

    let outbox = Outbox::new(store.clone());
    let id = outbox
        .enqueue(NewOutboxMessage::new("t", serde_json::json!("p")))
        .await
        .unwrap();
    // Let wall time move past the enqueue before the first claim.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let poller = Arc::new(poller(provider(&store), registry, PollerConfig::default()));
    let shutdown = CancellationToken::new();
    let task = {
        let poller = poller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    let row = wait_until_done(&store, id).await;
    assert_eq!(row.retry_count, 0);
    assert!(row.processed_at.unwrap() > row.created_at);
    assert!(row.processed_by.is_some());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outbox_transient_failure_retries_with_backoff() {
    let (clock, store) = start();
    let mut registry = HandlerRegistry::new();
    registry.register(
        "t",
        FlakyHandler {
            failures: 1,
            calls: AtomicU32::new(0),
        },
    );

    let poller = poller(provider(&store), registry, PollerConfig::default());
    let outbox = Outbox::new(store.clone());
    let id = outbox
        .enqueue(NewOutboxMessage::new("t", serde_json::json!("p")))
        .await
        .unwrap();

    let handle = StoreHandle::new("tenant-1", store.clone());
    let cancel = CancellationToken::new();

    // First attempt fails and is abandoned with ~1s backoff.
    let count = poller.dispatch_once(&handle, &cancel).await.unwrap();
    assert_eq!(count, 1);

    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.as_deref().unwrap().contains("downstream 503"));
    let delay = row.next_attempt_at - clock.now();
    assert!(delay > chrono::Duration::milliseconds(800));
    assert!(delay < chrono::Duration::milliseconds(1200));

    // Not due yet: nothing claimed.
    let count = poller.dispatch_once(&handle, &cancel).await.unwrap();
    assert_eq!(count, 0);

    // Past the retry delay the second attempt succeeds.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let count = poller.dispatch_once(&handle, &cancel).await.unwrap();
    assert_eq!(count, 1);

    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Done);
    assert_eq!(row.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn crashed_worker_rows_return_via_reap() {
    let (clock, store) = start();

    // A worker claimed this row and died; its lease expired 10s ago.
    let id = Uuid::new_v4();
    store.put_outbox_row(OutboxRow {
        id,
        topic: "t".into(),
        payload: serde_json::json!("p"),
        message_id: Some(id.to_string()),
        correlation_id: None,
        created_at: clock.now() - chrono::Duration::seconds(60),
        due_at: None,
        status: WorkStatus::InProgress,
        owner_token: Some("worker-x".into()),
        locked_until: Some(clock.now() - chrono::Duration::seconds(10)),
        retry_count: 0,
        next_attempt_at: clock.now() - chrono::Duration::seconds(60),
        last_error: None,
        processed_at: None,
        processed_by: None,
    });

    let reclaimed = WorkQueue::<OutboxRow>::reap(&*store).await.unwrap();
    assert_eq!(reclaimed, 1);

    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert!(row.owner_token.is_none());
    assert!(row.locked_until.is_none());
    assert_eq!(row.payload, serde_json::json!("p"));
    // Reap counts as an abandon without an error.
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_topic_policy_governs_unroutable_rows() {
    let (_clock, store) = start();
    let handle = StoreHandle::new("tenant-1", store.clone());
    let cancel = CancellationToken::new();
    let outbox = Outbox::new(store.clone());

    // Default policy: retry later.
    let retry_poller = poller(
        provider(&store),
        HandlerRegistry::new(),
        PollerConfig::default(),
    );
    let id = outbox
        .enqueue(NewOutboxMessage::new("unrouted", serde_json::json!({})))
        .await
        .unwrap();
    retry_poller.dispatch_once(&handle, &cancel).await.unwrap();
    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert!(row.last_error.as_deref().unwrap().contains("no handler registered"));

    // Poison policy: terminal failure.
    let poison_poller = poller(
        provider(&store),
        HandlerRegistry::new().with_unknown_topic_policy(UnknownTopicPolicy::Poison),
        PollerConfig::default(),
    );
    let id = outbox
        .enqueue(NewOutboxMessage::new("unrouted-2", serde_json::json!({})))
        .await
        .unwrap();
    poison_poller.dispatch_once(&handle, &cancel).await.unwrap();
    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Failed);

    // Complete policy: acked as if handled.
    let complete_poller = poller(
        provider(&store),
        HandlerRegistry::new().with_unknown_topic_policy(UnknownTopicPolicy::Complete),
        PollerConfig::default(),
    );
    let id = outbox
        .enqueue(NewOutboxMessage::new("unrouted-3", serde_json::json!({})))
        .await
        .unwrap();
    complete_poller.dispatch_once(&handle, &cancel).await.unwrap();
    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Done);
}

struct StuckHandler;

#[async_trait]
impl Handler<OutboxRow> for StuckHandler {
    async fn handle(
        &self,
        _row: &OutboxRow,
        _ctx: &DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        // Ignores its deadline; only the dispatcher timeout reins it in.
        cancel.cancelled().await;
        Err(HandlerError::transient(anyhow::anyhow!("cancelled")))
    }
}

#[tokio::test(start_paused = true)]
async fn handler_exceeding_its_timeout_is_abandoned() {
    let (_clock, store) = start();
    let mut registry = HandlerRegistry::new();
    registry.register("t", StuckHandler);

    // 10s lease: the handler is cut off at 8s.
    let config = PollerConfig {
        lease: Duration::from_secs(10),
        ..Default::default()
    };
    let poller = poller(provider(&store), registry, config);
    let outbox = Outbox::new(store.clone());
    let id = outbox
        .enqueue(NewOutboxMessage::new("t", serde_json::json!("p")))
        .await
        .unwrap();

    let handle = StoreHandle::new("tenant-1", store.clone());
    let count = poller
        .dispatch_once(&handle, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(count, 1);

    let row = WorkQueue::<OutboxRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn round_robin_poller_serves_every_store() {
    let clock = SimulatedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store_a = MemoryStore::new(clock.clone());
    let store_b = MemoryStore::new(clock.clone());

    let handler = CountingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_shared("t", handler.clone());

    let provider: Arc<dyn StoreProvider<MemoryStore>> = Arc::new(ConfiguredStoreProvider::new(vec![
        StoreHandle::new("tenant-a", store_a.clone()),
        StoreHandle::new("tenant-b", store_b.clone()),
    ]));
    let poller = Arc::new(poller(provider, registry, PollerConfig::default()));

    let id_a = OutboxStore::enqueue(&*store_a, NewOutboxMessage::new("t", serde_json::json!(1)))
        .await
        .unwrap();
    let id_b = OutboxStore::enqueue(&*store_b, NewOutboxMessage::new("t", serde_json::json!(2)))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let task = {
        let poller = poller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    wait_until_done(&store_a, id_a).await;
    wait_until_done(&store_b, id_b).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_stores_idles_without_error() {
    let provider: Arc<dyn StoreProvider<MemoryStore>> =
        Arc::new(ConfiguredStoreProvider::new(Vec::new()));
    let poller = Arc::new(poller(
        provider,
        HandlerRegistry::new(),
        PollerConfig::default(),
    ));

    let shutdown = CancellationToken::new();
    let task = {
        let poller = poller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    // A few empty ticks pass, then shutdown stops the loop promptly.
    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    task.await.unwrap();
}
