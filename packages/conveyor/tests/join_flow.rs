//! Fan-in join scenarios: N members, one completion message.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use conveyor::testing::{ManualClock, MemoryStore};
use conveyor::{
    CancellationToken, Clock, ConfiguredStoreProvider, HandlerRegistry, JoinWaitHandler,
    JoinWaitRequest, Joins, NewOutboxMessage, OutboxRow, Poller, PollerConfig, RegistryProcessor,
    RoundRobin, StoreHandle, StoreProvider, WorkQueue, WorkStatus, JOIN_WAIT_TOPIC,
};
use uuid::Uuid;

struct JoinHarness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    joins: Joins<MemoryStore>,
    poller: Poller<MemoryStore, OutboxRow, RegistryProcessor<OutboxRow>>,
    handle: StoreHandle<MemoryStore>,
}

fn harness() -> JoinHarness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store = MemoryStore::new(clock.clone());
    let provider: Arc<dyn StoreProvider<MemoryStore>> =
        Arc::new(ConfiguredStoreProvider::single("tenant-1", store.clone()));

    let mut registry = HandlerRegistry::new();
    registry.register(JOIN_WAIT_TOPIC, JoinWaitHandler::new(provider.clone()));

    let poller = Poller::new(
        provider,
        Arc::new(RoundRobin::new()),
        Arc::new(RegistryProcessor::new(Arc::new(registry))),
        PollerConfig::default(),
    );
    JoinHarness {
        clock: clock.clone(),
        store: store.clone(),
        joins: Joins::new(store.clone()),
        poller,
        handle: StoreHandle::new("tenant-1", store),
    }
}

impl JoinHarness {
    /// Members are parked far in the future so only the wait row dispatches.
    async fn member(&self, join_id: Uuid) -> Uuid {
        let due = self.clock.now() + chrono::Duration::days(1);
        self.joins
            .enqueue_member(
                join_id,
                NewOutboxMessage::new("step.run", serde_json::json!({})).with_due_at(due),
            )
            .await
            .unwrap()
    }

    async fn dispatch(&self) -> usize {
        let count = self
            .poller
            .dispatch_once(&self.handle, &CancellationToken::new())
            .await
            .unwrap();
        // Step past the short join re-check delay (≤ 2s × 10 + jitter).
        self.clock.advance(std::time::Duration::from_secs(30));
        count
    }

    async fn wait_row(&self, id: Uuid) -> OutboxRow {
        WorkQueue::<OutboxRow>::get(&*self.store, id)
            .await
            .unwrap()
            .unwrap()
    }

    fn rows_with_topic(&self, topic: &str) -> Vec<OutboxRow> {
        self.store
            .outbox_rows()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }
}

#[tokio::test]
async fn join_completes_only_after_every_member_is_terminal() {
    let harness = harness();
    let join_id = Uuid::new_v4();
    harness.joins.create(join_id).await.unwrap();

    let members = [
        harness.member(join_id).await,
        harness.member(join_id).await,
        harness.member(join_id).await,
    ];
    let wait_id = harness
        .joins
        .enqueue_wait(
            JoinWaitRequest::new(join_id)
                .on_complete("batch.done", serde_json::json!({"batch": 7})),
        )
        .await
        .unwrap();

    // No member terminal: the wait abandons with JoinNotReady.
    harness.dispatch().await;
    let row = harness.wait_row(wait_id).await;
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("join not ready"));

    // Two of three done: still not ready.
    harness.store.set_outbox_status(members[0], WorkStatus::Done);
    harness.store.set_outbox_status(members[1], WorkStatus::Done);
    harness.dispatch().await;
    let row = harness.wait_row(wait_id).await;
    assert_eq!(row.status, WorkStatus::Ready);
    assert_eq!(row.retry_count, 2);

    // Third member done: the join settles and emits exactly one completion.
    harness.store.set_outbox_status(members[2], WorkStatus::Done);
    harness.dispatch().await;
    let row = harness.wait_row(wait_id).await;
    assert_eq!(row.status, WorkStatus::Done);

    let completions = harness.rows_with_topic("batch.done");
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].payload, serde_json::json!({"batch": 7}));
}

#[tokio::test]
async fn fail_fast_join_emits_the_failure_message() {
    let harness = harness();
    let join_id = Uuid::new_v4();
    harness.joins.create(join_id).await.unwrap();

    let members = [harness.member(join_id).await, harness.member(join_id).await];
    let wait_id = harness
        .joins
        .enqueue_wait(
            JoinWaitRequest::new(join_id)
                .fail_fast()
                .on_complete("batch.done", serde_json::json!({}))
                .on_fail("batch.failed", serde_json::json!({"reason": "step"})),
        )
        .await
        .unwrap();

    harness.store.set_outbox_status(members[0], WorkStatus::Done);
    harness.store.set_outbox_status(members[1], WorkStatus::Failed);
    harness.dispatch().await;

    assert_eq!(harness.wait_row(wait_id).await.status, WorkStatus::Done);
    assert!(harness.rows_with_topic("batch.done").is_empty());
    let failures = harness.rows_with_topic("batch.failed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload, serde_json::json!({"reason": "step"}));
}

#[tokio::test]
async fn lenient_join_completes_despite_failed_members() {
    let harness = harness();
    let join_id = Uuid::new_v4();
    harness.joins.create(join_id).await.unwrap();

    let members = [harness.member(join_id).await, harness.member(join_id).await];
    let wait_id = harness
        .joins
        .enqueue_wait(
            JoinWaitRequest::new(join_id).on_complete("batch.done", serde_json::json!({})),
        )
        .await
        .unwrap();

    harness.store.set_outbox_status(members[0], WorkStatus::Done);
    harness.store.set_outbox_status(members[1], WorkStatus::Failed);
    harness.dispatch().await;

    assert_eq!(harness.wait_row(wait_id).await.status, WorkStatus::Done);
    assert_eq!(harness.rows_with_topic("batch.done").len(), 1);
}

#[tokio::test]
async fn settlement_is_idempotent_across_replays() {
    let harness = harness();
    let join_id = Uuid::new_v4();
    harness.joins.create(join_id).await.unwrap();

    let member = harness.member(join_id).await;
    harness.store.set_outbox_status(member, WorkStatus::Done);

    let first_wait = harness
        .joins
        .enqueue_wait(
            JoinWaitRequest::new(join_id).on_complete("batch.done", serde_json::json!({})),
        )
        .await
        .unwrap();
    harness.dispatch().await;
    assert_eq!(harness.rows_with_topic("batch.done").len(), 1);

    // A second wait message for the same join (a replayed workflow) acks
    // without emitting a duplicate completion.
    let second_wait = harness
        .joins
        .enqueue_wait(
            JoinWaitRequest::new(join_id).on_complete("batch.done", serde_json::json!({})),
        )
        .await
        .unwrap();
    harness.dispatch().await;

    assert_eq!(harness.wait_row(first_wait).await.status, WorkStatus::Done);
    assert_eq!(harness.wait_row(second_wait).await.status, WorkStatus::Done);
    assert_eq!(harness.rows_with_topic("batch.done").len(), 1);
}

#[tokio::test]
async fn malformed_wait_payload_is_poisoned() {
    let harness = harness();

    // Hand-enqueued garbage on the join topic.
    let outbox = conveyor::Outbox::new(harness.store.clone());
    let id = outbox
        .enqueue(NewOutboxMessage::new(
            JOIN_WAIT_TOPIC,
            serde_json::json!({"not": "a join request"}),
        ))
        .await
        .unwrap();

    harness.dispatch().await;
    let row = harness.wait_row(id).await;
    assert_eq!(row.status, WorkStatus::Failed);
    assert!(row.last_error.as_deref().unwrap().contains("join.wait"));
}
