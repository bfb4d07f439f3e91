//! Scheduler scenarios: timer hand-off, cron catch-up, coalescing, triggers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use conveyor::testing::{ManualClock, MemoryStore};
use conveyor::{
    CancellationToken, Clock, ConfiguredStoreProvider, ConveyorError, JobDefinition,
    JobRunProcessor, JobRunRow, Poller, PollerConfig, RoundRobin, Scheduler, StoreHandle,
    StoreProvider, TimerProcessor, TimerRow, WorkQueue, WorkStatus,
};

fn harness() -> (Arc<ManualClock>, Arc<MemoryStore>, Scheduler<MemoryStore>) {
    // Aligned to a 10s cron boundary on purpose.
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let store = MemoryStore::new(clock.clone());
    let scheduler = Scheduler::new(store.clone(), clock.clone());
    (clock, store, scheduler)
}

fn timer_poller(
    store: &Arc<MemoryStore>,
) -> Poller<MemoryStore, TimerRow, TimerProcessor> {
    let provider: Arc<dyn StoreProvider<MemoryStore>> =
        Arc::new(ConfiguredStoreProvider::single("tenant-1", store.clone()));
    Poller::new(
        provider,
        Arc::new(RoundRobin::new()),
        Arc::new(TimerProcessor),
        PollerConfig::default(),
    )
}

fn run_poller(
    store: &Arc<MemoryStore>,
) -> Poller<MemoryStore, JobRunRow, JobRunProcessor> {
    let provider: Arc<dyn StoreProvider<MemoryStore>> =
        Arc::new(ConfiguredStoreProvider::single("tenant-1", store.clone()));
    Poller::new(
        provider,
        Arc::new(RoundRobin::new()),
        Arc::new(JobRunProcessor),
        PollerConfig::default(),
    )
}

#[tokio::test]
async fn timer_fires_exactly_once_into_the_outbox() {
    let (clock, store, scheduler) = harness();
    let due = clock.now() + chrono::Duration::seconds(10);
    let id = scheduler
        .schedule_timer("billing.close", serde_json::json!({"day": 1}), due)
        .await
        .unwrap();

    let poller = timer_poller(&store);
    let handle = StoreHandle::new("tenant-1", store.clone());
    let cancel = CancellationToken::new();

    // Not due yet.
    assert_eq!(poller.dispatch_once(&handle, &cancel).await.unwrap(), 0);
    assert!(store.outbox_rows().is_empty());

    clock.advance(Duration::from_secs(11));
    assert_eq!(poller.dispatch_once(&handle, &cancel).await.unwrap(), 1);

    let timer = WorkQueue::<TimerRow>::get(&*store, id).await.unwrap().unwrap();
    assert_eq!(timer.status, WorkStatus::Done);

    let emitted = store.outbox_rows();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].topic, "billing.close");
    assert_eq!(emitted[0].payload, serde_json::json!({"day": 1}));

    // Done timers are never re-dispatched.
    clock.advance(Duration::from_secs(60));
    assert_eq!(poller.dispatch_once(&handle, &cancel).await.unwrap(), 0);
    assert_eq!(store.outbox_rows().len(), 1);
}

#[tokio::test]
async fn cancelled_timer_never_fires() {
    let (clock, store, scheduler) = harness();
    let due = clock.now() + chrono::Duration::seconds(5);
    let id = scheduler
        .schedule_timer("t", serde_json::json!({}), due)
        .await
        .unwrap();

    assert!(scheduler.cancel_timer(id).await.unwrap());
    assert!(!scheduler.cancel_timer(id).await.unwrap());

    clock.advance(Duration::from_secs(10));
    let poller = timer_poller(&store);
    let handle = StoreHandle::new("tenant-1", store.clone());
    assert_eq!(
        poller
            .dispatch_once(&handle, &CancellationToken::new())
            .await
            .unwrap(),
        0
    );
    assert!(store.outbox_rows().is_empty());
}

#[tokio::test]
async fn cron_catch_up_records_every_missed_fire() {
    let (clock, _store, scheduler) = harness();

    // Job created 30s before the tick; three 10s fires have passed since.
    scheduler
        .create_or_update_job(JobDefinition::new("sync", "sync.run", "*/10 * * * * *"))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(30));

    let recorded = scheduler.tick().await.unwrap();
    assert_eq!(recorded, 3);

    let store = scheduler.store();
    let mut runs = store.job_run_rows();
    runs.sort_by_key(|r| r.scheduled_for);
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let scheduled: Vec<_> = runs.iter().map(|r| r.scheduled_for).collect();
    assert_eq!(
        scheduled,
        vec![
            base + chrono::Duration::seconds(10),
            base + chrono::Duration::seconds(20),
            base + chrono::Duration::seconds(30),
        ]
    );

    // The cursor advanced to the newest fire; an immediate re-tick is a no-op.
    assert_eq!(scheduler.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn coalescing_job_collapses_missed_fires_to_latest() {
    let (clock, store, scheduler) = harness();
    scheduler
        .create_or_update_job(
            JobDefinition::new("sync", "sync.run", "*/10 * * * * *").with_coalesce(true),
        )
        .await
        .unwrap();
    clock.advance(Duration::from_secs(45));

    let recorded = scheduler.tick().await.unwrap();
    assert_eq!(recorded, 1);

    let runs = store.job_run_rows();
    assert_eq!(
        runs[0].scheduled_for,
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 40).unwrap()
    );
}

#[tokio::test]
async fn disabled_job_does_not_tick() {
    let (clock, store, scheduler) = harness();
    scheduler
        .create_or_update_job(JobDefinition::new("sync", "sync.run", "*/10 * * * * *"))
        .await
        .unwrap();
    assert!(scheduler.set_job_enabled("sync", false).await.unwrap());

    clock.advance(Duration::from_secs(60));
    assert_eq!(scheduler.tick().await.unwrap(), 0);
    assert!(store.job_run_rows().is_empty());

    // Re-enabling resumes from where the schedule left off.
    assert!(scheduler.set_job_enabled("sync", true).await.unwrap());
    assert_eq!(scheduler.tick().await.unwrap(), 6);
}

#[tokio::test]
async fn job_run_hands_off_into_outbox() {
    let (clock, store, scheduler) = harness();
    scheduler
        .create_or_update_job(
            JobDefinition::new("report", "report.daily", "*/10 * * * * *")
                .with_payload(serde_json::json!({"scope": "all"})),
        )
        .await
        .unwrap();
    clock.advance(Duration::from_secs(10));
    assert_eq!(scheduler.tick().await.unwrap(), 1);

    let poller = run_poller(&store);
    let handle = StoreHandle::new("tenant-1", store.clone());
    assert_eq!(
        poller
            .dispatch_once(&handle, &CancellationToken::new())
            .await
            .unwrap(),
        1
    );

    let emitted = store.outbox_rows();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].topic, "report.daily");
    assert_eq!(emitted[0].payload, serde_json::json!({"scope": "all"}));

    let runs = store.job_run_rows();
    assert_eq!(runs[0].status, WorkStatus::Done);
}

#[tokio::test]
async fn trigger_job_fires_out_of_schedule() {
    let (_clock, store, scheduler) = harness();
    scheduler
        .create_or_update_job(JobDefinition::new("report", "report.daily", "0 0 3 * * *"))
        .await
        .unwrap();

    scheduler.trigger_job("report").await.unwrap();
    let runs = store.job_run_rows();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].job_name, "report");
}

#[tokio::test]
async fn invalid_cron_is_rejected_before_any_write() {
    let (_clock, store, scheduler) = harness();
    let result = scheduler
        .create_or_update_job(JobDefinition::new("bad", "t", "every ten seconds"))
        .await;
    assert!(matches!(result, Err(ConveyorError::Cron { .. })));
    assert!(store.job_run_rows().is_empty());

    let jobs = conveyor::JobStore::jobs(&*store).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn delete_job_stops_future_fires() {
    let (clock, store, scheduler) = harness();
    scheduler
        .create_or_update_job(JobDefinition::new("sync", "sync.run", "*/10 * * * * *"))
        .await
        .unwrap();
    assert!(scheduler.delete_job("sync").await.unwrap());
    assert!(!scheduler.delete_job("sync").await.unwrap());

    clock.advance(Duration::from_secs(60));
    assert_eq!(scheduler.tick().await.unwrap(), 0);
    assert!(store.job_run_rows().is_empty());
}
