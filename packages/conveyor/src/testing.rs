//! In-memory store and test clocks.
//!
//! [`MemoryStore`] implements every store trait against plain vectors behind
//! a mutex, with an injectable wall clock. It exists for tests and local
//! harnesses - it is not a broker, persists nothing, and trades throughput
//! for byte-for-byte observability of row state.
//!
//! Two clocks cover the two testing styles:
//! - [`ManualClock`] - advanced explicitly; for unit tests that call store
//!   operations directly.
//! - [`SimulatedClock`] - wall time derived from tokio's (pausable) clock;
//!   for scenario tests that run real pollers under `start_paused`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::error::StoreError;
use crate::row::{
    InboxKey, InboxRow, InboxStatus, JobDefinition, JobRow, JobRunRow, NewInboxMessage,
    NewOutboxMessage, NewTimer, Observation, OutboxRow, OwnerToken, TimerRow, WorkItem, WorkStatus,
};
use crate::store::{
    AbandonRequest, AcquireReply, FailRequest, InboxStore, JobStore, JoinOutcome, JoinProgress,
    JoinStore, LeaseGrant, LeaseStore, OutboxStore, RenewReply, TimerStore, WorkQueue,
};

// =============================================================================
// Clocks
// =============================================================================

/// Wall clock advanced explicitly by the test.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).expect("advance fits");
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Wall clock that follows tokio's clock, so `start_paused` tests advance
/// wall time and timers together.
pub struct SimulatedClock {
    base_wall: DateTime<Utc>,
    base_mono: tokio::time::Instant,
}

impl SimulatedClock {
    /// Anchor the simulated wall clock at `start` = tokio-now.
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            base_wall: start,
            base_mono: tokio::time::Instant::now(),
        })
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.base_mono.elapsed();
        self.base_wall + chrono::Duration::from_std(elapsed).expect("elapsed fits")
    }
}

// =============================================================================
// Shared queue mechanics
// =============================================================================

/// Saturating std→chrono conversion; callers pass bounded delays.
fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365_000))
}

/// The work-queue state machine, shared by all four row variants.
trait QueueRow: WorkItem {
    fn eligible(&self, now: DateTime<Utc>) -> bool;
    fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>, Uuid);
    fn begin(&mut self, owner: &OwnerToken, locked_until: DateTime<Utc>);
    fn owner(&self) -> Option<&str>;
    fn in_flight(&self) -> bool;
    fn lock_deadline(&self) -> Option<DateTime<Utc>>;
    fn complete(&mut self, now: DateTime<Utc>, by: &str);
    fn release(&mut self, now: DateTime<Utc>, error: Option<&str>, delay: Duration);
    fn reject(&mut self, error: &str);
    fn can_revive(&self) -> bool;
    fn revive_now(&mut self, now: DateTime<Utc>, delay: Option<Duration>);
    fn purgeable(&self, cutoff: DateTime<Utc>) -> bool;
}

fn claim_rows<R: QueueRow>(
    rows: &mut [R],
    now: DateTime<Utc>,
    owner: &OwnerToken,
    lease: Duration,
    batch: usize,
) -> Vec<R> {
    if batch == 0 {
        return Vec::new();
    }
    let mut due: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.eligible(now))
        .map(|(i, _)| i)
        .collect();
    due.sort_by_key(|&i| rows[i].sort_key());
    due.truncate(batch);

    let locked_until = now + to_chrono(lease);
    due.into_iter()
        .map(|i| {
            rows[i].begin(owner, locked_until);
            rows[i].clone()
        })
        .collect()
}

fn ack_rows<R: QueueRow>(
    rows: &mut [R],
    now: DateTime<Utc>,
    owner: &OwnerToken,
    ids: &[Uuid],
) -> u64 {
    let mut acked = 0;
    for row in rows.iter_mut() {
        if ids.contains(&row.id()) && row.in_flight() && row.owner() == Some(owner.as_str()) {
            row.complete(now, owner.as_str());
            acked += 1;
        }
    }
    acked
}

fn abandon_rows<R: QueueRow>(
    rows: &mut [R],
    now: DateTime<Utc>,
    owner: &OwnerToken,
    items: &[AbandonRequest],
) -> u64 {
    let mut released = 0;
    for item in items {
        for row in rows.iter_mut() {
            if row.id() == item.id && row.in_flight() && row.owner() == Some(owner.as_str()) {
                row.release(now, item.error.as_deref(), item.delay);
                released += 1;
            }
        }
    }
    released
}

fn fail_rows<R: QueueRow>(rows: &mut [R], owner: &OwnerToken, items: &[FailRequest]) -> u64 {
    let mut failed = 0;
    for item in items {
        for row in rows.iter_mut() {
            if row.id() == item.id && row.in_flight() && row.owner() == Some(owner.as_str()) {
                row.reject(&item.error);
                failed += 1;
            }
        }
    }
    failed
}

fn reap_rows<R: QueueRow>(rows: &mut [R], now: DateTime<Utc>) -> u64 {
    let mut reclaimed = 0;
    for row in rows.iter_mut() {
        if row.in_flight() && row.lock_deadline().is_some_and(|until| until < now) {
            row.release(now, None, Duration::ZERO);
            reclaimed += 1;
        }
    }
    reclaimed
}

fn revive_rows<R: QueueRow>(
    rows: &mut [R],
    now: DateTime<Utc>,
    ids: &[Uuid],
    delay: Option<Duration>,
) -> u64 {
    let mut revived = 0;
    for row in rows.iter_mut() {
        if ids.contains(&row.id()) && row.can_revive() {
            row.revive_now(now, delay);
            revived += 1;
        }
    }
    revived
}

fn purge_rows<R: QueueRow>(rows: &mut Vec<R>, cutoff: DateTime<Utc>) -> u64 {
    let before = rows.len();
    rows.retain(|row| !row.purgeable(cutoff));
    (before - rows.len()) as u64
}

// =============================================================================
// QueueRow impls
// =============================================================================

macro_rules! work_queue_row {
    ($row:ty) => {
        impl QueueRow for $row {
            fn eligible(&self, now: DateTime<Utc>) -> bool {
                self.status == WorkStatus::Ready
                    && self.next_attempt_at <= now
                    && self.due_window_open(now)
            }

            fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>, Uuid) {
                (self.next_attempt_at, self.created_at, self.id)
            }

            fn begin(&mut self, owner: &OwnerToken, locked_until: DateTime<Utc>) {
                self.status = WorkStatus::InProgress;
                self.owner_token = Some(owner.as_str().to_string());
                self.locked_until = Some(locked_until);
            }

            fn owner(&self) -> Option<&str> {
                self.owner_token.as_deref()
            }

            fn in_flight(&self) -> bool {
                self.status == WorkStatus::InProgress
            }

            fn lock_deadline(&self) -> Option<DateTime<Utc>> {
                self.locked_until
            }

            fn complete(&mut self, now: DateTime<Utc>, by: &str) {
                self.status = WorkStatus::Done;
                self.processed_at = Some(now);
                self.processed_by = Some(by.to_string());
            }

            fn release(&mut self, now: DateTime<Utc>, error: Option<&str>, delay: Duration) {
                self.status = WorkStatus::Ready;
                self.owner_token = None;
                self.locked_until = None;
                self.retry_count += 1;
                self.next_attempt_at = now + to_chrono(delay);
                if let Some(error) = error {
                    self.last_error = Some(error.to_string());
                }
            }

            fn reject(&mut self, error: &str) {
                self.status = WorkStatus::Failed;
                self.last_error = Some(error.to_string());
            }

            fn can_revive(&self) -> bool {
                self.status == WorkStatus::Failed
            }

            fn revive_now(&mut self, now: DateTime<Utc>, delay: Option<Duration>) {
                self.status = WorkStatus::Ready;
                self.owner_token = None;
                self.locked_until = None;
                self.next_attempt_at = now + to_chrono(delay.unwrap_or(Duration::ZERO));
            }

            fn purgeable(&self, cutoff: DateTime<Utc>) -> bool {
                self.status == WorkStatus::Done
                    && self.processed_at.is_some_and(|at| at < cutoff)
            }
        }
    };
}

impl OutboxRow {
    fn due_window_open(&self, now: DateTime<Utc>) -> bool {
        self.due_at.map_or(true, |due| due <= now)
    }
}

impl TimerRow {
    fn due_window_open(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

impl JobRunRow {
    fn due_window_open(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

work_queue_row!(OutboxRow);
work_queue_row!(TimerRow);
work_queue_row!(JobRunRow);

impl QueueRow for InboxRow {
    fn eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == InboxStatus::Seen
            && self.queued
            && self.next_attempt_at <= now
            && self.due_at.map_or(true, |due| due <= now)
    }

    fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>, Uuid) {
        (self.next_attempt_at, self.first_seen_at, self.id)
    }

    fn begin(&mut self, owner: &OwnerToken, locked_until: DateTime<Utc>) {
        self.status = InboxStatus::Processing;
        self.owner_token = Some(owner.as_str().to_string());
        self.locked_until = Some(locked_until);
    }

    fn owner(&self) -> Option<&str> {
        self.owner_token.as_deref()
    }

    fn in_flight(&self) -> bool {
        self.status == InboxStatus::Processing
    }

    fn lock_deadline(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }

    fn complete(&mut self, now: DateTime<Utc>, _by: &str) {
        self.status = InboxStatus::Done;
        self.processed_at = Some(now);
        self.owner_token = None;
        self.locked_until = None;
    }

    fn release(&mut self, now: DateTime<Utc>, error: Option<&str>, delay: Duration) {
        self.status = InboxStatus::Seen;
        self.owner_token = None;
        self.locked_until = None;
        self.attempt += 1;
        self.next_attempt_at = now + to_chrono(delay);
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }
    }

    fn reject(&mut self, error: &str) {
        self.status = InboxStatus::Dead;
        self.last_error = Some(error.to_string());
        self.owner_token = None;
        self.locked_until = None;
    }

    fn can_revive(&self) -> bool {
        self.status == InboxStatus::Dead
    }

    fn revive_now(&mut self, now: DateTime<Utc>, delay: Option<Duration>) {
        self.status = InboxStatus::Seen;
        self.owner_token = None;
        self.locked_until = None;
        self.next_attempt_at = now + to_chrono(delay.unwrap_or(Duration::ZERO));
    }

    fn purgeable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == InboxStatus::Done && self.processed_at.is_some_and(|at| at < cutoff)
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

struct LeaseEntry {
    owner: String,
    lease_until: DateTime<Utc>,
    fencing_token: i64,
}

#[derive(Default)]
struct JoinEntry {
    members: Vec<Uuid>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    outbox: Vec<OutboxRow>,
    inbox: Vec<InboxRow>,
    timers: Vec<TimerRow>,
    job_runs: Vec<JobRunRow>,
    jobs: HashMap<String, JobRow>,
    leases: HashMap<String, LeaseEntry>,
    joins: HashMap<Uuid, JoinEntry>,
}

impl State {
    fn insert_outbox(&mut self, now: DateTime<Utc>, message: NewOutboxMessage) -> Uuid {
        let id = Uuid::new_v4();
        self.outbox.push(OutboxRow {
            id,
            topic: message.topic,
            payload: message.payload,
            message_id: Some(message.message_id.unwrap_or_else(|| id.to_string())),
            correlation_id: message.correlation_id,
            created_at: now,
            due_at: message.due_at,
            status: WorkStatus::Ready,
            owner_token: None,
            locked_until: None,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            processed_at: None,
            processed_by: None,
        });
        id
    }
}

/// In-memory implementation of every store trait.
pub struct MemoryStore {
    clock: SharedClock,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- test inspection helpers ----

    /// Snapshot of all outbox rows.
    pub fn outbox_rows(&self) -> Vec<OutboxRow> {
        self.lock().outbox.clone()
    }

    /// Snapshot of all inbox rows.
    pub fn inbox_rows(&self) -> Vec<InboxRow> {
        self.lock().inbox.clone()
    }

    /// Snapshot of all timer rows.
    pub fn timer_rows(&self) -> Vec<TimerRow> {
        self.lock().timers.clone()
    }

    /// Snapshot of all job-run rows.
    pub fn job_run_rows(&self) -> Vec<JobRunRow> {
        self.lock().job_runs.clone()
    }

    /// Inject a raw outbox row (for crash-recovery scenarios).
    pub fn put_outbox_row(&self, row: OutboxRow) {
        self.lock().outbox.push(row);
    }

    /// Force an outbox row's status (for join scenarios that need members in
    /// a specific terminal state without running their handlers).
    pub fn set_outbox_status(&self, id: Uuid, status: WorkStatus) {
        if let Some(row) = self.lock().outbox.iter_mut().find(|r| r.id == id) {
            row.status = status;
        }
    }
}

// =============================================================================
// Work queues
// =============================================================================

macro_rules! memory_work_queue {
    ($row:ty, $field:ident) => {
        #[async_trait]
        impl WorkQueue<$row> for MemoryStore {
            async fn claim(
                &self,
                owner: &OwnerToken,
                lease: Duration,
                batch_size: usize,
            ) -> Result<Vec<$row>, StoreError> {
                let now = self.now();
                Ok(claim_rows(
                    &mut self.lock().$field,
                    now,
                    owner,
                    lease,
                    batch_size,
                ))
            }

            async fn ack(&self, owner: &OwnerToken, ids: &[Uuid]) -> Result<u64, StoreError> {
                let now = self.now();
                Ok(ack_rows(&mut self.lock().$field, now, owner, ids))
            }

            async fn abandon(
                &self,
                owner: &OwnerToken,
                items: &[AbandonRequest],
            ) -> Result<u64, StoreError> {
                let now = self.now();
                Ok(abandon_rows(&mut self.lock().$field, now, owner, items))
            }

            async fn fail(
                &self,
                owner: &OwnerToken,
                items: &[FailRequest],
            ) -> Result<u64, StoreError> {
                Ok(fail_rows(&mut self.lock().$field, owner, items))
            }

            async fn reap(&self) -> Result<u64, StoreError> {
                let now = self.now();
                Ok(reap_rows(&mut self.lock().$field, now))
            }

            async fn revive(
                &self,
                ids: &[Uuid],
                delay: Option<Duration>,
            ) -> Result<u64, StoreError> {
                let now = self.now();
                Ok(revive_rows(&mut self.lock().$field, now, ids, delay))
            }

            async fn get(&self, id: Uuid) -> Result<Option<$row>, StoreError> {
                Ok(self.lock().$field.iter().find(|r| r.id() == id).cloned())
            }

            async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
                Ok(purge_rows(&mut self.lock().$field, older_than))
            }
        }
    };
}

memory_work_queue!(OutboxRow, outbox);
memory_work_queue!(InboxRow, inbox);
memory_work_queue!(TimerRow, timers);
memory_work_queue!(JobRunRow, job_runs);

// =============================================================================
// OutboxStore
// =============================================================================

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<Uuid, StoreError> {
        let now = self.now();
        Ok(self.lock().insert_outbox(now, message))
    }
}

// =============================================================================
// InboxStore
// =============================================================================

impl State {
    fn find_inbox(&mut self, key: &InboxKey) -> Option<&mut InboxRow> {
        self.inbox.iter_mut().find(|r| {
            r.source == key.source && r.message_id == key.message_id && r.hash == key.hash
        })
    }
}

#[async_trait]
impl InboxStore for MemoryStore {
    async fn observe(&self, key: &InboxKey) -> Result<Observation, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        if let Some(row) = state.find_inbox(key) {
            row.last_seen_at = now;
            row.attempt += 1;
            return Ok(Observation {
                id: row.id,
                first_seen: false,
                status: row.status,
                attempt: row.attempt,
            });
        }
        let id = Uuid::new_v4();
        state.inbox.push(InboxRow {
            id,
            source: key.source.clone(),
            message_id: key.message_id.clone(),
            hash: key.hash.clone(),
            topic: String::new(),
            payload: serde_json::Value::Null,
            first_seen_at: now,
            last_seen_at: now,
            due_at: None,
            attempt: 1,
            status: InboxStatus::Seen,
            queued: false,
            owner_token: None,
            locked_until: None,
            next_attempt_at: now,
            last_error: None,
            processed_at: None,
        });
        Ok(Observation {
            id,
            first_seen: true,
            status: InboxStatus::Seen,
            attempt: 1,
        })
    }

    async fn enqueue(&self, message: NewInboxMessage) -> Result<Observation, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        if let Some(row) = state.find_inbox(&message.key) {
            row.last_seen_at = now;
            row.attempt += 1;
            if !row.queued {
                // Upgrade an edge-observed row into a dispatchable one.
                row.queued = true;
                row.topic = message.topic;
                row.payload = message.payload;
                row.due_at = message.due_at;
            }
            return Ok(Observation {
                id: row.id,
                first_seen: false,
                status: row.status,
                attempt: row.attempt,
            });
        }
        let id = Uuid::new_v4();
        state.inbox.push(InboxRow {
            id,
            source: message.key.source.clone(),
            message_id: message.key.message_id.clone(),
            hash: message.key.hash.clone(),
            topic: message.topic,
            payload: message.payload,
            first_seen_at: now,
            last_seen_at: now,
            due_at: message.due_at,
            attempt: 1,
            status: InboxStatus::Seen,
            queued: true,
            owner_token: None,
            locked_until: None,
            next_attempt_at: now,
            last_error: None,
            processed_at: None,
        });
        Ok(Observation {
            id,
            first_seen: true,
            status: InboxStatus::Seen,
            attempt: 1,
        })
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(row) = state.inbox.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if row.status != InboxStatus::Seen {
            return Ok(false);
        }
        row.status = InboxStatus::Processing;
        row.attempt += 1;
        Ok(true)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let Some(row) = state.inbox.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = InboxStatus::Done;
        row.processed_at = Some(now);
        row.owner_token = None;
        row.locked_until = None;
        Ok(true)
    }

    async fn mark_dead(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(row) = state.inbox.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = InboxStatus::Dead;
        row.owner_token = None;
        row.locked_until = None;
        Ok(true)
    }
}

// =============================================================================
// TimerStore
// =============================================================================

#[async_trait]
impl TimerStore for MemoryStore {
    async fn schedule(&self, timer: NewTimer) -> Result<Uuid, StoreError> {
        let now = self.now();
        let id = Uuid::new_v4();
        self.lock().timers.push(TimerRow {
            id,
            topic: timer.topic,
            payload: timer.payload,
            correlation_id: timer.correlation_id,
            due_at: timer.due_at,
            created_at: now,
            status: WorkStatus::Ready,
            owner_token: None,
            locked_until: None,
            retry_count: 0,
            // Ordering follows the due time, not insertion time.
            next_attempt_at: timer.due_at,
            last_error: None,
            processed_at: None,
            processed_by: None,
        });
        Ok(id)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let before = state.timers.len();
        state
            .timers
            .retain(|t| !(t.id == id && t.status == WorkStatus::Ready));
        Ok(state.timers.len() < before)
    }

    async fn complete_fire(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let Some(timer) = state.timers.iter_mut().find(|t| {
            t.id == id
                && t.status == WorkStatus::InProgress
                && t.owner_token.as_deref() == Some(owner.as_str())
        }) else {
            return Ok(false);
        };
        timer.status = WorkStatus::Done;
        timer.processed_at = Some(now);
        timer.processed_by = Some(owner.as_str().to_string());
        state.insert_outbox(now, message);
        Ok(true)
    }
}

// =============================================================================
// JobStore
// =============================================================================

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(&self, job: JobDefinition) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.lock();
        match state.jobs.get_mut(&job.name) {
            Some(existing) => {
                existing.topic = job.topic;
                existing.cron = job.cron;
                existing.payload = job.payload;
                existing.coalesce = job.coalesce;
                existing.updated_at = now;
            }
            None => {
                state.jobs.insert(
                    job.name.clone(),
                    JobRow {
                        name: job.name,
                        topic: job.topic,
                        cron: job.cron,
                        payload: job.payload,
                        enabled: true,
                        coalesce: job.coalesce,
                        last_scheduled_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().jobs.remove(name).is_some())
    }

    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        match state.jobs.get_mut(name) {
            Some(job) => {
                job.enabled = enabled;
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn jobs(&self) -> Result<Vec<JobRow>, StoreError> {
        let mut jobs: Vec<JobRow> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn record_runs(
        &self,
        name: &str,
        observed_last: Option<DateTime<Utc>>,
        fires: &[DateTime<Utc>],
    ) -> Result<u64, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let Some(job) = state.jobs.get(name).cloned() else {
            return Err(StoreError::Backend(anyhow::anyhow!("unknown job: {name}")));
        };
        if job.last_scheduled_at != observed_last {
            // Another ticker advanced the job first.
            return Ok(0);
        }
        let Some(newest) = fires.last().copied() else {
            return Ok(0);
        };

        let mut recorded = 0;
        for fire in fires {
            let duplicate = state
                .job_runs
                .iter()
                .any(|r| r.job_name == name && r.scheduled_for == *fire);
            if duplicate {
                continue;
            }
            state.job_runs.push(JobRunRow {
                id: Uuid::new_v4(),
                job_name: name.to_string(),
                topic: job.topic.clone(),
                payload: job.payload.clone().unwrap_or(serde_json::Value::Null),
                scheduled_for: *fire,
                created_at: now,
                status: WorkStatus::Ready,
                owner_token: None,
                locked_until: None,
                retry_count: 0,
                next_attempt_at: now,
                last_error: None,
                processed_at: None,
                processed_by: None,
            });
            recorded += 1;
        }
        if let Some(job) = state.jobs.get_mut(name) {
            job.last_scheduled_at = Some(newest);
            job.updated_at = now;
        }
        Ok(recorded)
    }

    async fn trigger(&self, name: &str, scheduled_for: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let Some(job) = state.jobs.get(name).cloned() else {
            return Err(StoreError::Backend(anyhow::anyhow!("unknown job: {name}")));
        };
        let id = Uuid::new_v4();
        state.job_runs.push(JobRunRow {
            id,
            job_name: name.to_string(),
            topic: job.topic,
            payload: job.payload.unwrap_or(serde_json::Value::Null),
            scheduled_for,
            created_at: now,
            status: WorkStatus::Ready,
            owner_token: None,
            locked_until: None,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            processed_at: None,
            processed_by: None,
        });
        Ok(id)
    }

    async fn complete_run(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let Some(run) = state.job_runs.iter_mut().find(|r| {
            r.id == id
                && r.status == WorkStatus::InProgress
                && r.owner_token.as_deref() == Some(owner.as_str())
        }) else {
            return Ok(false);
        };
        run.status = WorkStatus::Done;
        run.processed_at = Some(now);
        run.processed_by = Some(owner.as_str().to_string());
        state.insert_outbox(now, message);
        Ok(true)
    }
}

// =============================================================================
// LeaseStore
// =============================================================================

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let lease_until = now + to_chrono(ttl);
        match state.leases.get_mut(name) {
            Some(entry) if entry.lease_until >= now => Ok(AcquireReply::Held { server_now: now }),
            Some(entry) => {
                entry.owner = owner.to_string();
                entry.lease_until = lease_until;
                entry.fencing_token += 1;
                Ok(AcquireReply::Acquired(LeaseGrant {
                    lease_until,
                    fencing_token: entry.fencing_token,
                    server_now: now,
                }))
            }
            None => {
                state.leases.insert(
                    name.to_string(),
                    LeaseEntry {
                        owner: owner.to_string(),
                        lease_until,
                        fencing_token: 1,
                    },
                );
                Ok(AcquireReply::Acquired(LeaseGrant {
                    lease_until,
                    fencing_token: 1,
                    server_now: now,
                }))
            }
        }
    }

    async fn renew(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RenewReply, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        match state.leases.get_mut(name) {
            Some(entry) if entry.owner == owner && entry.lease_until >= now => {
                entry.lease_until = now + to_chrono(ttl);
                Ok(RenewReply::Renewed {
                    lease_until: entry.lease_until,
                    server_now: now,
                })
            }
            _ => Ok(RenewReply::Lost { server_now: now }),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        match state.leases.get_mut(name) {
            // Expire rather than delete, so fencing tokens stay monotonic
            // across release/re-acquire.
            Some(entry) if entry.owner == owner => {
                entry.lease_until = now - chrono::Duration::milliseconds(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// JoinStore
// =============================================================================

#[async_trait]
impl JoinStore for MemoryStore {
    async fn create_join(&self, join_id: Uuid) -> Result<(), StoreError> {
        self.lock().joins.entry(join_id).or_default();
        Ok(())
    }

    async fn enqueue_member(
        &self,
        join_id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<Uuid, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let id = state.insert_outbox(now, message);
        state.joins.entry(join_id).or_default().members.push(id);
        Ok(id)
    }

    async fn progress(&self, join_id: Uuid) -> Result<Option<JoinProgress>, StoreError> {
        let state = self.lock();
        let Some(join) = state.joins.get(&join_id) else {
            return Ok(None);
        };
        let mut progress = JoinProgress {
            total: join.members.len() as u64,
            done: 0,
            failed: 0,
        };
        for member in &join.members {
            match state.outbox.iter().find(|r| r.id == *member) {
                Some(row) if row.status == WorkStatus::Done => progress.done += 1,
                Some(row) if row.status == WorkStatus::Failed => progress.failed += 1,
                Some(_) => {}
                // A purged member was Done when retention removed it.
                None => progress.done += 1,
            }
        }
        Ok(Some(progress))
    }

    async fn settle(
        &self,
        join_id: Uuid,
        outcome: JoinOutcome,
        owner: &OwnerToken,
        wait_row: Uuid,
        message: Option<NewOutboxMessage>,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.lock();
        let settled = {
            let Some(join) = state.joins.get_mut(&join_id) else {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "unknown join: {join_id}"
                )));
            };
            let already_settled = join.completed_at.is_some() || join.failed_at.is_some();
            if !already_settled {
                match outcome {
                    JoinOutcome::Completed => join.completed_at = Some(now),
                    JoinOutcome::Failed => join.failed_at = Some(now),
                }
            }
            !already_settled
        };

        if settled {
            if let Some(message) = message {
                state.insert_outbox(now, message);
            }
        }

        ack_rows(&mut state.outbox, now, owner, &[wait_row]);
        Ok(settled)
    }
}
