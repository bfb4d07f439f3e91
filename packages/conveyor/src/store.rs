//! Store contracts for the four primitives.
//!
//! Everything here is an interface; providers (PostgreSQL, the in-memory
//! testing store) supply the implementations. The substrate is portable to
//! any ACID store that can express row-level locking with skip-locked
//! semantics and conditional updates.
//!
//! # The claim protocol
//!
//! [`WorkQueue`] is the shared work-queue contract. Its atomicity rules are
//! what make at-least-once delivery and crash recovery correct:
//!
//! - `claim` must atomically select-and-mark so concurrent claimers observe
//!   disjoint row sets, skipping rows locked by others without blocking.
//! - `ack`/`abandon`/`fail` only touch rows whose `owner_token` matches;
//!   a mismatch is silently skipped (a reap between claim and ack looks
//!   exactly like a crashed worker).
//! - `reap` is the one mutation allowed without a token, and only on rows
//!   whose lease has already elapsed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::row::{
    InboxKey, InboxRow, JobDefinition, JobRow, JobRunRow, NewInboxMessage, NewOutboxMessage,
    NewTimer, Observation, OutboxRow, OwnerToken, TimerRow, WorkItem,
};

// =============================================================================
// Batch verdict shapes
// =============================================================================

/// One row to abandon, with its computed retry delay.
#[derive(Debug, Clone)]
pub struct AbandonRequest {
    pub id: Uuid,
    pub error: Option<String>,
    pub delay: Duration,
}

/// One row to terminally fail.
#[derive(Debug, Clone)]
pub struct FailRequest {
    pub id: Uuid,
    pub error: String,
}

// =============================================================================
// WorkQueue
// =============================================================================

/// The work-queue protocol shared by outbox, inbox, timer, and job-run rows.
#[async_trait]
pub trait WorkQueue<R: WorkItem>: Send + Sync {
    /// Atomically claim up to `batch_size` due rows for `owner`.
    ///
    /// Eligible rows are Ready, past `next_attempt_at`, and past `due_at`
    /// when one is set. Ordering is `next_attempt_at ASC, created ASC,
    /// id ASC` so a given set of due rows claims deterministically. Rows
    /// locked by another claimer are skipped, never waited on.
    async fn claim(
        &self,
        owner: &OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<R>, StoreError>;

    /// Mark rows Done. Rows whose owner no longer matches are skipped.
    /// Returns the number of rows transitioned.
    async fn ack(&self, owner: &OwnerToken, ids: &[Uuid]) -> Result<u64, StoreError>;

    /// Return rows to Ready for retry, bumping the attempt counter and
    /// recording the error and next-attempt delay per row.
    async fn abandon(
        &self,
        owner: &OwnerToken,
        items: &[AbandonRequest],
    ) -> Result<u64, StoreError>;

    /// Terminally fail rows (Failed for work rows, Dead for the inbox).
    async fn fail(&self, owner: &OwnerToken, items: &[FailRequest]) -> Result<u64, StoreError>;

    /// Return every row whose lease elapsed to Ready, clearing its owner and
    /// bumping the attempt counter (an abandon without an error). Returns
    /// the number of rows reclaimed.
    async fn reap(&self) -> Result<u64, StoreError>;

    /// Manual recovery: move terminally failed rows back to Ready,
    /// optionally delayed.
    async fn revive(&self, ids: &[Uuid], delay: Option<Duration>) -> Result<u64, StoreError>;

    /// Fetch one row's full projection.
    async fn get(&self, id: Uuid) -> Result<Option<R>, StoreError>;

    /// Delete Done rows processed before `older_than`. Terminal failures are
    /// kept for inspection and `revive`.
    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

// =============================================================================
// Per-primitive stores
// =============================================================================

/// Outbox persistence: the work queue plus enqueue.
///
/// Transaction-enlisted enqueue (commit atomically with business data) is a
/// provider-specific surface; see the PostgreSQL provider's
/// `enqueue_outbox_in`.
#[async_trait]
pub trait OutboxStore: WorkQueue<OutboxRow> {
    /// Insert a Ready row. The store stamps `created_at` and defaults the
    /// message id to the row id when absent.
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<Uuid, StoreError>;
}

/// Inbox persistence: dedupe upsert, state mutations, and the queued
/// pipeline's work queue.
#[async_trait]
pub trait InboxStore: WorkQueue<InboxRow> {
    /// Atomic dedupe upsert. The first concurrent observer of a key inserts
    /// a Seen row and gets `first_seen = true`; every later observation
    /// bumps `last_seen_at` and `attempt` only.
    async fn observe(&self, key: &InboxKey) -> Result<Observation, StoreError>;

    /// Insert (or upgrade an observed row to) a queued Seen row eligible for
    /// the inbox dispatcher. Dedupe applies: re-enqueueing an existing key
    /// bumps observation counters but does not reset processing state.
    async fn enqueue(&self, message: NewInboxMessage) -> Result<Observation, StoreError>;

    /// `Seen → Processing`, bumping `attempt`. False if the row was not Seen.
    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError>;

    /// `{Seen, Processing} → Done`, stamping `processed_at`.
    async fn mark_processed(&self, id: Uuid) -> Result<bool, StoreError>;

    /// `{Seen, Processing} → Dead`.
    async fn mark_dead(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Timer persistence: the work queue plus scheduling and atomic hand-off.
#[async_trait]
pub trait TimerStore: WorkQueue<TimerRow> {
    /// Insert a Ready timer row due at `timer.due_at`.
    async fn schedule(&self, timer: NewTimer) -> Result<Uuid, StoreError>;

    /// Delete a still-pending timer. False if it already fired or is gone.
    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Atomically ack the claimed timer and insert `message` into the outbox
    /// in one transaction, guaranteeing exactly one enqueue per fire.
    ///
    /// Returns false when the claim is stale (reaped or acked elsewhere);
    /// nothing is written in that case.
    async fn complete_fire(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError>;
}

/// Job persistence: definitions, run records, and atomic hand-off.
#[async_trait]
pub trait JobStore: WorkQueue<JobRunRow> {
    /// Insert or update a job definition by name.
    async fn upsert_job(&self, job: JobDefinition) -> Result<(), StoreError>;

    /// Delete a job definition. Existing runs are untouched.
    async fn delete_job(&self, name: &str) -> Result<bool, StoreError>;

    /// Enable or disable a job without touching its schedule state.
    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError>;

    /// All job definitions.
    async fn jobs(&self) -> Result<Vec<JobRow>, StoreError>;

    /// Record one run per fire time and advance `last_scheduled_at` to the
    /// newest, guarded by the previously observed value so concurrent
    /// tickers cannot double-fire. Returns the number of runs inserted
    /// (zero when another ticker won the race).
    async fn record_runs(
        &self,
        name: &str,
        observed_last: Option<DateTime<Utc>>,
        fires: &[DateTime<Utc>],
    ) -> Result<u64, StoreError>;

    /// Insert an immediate, out-of-schedule run for the job.
    async fn trigger(&self, name: &str, scheduled_for: DateTime<Utc>) -> Result<Uuid, StoreError>;

    /// Atomically ack the claimed run and insert `message` into the outbox;
    /// mirrors [`TimerStore::complete_fire`].
    async fn complete_run(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError>;
}

// =============================================================================
// Leases
// =============================================================================

/// A successful acquisition.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    /// Server-authoritative expiry.
    pub lease_until: DateTime<Utc>,
    /// Strictly greater than every token previously issued for this name.
    pub fencing_token: i64,
    /// The server's clock at grant time, for skew estimation.
    pub server_now: DateTime<Utc>,
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone)]
pub enum AcquireReply {
    Acquired(LeaseGrant),
    /// The lease is validly held by someone else.
    Held { server_now: DateTime<Utc> },
}

/// Outcome of a renew attempt.
#[derive(Debug, Clone)]
pub enum RenewReply {
    /// The deadline was extended; the fencing token is unchanged.
    Renewed {
        lease_until: DateTime<Utc>,
        server_now: DateTime<Utc>,
    },
    /// The caller no longer holds the lease.
    Lost { server_now: DateTime<Utc> },
}

/// Named distributed locks with fencing tokens and server-authoritative
/// expiry.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Try to take the named lease for `ttl`. Succeeds when the lease is
    /// free or expired; each new acquisition issues a higher fencing token.
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError>;

    /// Extend a held lease. Fails (without side effects) when `owner` no
    /// longer holds it.
    async fn renew(&self, name: &str, owner: &str, ttl: Duration)
        -> Result<RenewReply, StoreError>;

    /// Best-effort release. True when the row was held by `owner`.
    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError>;
}

// =============================================================================
// Joins
// =============================================================================

/// Terminal-state tally of a join's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinProgress {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
}

impl JoinProgress {
    /// Members not yet in a terminal state.
    pub fn pending(&self) -> u64 {
        self.total - self.done - self.failed
    }

    /// Every member is terminal.
    pub fn is_settled(&self) -> bool {
        self.pending() == 0
    }
}

/// How a join settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Completed,
    Failed,
}

/// Fan-in bookkeeping: membership, progress, and the atomic settlement that
/// turns N terminal members into one follow-up message.
#[async_trait]
pub trait JoinStore: Send + Sync {
    /// Register a join id. Idempotent.
    async fn create_join(&self, join_id: Uuid) -> Result<(), StoreError>;

    /// Atomically enqueue an outbox message and record it as a member of the
    /// join, so membership is never observed ahead of the message.
    async fn enqueue_member(
        &self,
        join_id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<Uuid, StoreError>;

    /// Tally member terminal states. `None` for an unknown join.
    async fn progress(&self, join_id: Uuid) -> Result<Option<JoinProgress>, StoreError>;

    /// Atomically transition the join to `outcome`, insert the follow-up
    /// message (when given), and ack the claimed `wait_row` - one
    /// transaction, so the follow-up commits with the ack.
    ///
    /// Idempotent: when the join is already terminal only the wait-row ack
    /// happens and the reply is false.
    async fn settle(
        &self,
        join_id: Uuid,
        outcome: JoinOutcome,
        owner: &OwnerToken,
        wait_row: Uuid,
        message: Option<NewOutboxMessage>,
    ) -> Result<bool, StoreError>;
}
