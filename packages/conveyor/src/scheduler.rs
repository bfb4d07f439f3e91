//! Scheduler: durable one-shot timers and recurring cron jobs.
//!
//! Both kinds ultimately emit outbox messages; the scheduler never performs
//! business work itself. The hand-off is exactly-once per fire because the
//! outbox insert commits in the same transaction as the timer/run ack
//! ([`TimerStore::complete_fire`] / [`JobStore::complete_run`]).
//!
//! Cron expressions are six-field, seconds-resolution, interpreted in UTC
//! (five-field expressions are accepted and fire at second zero). Missed
//! fires catch up by default - every missed occurrence produces a run,
//! drift-free, derived from the schedule rather than the tick that noticed
//! it. A job's `coalesce` bit collapses the missed backlog to its latest
//! occurrence instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Deadline, SharedClock};
use crate::dispatcher::Processor;
use crate::error::{ConveyorError, HandlerError};
use crate::provider::{StoreHandle, StoreProvider};
use crate::row::{JobDefinition, JobRow, JobRunRow, NewOutboxMessage, NewTimer, OwnerToken, TimerRow};
use crate::store::{JobStore, TimerStore};

/// Upper bound on catch-up fires recorded per job per tick. A job that fell
/// further behind resumes on the next tick; the truncation is logged.
const MAX_CATCH_UP: usize = 1_000;

// =============================================================================
// Cron parsing
// =============================================================================

/// Parse a cron expression, rejecting it at the API boundary when invalid.
pub fn parse_cron(expr: &str) -> Result<Cron, ConveyorError> {
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| ConveyorError::Cron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// All fire times strictly after `after` and at or before `until`, in order.
fn fires_between(
    cron: &Cron,
    expr: &str,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, ConveyorError> {
    let mut fires = Vec::new();
    let mut cursor = after;
    while fires.len() < MAX_CATCH_UP {
        let next = match cron.find_next_occurrence(&cursor, false) {
            Ok(next) => next,
            Err(e) => {
                return Err(ConveyorError::Cron {
                    expr: expr.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        if next > until {
            break;
        }
        fires.push(next);
        cursor = next;
    }
    Ok(fires)
}

// =============================================================================
// Scheduler
// =============================================================================

/// Timer and job API over one scheduler store.
pub struct Scheduler<S: ?Sized> {
    store: Arc<S>,
    clock: SharedClock,
}

impl<S: ?Sized> Scheduler<S> {
    pub fn new(store: Arc<S>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: TimerStore + ?Sized> Scheduler<S> {
    /// Schedule a one-shot timer that emits `(topic, payload)` into the
    /// outbox at `due_at`.
    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Result<Uuid, ConveyorError> {
        if topic.trim().is_empty() {
            return Err(ConveyorError::validation("topic must not be empty"));
        }
        Ok(self
            .store
            .schedule(NewTimer::new(topic, payload, due_at))
            .await?)
    }

    /// Delete a timer that has not fired yet. False once it fired or was
    /// already cancelled.
    pub async fn cancel_timer(&self, id: Uuid) -> Result<bool, ConveyorError> {
        Ok(self.store.cancel(id).await?)
    }
}

impl<S: JobStore + ?Sized> Scheduler<S> {
    /// Insert or update a recurring job. The cron expression is validated
    /// here, before anything is written.
    pub async fn create_or_update_job(&self, job: JobDefinition) -> Result<(), ConveyorError> {
        if job.name.trim().is_empty() {
            return Err(ConveyorError::validation("job name must not be empty"));
        }
        if job.topic.trim().is_empty() {
            return Err(ConveyorError::validation("topic must not be empty"));
        }
        parse_cron(&job.cron)?;
        Ok(self.store.upsert_job(job).await?)
    }

    pub async fn delete_job(&self, name: &str) -> Result<bool, ConveyorError> {
        Ok(self.store.delete_job(name).await?)
    }

    pub async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool, ConveyorError> {
        Ok(self.store.set_job_enabled(name, enabled).await?)
    }

    /// Fire a job now, outside its schedule.
    pub async fn trigger_job(&self, name: &str) -> Result<Uuid, ConveyorError> {
        Ok(self.store.trigger(name, self.clock.now()).await?)
    }

    /// One tick pass: for every enabled job, record a run per missed fire
    /// and advance `last_scheduled_at`. Returns the number of runs recorded.
    pub async fn tick(&self) -> Result<u64, ConveyorError> {
        let now = self.clock.now();
        let mut recorded_total = 0u64;

        for job in self.store.jobs().await? {
            if !job.enabled {
                continue;
            }
            match self.tick_job(&job, now).await {
                Ok(recorded) => recorded_total += recorded,
                Err(error) => {
                    // One bad job (unparseable cron, lost race) must not
                    // starve the rest of the tick.
                    warn!(job = %job.name, error = %error, "job tick failed");
                }
            }
        }
        Ok(recorded_total)
    }

    async fn tick_job(&self, job: &JobRow, now: DateTime<Utc>) -> Result<u64, ConveyorError> {
        let cron = parse_cron(&job.cron)?;
        let after = job.last_scheduled_at.unwrap_or(job.created_at);
        let mut fires = fires_between(&cron, &job.cron, after, now)?;
        if fires.len() == MAX_CATCH_UP {
            warn!(
                job = %job.name,
                batch = MAX_CATCH_UP,
                "catch-up truncated; resuming next tick"
            );
        }
        if job.coalesce && fires.len() > 1 {
            // Latest-only policy: collapse the missed backlog.
            if let Some(latest) = fires.last().copied() {
                fires = vec![latest];
            }
        }
        if fires.is_empty() {
            return Ok(0);
        }

        let recorded = self
            .store
            .record_runs(&job.name, job.last_scheduled_at, &fires)
            .await?;
        if recorded > 0 {
            debug!(job = %job.name, runs = recorded, "recorded job runs");
        }
        Ok(recorded)
    }
}

// =============================================================================
// Tick loop
// =============================================================================

/// Periodic tick pass over every store of the job primitive.
///
/// Jobs are low-frequency; every store is visited each tick rather than
/// rotating through a selection strategy. Pair with
/// [`crate::lease::run_exclusive`] when only one ticker per fleet should run.
pub async fn run_tick_loop<S>(
    provider: Arc<dyn StoreProvider<S>>,
    clock: SharedClock,
    interval: Duration,
    shutdown: CancellationToken,
) where
    S: JobStore + ?Sized + 'static,
{
    info!(interval = ?interval, "scheduler tick loop starting");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let tick = Deadline::after(interval);

        for store in provider.stores().await {
            let scheduler = Scheduler::new(Arc::clone(&store.store), Arc::clone(&clock));
            if let Err(error) = scheduler.tick().await {
                warn!(store = %store.id, error = %error, "tick pass failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.wait() => {}
        }
    }
    info!("scheduler tick loop stopped");
}

// =============================================================================
// Dispatch processors
// =============================================================================

/// Translates a due timer into its outbox message, atomically with the ack.
pub struct TimerProcessor;

#[async_trait]
impl<Q> Processor<Q, TimerRow> for TimerProcessor
where
    Q: TimerStore + ?Sized,
{
    async fn process(
        &self,
        store: &StoreHandle<Q>,
        owner: &OwnerToken,
        row: &TimerRow,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let mut message = NewOutboxMessage::new(row.topic.clone(), row.payload.clone());
        if let Some(correlation_id) = row.correlation_id {
            message = message.with_correlation_id(correlation_id);
        }

        let fired = store
            .store
            .complete_fire(owner, row.id, message)
            .await
            .map_err(HandlerError::from)?;
        if !fired {
            // Stale claim: reaped or completed elsewhere. The ack that
            // follows is a no-op for this owner either way.
            debug!(timer = %row.id, "stale timer claim; nothing emitted");
        }
        Ok(())
    }
}

/// Translates a claimed job run into its outbox message, atomically with the
/// ack.
pub struct JobRunProcessor;

#[async_trait]
impl<Q> Processor<Q, JobRunRow> for JobRunProcessor
where
    Q: JobStore + ?Sized,
{
    async fn process(
        &self,
        store: &StoreHandle<Q>,
        owner: &OwnerToken,
        row: &JobRunRow,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let message = NewOutboxMessage::new(row.topic.clone(), row.payload.clone());

        let fired = store
            .store
            .complete_run(owner, row.id, message)
            .await
            .map_err(HandlerError::from)?;
        if !fired {
            debug!(job_run = %row.id, job = %row.job_name, "stale run claim; nothing emitted");
        }
        Ok(())
    }
}
