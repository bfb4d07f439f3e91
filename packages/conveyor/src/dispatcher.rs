//! Multi-store dispatcher and polling loop.
//!
//! One [`Poller`] runs per primitive as a long-lived background task:
//!
//! ```text
//! loop:
//!   tick = monotonic_now + interval
//!   stores = provider.stores()
//!   reap / cleanup passes when due (every store)
//!   store = strategy.select(stores, last_outcome)
//!   none  → sleep_until(tick); continue
//!   count = dispatch_once(store)       // claim → process → ack/abandon/fail
//!   sleep_until(tick)
//! ```
//!
//! `dispatch_once` mints an owner token, claims a batch, runs the processor
//! over rows with bounded concurrency and a per-handler timeout, classifies
//! each verdict, and issues batched acks/abandons/fails. Errors from one
//! store never halt polling of the others; shutdown is honored between
//! batches, never mid-handler.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::clock::{system_clock, Deadline, SharedClock};
use crate::context::DispatchContext;
use crate::error::{HandlerError, StoreError};
use crate::provider::{StoreHandle, StoreProvider};
use crate::registry::{HandlerRegistry, UnknownTopicPolicy};
use crate::row::{OwnerToken, WorkItem};
use crate::store::{AbandonRequest, FailRequest, WorkQueue};
use crate::strategy::{LastPoll, SelectionStrategy};

// =============================================================================
// Config
// =============================================================================

/// Tuning for one polling loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Loop cadence.
    pub poll_interval: Duration,
    /// Rows claimed per batch.
    pub batch_size: usize,
    /// Claim lease; a crashed worker's rows return after this elapses.
    pub lease: Duration,
    /// Cadence of the reap pass over all stores.
    pub reap_interval: Duration,
    /// Handler invocations in flight per batch.
    pub handler_concurrency: usize,
    /// Fraction of the lease a single handler may run before it is timed
    /// out and the row abandoned.
    pub handler_timeout_fraction: f64,
    /// Attempt budget; exceeding it terminally fails the row. `None` retries
    /// until a permanent failure is signalled (outbox default).
    pub max_attempts: Option<u32>,
    /// Delete Done rows older than this during cleanup.
    pub retention: Duration,
    /// Run the cleanup pass at all.
    pub enable_cleanup: bool,
    /// Cadence of the cleanup pass.
    pub cleanup_interval: Duration,
    /// Owner-token prefix, for log readability.
    pub worker_name: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 50,
            lease: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            handler_concurrency: 8,
            handler_timeout_fraction: 0.8,
            max_attempts: None,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            enable_cleanup: true,
            cleanup_interval: Duration::from_secs(60 * 60),
            worker_name: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl PollerConfig {
    /// Defaults for an inbox poller: a bounded attempt budget.
    pub fn inbox() -> Self {
        Self {
            max_attempts: Some(5),
            ..Default::default()
        }
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Processes one claimed row on behalf of a poller.
///
/// [`RegistryProcessor`] covers outbox and inbox dispatch; the scheduler
/// supplies its own processors that hand timers and job runs into the outbox
/// atomically with the ack.
#[async_trait]
pub trait Processor<Q, R>: Send + Sync
where
    Q: WorkQueue<R> + ?Sized,
    R: WorkItem,
{
    async fn process(
        &self,
        store: &StoreHandle<Q>,
        owner: &OwnerToken,
        row: &R,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Resolves a handler by topic and runs it inside the dispatch span.
pub struct RegistryProcessor<R: WorkItem> {
    registry: Arc<HandlerRegistry<R>>,
}

impl<R: WorkItem> RegistryProcessor<R> {
    pub fn new(registry: Arc<HandlerRegistry<R>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<Q, R> Processor<Q, R> for RegistryProcessor<R>
where
    Q: WorkQueue<R> + ?Sized,
    R: WorkItem,
{
    async fn process(
        &self,
        store: &StoreHandle<Q>,
        owner: &OwnerToken,
        row: &R,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let ctx = DispatchContext::new(
            row.correlation_id(),
            owner.clone(),
            store.id.clone(),
            row.id(),
        );

        match self.registry.resolve(row.topic()) {
            Some(handler) => {
                let span = tracing::info_span!(
                    "dispatch",
                    topic = %row.topic(),
                    row_id = %row.id(),
                    store_id = %store.id,
                    owner = %owner,
                    correlation_id = ?row.correlation_id(),
                );
                handler.handle(row, &ctx, cancel).instrument(span).await
            }
            None => match self.registry.unknown_topic_policy() {
                UnknownTopicPolicy::Complete => Ok(()),
                UnknownTopicPolicy::Retry => Err(HandlerError::transient(anyhow::anyhow!(
                    "no handler registered for topic {:?}",
                    row.topic()
                ))),
                UnknownTopicPolicy::Poison => Err(HandlerError::permanent(anyhow::anyhow!(
                    "no handler registered for topic {:?}",
                    row.topic()
                ))),
            },
        }
    }
}

// =============================================================================
// Verdicts
// =============================================================================

#[derive(Debug)]
enum Verdict {
    Ack,
    Abandon { error: Option<String>, delay: Duration },
    Fail { error: String },
}

// =============================================================================
// Poller
// =============================================================================

/// A polling loop over every store of one primitive.
pub struct Poller<Q, R, P>
where
    Q: WorkQueue<R> + ?Sized,
    R: WorkItem,
    P: Processor<Q, R>,
{
    provider: Arc<dyn StoreProvider<Q>>,
    strategy: Arc<dyn SelectionStrategy>,
    processor: Arc<P>,
    backoff: BackoffPolicy,
    clock: SharedClock,
    config: PollerConfig,
    _row: PhantomData<fn() -> R>,
}

impl<Q, R, P> Poller<Q, R, P>
where
    Q: WorkQueue<R> + ?Sized + 'static,
    R: WorkItem,
    P: Processor<Q, R>,
{
    pub fn new(
        provider: Arc<dyn StoreProvider<Q>>,
        strategy: Arc<dyn SelectionStrategy>,
        processor: Arc<P>,
        config: PollerConfig,
    ) -> Self {
        Self {
            provider,
            strategy,
            processor,
            backoff: BackoffPolicy::default(),
            clock: system_clock(),
            config,
            _row: PhantomData,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until `shutdown` fires. Stops between batches; in-flight rows
    /// finish their ack/abandon step first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker = %self.config.worker_name,
            batch_size = self.config.batch_size,
            poll_interval = ?self.config.poll_interval,
            "poller starting"
        );

        let mut last: Option<LastPoll> = None;
        let mut next_reap = Deadline::after(Duration::ZERO);
        let mut next_cleanup = Deadline::after(self.config.cleanup_interval);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let tick = Deadline::after(self.config.poll_interval);

            let stores = self.provider.stores().await;

            if next_reap.is_expired() {
                self.reap_pass(&stores).await;
                next_reap = Deadline::after(self.config.reap_interval);
            }
            if self.config.enable_cleanup && next_cleanup.is_expired() {
                self.cleanup_pass(&stores).await;
                next_cleanup = Deadline::after(self.config.cleanup_interval);
            }

            let ids: Vec<_> = stores.iter().map(|s| s.id.clone()).collect();
            let picked = self
                .strategy
                .select(&ids, last.as_ref())
                .and_then(|id| stores.iter().find(|s| s.id == id).cloned());

            let Some(store) = picked else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.wait() => {}
                }
                continue;
            };

            match self.dispatch_once(&store, &shutdown).await {
                Ok(count) => {
                    if count > 0 {
                        debug!(store = %store.id, count, "dispatched batch");
                    }
                    last = Some(LastPoll {
                        store: store.id.clone(),
                        count,
                    });
                }
                Err(err) => {
                    // One store's failure must not halt the others.
                    error!(store = %store.id, error = %err, "dispatch failed");
                    last = Some(LastPoll {
                        store: store.id.clone(),
                        count: 0,
                    });
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.wait() => {}
            }
        }

        info!(worker = %self.config.worker_name, "poller stopped");
    }

    /// Claim and process one batch from `store`. Returns the claimed count.
    pub async fn dispatch_once(
        &self,
        store: &StoreHandle<Q>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        if self.config.batch_size == 0 {
            return Ok(0);
        }

        let owner = OwnerToken::mint(&self.config.worker_name);
        let rows = store
            .store
            .claim(&owner, self.config.lease, self.config.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let claimed = rows.len();

        let handler_timeout = self
            .config
            .lease
            .mul_f64(self.config.handler_timeout_fraction.clamp(0.0, 1.0));

        let verdict_stream = futures::stream::iter(rows.into_iter())
            .map(|row| {
                let owner = owner.clone();
                let child = cancel.child_token();
                async move {
                    let result = match tokio::time::timeout(
                        handler_timeout,
                        self.processor.process(store, &owner, &row, &child),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::transient(anyhow::anyhow!(
                            "handler timed out after {:?}",
                            handler_timeout
                        ))),
                    };
                    let verdict = self.classify(&row, result);
                    (row, verdict)
                }
            })
            .buffer_unordered(self.config.handler_concurrency.max(1))
            .collect::<Vec<_>>();

        // Cancellation is honored between batches, never mid-handler: when
        // `cancel` fires, handlers observe their child tokens and return
        // early (as transient failures), the stream drains, and the batch
        // still gets its ack/abandon step. A handler that ignores its token
        // is bounded by the timeout above; rows lost to a crash are left
        // InProgress for the reaper.
        let verdicts = verdict_stream.await;

        let mut acks = Vec::new();
        let mut abandons = Vec::new();
        let mut fails = Vec::new();
        for (row, verdict) in verdicts {
            match verdict {
                Verdict::Ack => acks.push(row.id()),
                Verdict::Abandon { error, delay } => {
                    if let Some(error) = &error {
                        warn!(
                            store = %store.id,
                            row_id = %row.id(),
                            topic = %row.topic(),
                            attempt = row.attempt(),
                            error = %error,
                            "row abandoned for retry"
                        );
                    }
                    abandons.push(AbandonRequest {
                        id: row.id(),
                        error,
                        delay,
                    });
                }
                Verdict::Fail { error } => {
                    error!(
                        store = %store.id,
                        row_id = %row.id(),
                        topic = %row.topic(),
                        error = %error,
                        "row terminally failed"
                    );
                    fails.push(FailRequest {
                        id: row.id(),
                        error,
                    });
                }
            }
        }

        if !acks.is_empty() {
            store.store.ack(&owner, &acks).await?;
        }
        if !abandons.is_empty() {
            store.store.abandon(&owner, &abandons).await?;
        }
        if !fails.is_empty() {
            store.store.fail(&owner, &fails).await?;
        }

        Ok(claimed)
    }

    fn classify(&self, row: &R, result: Result<(), HandlerError>) -> Verdict {
        match result {
            Ok(()) => Verdict::Ack,
            Err(HandlerError::Permanent(err)) => Verdict::Fail {
                error: format!("{err:#}"),
            },
            Err(HandlerError::JoinNotReady) => Verdict::Abandon {
                error: Some("join not ready".to_string()),
                delay: self.backoff.join_retry_delay(row.attempt()),
            },
            Err(HandlerError::Transient(err)) => {
                let exhausted = self
                    .config
                    .max_attempts
                    .is_some_and(|max| row.attempt() >= max as i32);
                if exhausted {
                    Verdict::Fail {
                        error: format!("attempt budget exhausted: {err:#}"),
                    }
                } else {
                    Verdict::Abandon {
                        error: Some(format!("{err:#}")),
                        delay: self.backoff.delay_for(row.attempt()),
                    }
                }
            }
        }
    }

    async fn reap_pass(&self, stores: &[StoreHandle<Q>]) {
        for store in stores {
            match store.store.reap().await {
                Ok(0) => {}
                Ok(reclaimed) => {
                    info!(store = %store.id, reclaimed, "reaped expired claims");
                }
                Err(error) => {
                    warn!(store = %store.id, error = %error, "reap pass failed");
                }
            }
        }
    }

    async fn cleanup_pass(&self, stores: &[StoreHandle<Q>]) {
        let retention = match chrono::Duration::from_std(self.config.retention) {
            Ok(retention) => retention,
            Err(_) => return,
        };
        let cutoff = self.clock.now() - retention;
        for store in stores {
            match store.store.purge_done(cutoff).await {
                Ok(0) => {}
                Ok(purged) => {
                    debug!(store = %store.id, purged, "purged processed rows");
                }
                Err(error) => {
                    warn!(store = %store.id, error = %error, "cleanup pass failed");
                }
            }
        }
    }
}
