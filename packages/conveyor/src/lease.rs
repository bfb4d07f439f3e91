//! Lease runner: hold a named distributed lock and surface loss as
//! cancellation.
//!
//! A [`LeaseRunner`] owns a background renewal task. The renewal schedule is
//! monotonic (`tokio::time`), so wall-clock jumps and VM pauses cannot starve
//! it; the lease deadline itself is server-authoritative. Renewal fires at
//! `ttl × renew_percent` (default 0.6) plus up to a second of jitter to
//! decorrelate fleets; a failed renewal is retried once immediately (the
//! remaining 40% of the ttl is the margin), and a second failure - or a
//! server refusal - marks the runner Lost and cancels its token.
//!
//! # Contract
//!
//! Work whose correctness depends on the lease must take the runner's
//! cancellation token and abort promptly when it fires. The fencing token is
//! available for downstream services that reject stale holders.
//!
//! # Example
//!
//! ```ignore
//! let Some(runner) = LeaseRunner::acquire(
//!     store.clone(),
//!     "billing:tenant-1",
//!     "worker-7",
//!     Duration::from_secs(30),
//!     LeaseRunnerConfig::default(),
//! ).await? else {
//!     return Ok(()); // someone else holds it
//! };
//!
//! let cancel = runner.cancellation_token();
//! do_singleton_work(cancel).await?;
//! runner.ensure_held()?; // LeaseLost if renewal gave up
//! runner.release().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Deadline;
use crate::error::{ConveyorError, StoreError};
use crate::store::{AcquireReply, LeaseStore, RenewReply};

// =============================================================================
// Config
// =============================================================================

/// Renewal tuning for [`LeaseRunner`].
#[derive(Debug, Clone)]
pub struct LeaseRunnerConfig {
    /// Fraction of the ttl after which renewal runs. Must leave enough
    /// margin for one immediate retry.
    pub renew_percent: f64,
    /// Upper bound of the random jitter added to each renewal deadline.
    pub renew_jitter: Duration,
}

impl Default for LeaseRunnerConfig {
    fn default() -> Self {
        Self {
            renew_percent: 0.6,
            renew_jitter: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Runner state
// =============================================================================

const STATE_HELD: u8 = 0;
const STATE_LOST: u8 = 1;
const STATE_RELEASED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerState {
    Held,
    Lost,
    Released,
}

struct Shared {
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> RunnerState {
        match self.state.load(Ordering::Acquire) {
            STATE_LOST => RunnerState::Lost,
            STATE_RELEASED => RunnerState::Released,
            _ => RunnerState::Held,
        }
    }

    fn mark_lost(&self) {
        // Released is terminal; don't resurrect it as Lost.
        let _ = self.state.compare_exchange(
            STATE_HELD,
            STATE_LOST,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.cancel.cancel();
    }

    fn mark_released(&self) {
        let _ = self.state.compare_exchange(
            STATE_HELD,
            STATE_RELEASED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.cancel.cancel();
    }
}

// =============================================================================
// LeaseRunner
// =============================================================================

/// A held lease with automatic renewal.
pub struct LeaseRunner {
    name: String,
    owner: String,
    fencing_token: i64,
    shared: Arc<Shared>,
    renewal: Option<JoinHandle<()>>,
    store: Arc<dyn LeaseStore>,
}

impl LeaseRunner {
    /// Try to acquire `name` for `ttl`. Returns `None` when the lease is
    /// validly held elsewhere; on success the renewal task is already
    /// running.
    pub async fn acquire<S>(
        store: Arc<S>,
        name: &str,
        owner: &str,
        ttl: Duration,
        config: LeaseRunnerConfig,
    ) -> Result<Option<LeaseRunner>, ConveyorError>
    where
        S: LeaseStore + 'static,
    {
        if name.is_empty() {
            return Err(ConveyorError::validation("lease name must not be empty"));
        }
        if ttl.is_zero() {
            return Err(ConveyorError::validation("lease ttl must be positive"));
        }
        if !(0.0..1.0).contains(&config.renew_percent) || config.renew_percent <= 0.0 {
            return Err(ConveyorError::validation(
                "renew_percent must be in (0, 1)",
            ));
        }

        let grant = match store.acquire(name, owner, ttl).await? {
            AcquireReply::Acquired(grant) => grant,
            AcquireReply::Held { .. } => return Ok(None),
        };

        info!(
            lease = %name,
            owner = %owner,
            fencing_token = grant.fencing_token,
            lease_until = %grant.lease_until,
            "lease acquired"
        );

        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_HELD),
            cancel: CancellationToken::new(),
        });

        let renewal = tokio::spawn(renewal_loop(
            Arc::clone(&store) as Arc<dyn LeaseStore>,
            name.to_string(),
            owner.to_string(),
            ttl,
            config,
            Arc::clone(&shared),
        ));

        Ok(Some(LeaseRunner {
            name: name.to_string(),
            owner: owner.to_string(),
            fencing_token: grant.fencing_token,
            shared,
            renewal: Some(renewal),
            store,
        }))
    }

    /// The fencing token issued at acquisition. Renewals do not change it.
    pub fn fencing_token(&self) -> i64 {
        self.fencing_token
    }

    /// The lease name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token that fires on lease loss, release, or drop. Pass it into every
    /// piece of work the lease protects.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Has renewal given up?
    pub fn is_lost(&self) -> bool {
        self.shared.state() == RunnerState::Lost
    }

    /// Error if the lease was observed lost.
    pub fn ensure_held(&self) -> Result<(), ConveyorError> {
        if self.is_lost() {
            Err(ConveyorError::LeaseLost(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Stop renewing and best-effort release the row. Skips the release when
    /// the lease was already lost (another holder may own it by now).
    pub async fn release(mut self) {
        let was_held = self.shared.state() == RunnerState::Held;
        self.shared.mark_released();
        if let Some(handle) = self.renewal.take() {
            let _ = handle.await;
        }
        if was_held {
            match self.store.release(&self.name, &self.owner).await {
                Ok(released) => {
                    debug!(lease = %self.name, released, "lease released");
                }
                Err(error) => {
                    warn!(lease = %self.name, error = %error, "lease release failed");
                }
            }
        }
    }
}

impl Drop for LeaseRunner {
    fn drop(&mut self) {
        // Cancels dependents and stops the renewal task; the row itself is
        // left to expire when `release` was not called.
        self.shared.mark_released();
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LeaseRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRunner")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("fencing_token", &self.fencing_token)
            .field("state", &self.shared.state())
            .finish()
    }
}

async fn renewal_loop(
    store: Arc<dyn LeaseStore>,
    name: String,
    owner: String,
    ttl: Duration,
    config: LeaseRunnerConfig,
    shared: Arc<Shared>,
) {
    loop {
        let jitter_millis = config.renew_jitter.as_millis() as u64;
        let jitter = if jitter_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..jitter_millis))
        };
        let deadline = Deadline::after(ttl.mul_f64(config.renew_percent) + jitter);

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = deadline.wait() => {}
        }

        match renew_with_retry(store.as_ref(), &name, &owner, ttl).await {
            Ok(true) => {
                debug!(lease = %name, "lease renewed");
            }
            Ok(false) => {
                warn!(lease = %name, owner = %owner, "lease no longer held; marking lost");
                shared.mark_lost();
                return;
            }
            Err(error) => {
                warn!(lease = %name, error = %error, "lease renewal failed twice; marking lost");
                shared.mark_lost();
                return;
            }
        }
    }
}

/// One renewal with a single immediate retry on backend errors. The
/// renew-percent margin is what makes the immediate retry safe.
async fn renew_with_retry(
    store: &dyn LeaseStore,
    name: &str,
    owner: &str,
    ttl: Duration,
) -> Result<bool, StoreError> {
    let first = match store.renew(name, owner, ttl).await {
        Ok(reply) => return Ok(matches!(reply, RenewReply::Renewed { .. })),
        Err(error) => error,
    };
    warn!(lease = %name, error = %first, "lease renewal errored; retrying once");
    match store.renew(name, owner, ttl).await {
        Ok(reply) => Ok(matches!(reply, RenewReply::Renewed { .. })),
        Err(error) => Err(error),
    }
}

// =============================================================================
// run_exclusive
// =============================================================================

/// Run `body` only while holding the named lease, re-acquiring forever until
/// `shutdown` fires.
///
/// Used to make a poller a fleet singleton: the body receives a token that
/// fires on lease loss *or* shutdown, and the loop re-competes for the lease
/// after either loss or completion.
pub async fn run_exclusive<S, F, Fut>(
    store: Arc<S>,
    name: &str,
    owner: &str,
    ttl: Duration,
    config: LeaseRunnerConfig,
    retry_interval: Duration,
    shutdown: CancellationToken,
    mut body: F,
) -> Result<(), ConveyorError>
where
    S: LeaseStore + 'static,
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let runner = match LeaseRunner::acquire(
            Arc::clone(&store),
            name,
            owner,
            ttl,
            config.clone(),
        )
        .await
        {
            Ok(Some(runner)) => runner,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(retry_interval) => continue,
                }
            }
            Err(ConveyorError::Store(error)) => {
                warn!(lease = %name, error = %error, "lease acquire failed; retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(retry_interval) => continue,
                }
            }
            Err(other) => return Err(other),
        };

        // Link the body's token to both lease loss and shutdown.
        let run_token = runner.cancellation_token().child_token();
        {
            let shutdown = shutdown.clone();
            let run_token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => run_token.cancel(),
                    _ = run_token.cancelled() => {}
                }
            });
        }

        if let Err(error) = body(run_token).await {
            warn!(lease = %name, error = %error, "exclusive body errored");
        }

        if runner.is_lost() {
            warn!(lease = %name, "lease lost; re-competing");
            drop(runner);
        } else {
            runner.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use crate::store::LeaseGrant;

    /// Scripted lease store: acquire always succeeds, renew behavior is
    /// programmable.
    struct ScriptedLeaseStore {
        fail_renew: AtomicBool,
        refuse_renew: AtomicBool,
        renew_calls: Mutex<u32>,
    }

    impl ScriptedLeaseStore {
        fn new() -> Self {
            Self {
                fail_renew: AtomicBool::new(false),
                refuse_renew: AtomicBool::new(false),
                renew_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LeaseStore for ScriptedLeaseStore {
        async fn acquire(
            &self,
            _name: &str,
            _owner: &str,
            ttl: Duration,
        ) -> Result<AcquireReply, StoreError> {
            let now = Utc::now();
            Ok(AcquireReply::Acquired(LeaseGrant {
                lease_until: now + chrono::Duration::from_std(ttl).unwrap(),
                fencing_token: 1,
                server_now: now,
            }))
        }

        async fn renew(
            &self,
            _name: &str,
            _owner: &str,
            ttl: Duration,
        ) -> Result<RenewReply, StoreError> {
            *self.renew_calls.lock().unwrap() += 1;
            let now = Utc::now();
            if self.fail_renew.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("network down")));
            }
            if self.refuse_renew.load(Ordering::SeqCst) {
                return Ok(RenewReply::Lost { server_now: now });
            }
            Ok(RenewReply::Renewed {
                lease_until: now + chrono::Duration::from_std(ttl).unwrap(),
                server_now: now,
            })
        }

        async fn release(&self, _name: &str, _owner: &str) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    fn config() -> LeaseRunnerConfig {
        LeaseRunnerConfig {
            renew_percent: 0.6,
            renew_jitter: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_renews_on_schedule() {
        let store = Arc::new(ScriptedLeaseStore::new());
        let runner = LeaseRunner::acquire(
            Arc::clone(&store),
            "job-a",
            "o1",
            Duration::from_secs(30),
            config(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(runner.fencing_token(), 1);

        // Renewal fires at 18s; after 40s two renewals have happened.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(*store.renew_calls.lock().unwrap() >= 2);
        assert!(!runner.is_lost());
        runner.ensure_held().unwrap();

        runner.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_marks_lost_when_server_refuses() {
        let store = Arc::new(ScriptedLeaseStore::new());
        let runner = LeaseRunner::acquire(
            Arc::clone(&store),
            "job-a",
            "o1",
            Duration::from_secs(10),
            config(),
        )
        .await
        .unwrap()
        .unwrap();

        store.refuse_renew.store(true, Ordering::SeqCst);
        let cancel = runner.cancellation_token();

        tokio::time::timeout(Duration::from_secs(30), cancel.cancelled())
            .await
            .expect("token should fire on loss");
        assert!(runner.is_lost());
        assert!(matches!(
            runner.ensure_held(),
            Err(ConveyorError::LeaseLost(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_marks_lost_after_double_failure() {
        let store = Arc::new(ScriptedLeaseStore::new());
        let runner = LeaseRunner::acquire(
            Arc::clone(&store),
            "job-a",
            "o1",
            Duration::from_secs(10),
            config(),
        )
        .await
        .unwrap()
        .unwrap();

        store.fail_renew.store(true, Ordering::SeqCst);
        let cancel = runner.cancellation_token();
        tokio::time::timeout(Duration::from_secs(30), cancel.cancelled())
            .await
            .expect("token should fire after retry fails");

        // Failed attempt plus its immediate retry.
        assert_eq!(*store.renew_calls.lock().unwrap(), 2);
        assert!(runner.is_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_dependents() {
        let store = Arc::new(ScriptedLeaseStore::new());
        let runner = LeaseRunner::acquire(
            Arc::clone(&store),
            "job-a",
            "o1",
            Duration::from_secs(30),
            config(),
        )
        .await
        .unwrap()
        .unwrap();

        let cancel = runner.cancellation_token();
        runner.release().await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_acquire_validation() {
        let store = Arc::new(ScriptedLeaseStore::new());
        let result = LeaseRunner::acquire(
            Arc::clone(&store),
            "",
            "o1",
            Duration::from_secs(5),
            config(),
        )
        .await;
        assert!(matches!(result, Err(ConveyorError::Validation(_))));

        let result =
            LeaseRunner::acquire(store, "job", "o1", Duration::ZERO, config()).await;
        assert!(matches!(result, Err(ConveyorError::Validation(_))));
    }
}
