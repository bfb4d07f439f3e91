//! # Conveyor
//!
//! Durable, database-backed work-queue primitives for multi-tenant service
//! fleets: a transactional **outbox**, a deduplicating **inbox**, a
//! **scheduler** (one-shot timers + cron jobs), and fencing-token **leases**
//! - all built on one claim/ack/abandon/reap protocol against a pluggable
//! store contract.
//!
//! ## Architecture
//!
//! ```text
//! Application code
//!     │ enqueue / schedule / observe
//!     ▼
//! Store contract (WorkQueue + per-primitive traits)
//!     ▲                                   ▲
//!     │ claim / ack / abandon / reap      │ acquire / renew
//!     │                                   │
//! Poller (per primitive) ─────────── LeaseRunner
//!     │ select store (strategy)           │ loss → cancellation
//!     │ resolve handler (registry)        ▼
//!     ▼                              singleton work
//! Handler (idempotent, cancellable)
//! ```
//!
//! A poller asks its [`StoreProvider`] for the current tenant stores, lets a
//! [`SelectionStrategy`] pick one, claims a batch under an owner token and a
//! timed lease, dispatches each row, and acks/abandons/fails the batch.
//! Crashed workers leave leased rows behind; the periodic reap pass returns
//! them to ready once the lease elapses.
//!
//! ## Guarantees
//!
//! - **At-least-once dispatch** - handlers must be idempotent; exactly-once
//!   is explicitly not offered.
//! - **Disjoint claims** - concurrent claimers never observe the same row
//!   in progress under different owners.
//! - **Exactly one enqueue per scheduler fire** - the outbox insert commits
//!   atomically with the timer/run ack.
//! - **Monotonic fencing tokens** - every re-acquisition of a lease name
//!   issues a strictly greater token.
//! - **Monotonic schedules** - renewal and polling deadlines never consult
//!   the wall clock, so clock jumps cannot cause retry storms.

// Core modules
mod backoff;
mod clock;
mod context;
mod dispatcher;
mod error;
mod inbox;
mod join;
mod lease;
mod outbox;
mod provider;
mod registry;
mod row;
mod scheduler;
mod store;
mod strategy;

// In-memory store and test clocks (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export clocks
pub use clock::{system_clock, Clock, Deadline, SharedClock, SystemClock};

// Re-export error types
pub use error::{ConveyorError, HandlerError, StoreError};

// Re-export row models and identities
pub use row::{
    InboxKey, InboxRow, InboxStatus, JobDefinition, JobRow, JobRunRow, NewInboxMessage,
    NewOutboxMessage, NewTimer, Observation, OutboxRow, OwnerToken, StoreId, TimerRow, WorkItem,
    WorkStatus,
};

// Re-export the store contract
pub use store::{
    AbandonRequest, AcquireReply, FailRequest, InboxStore, JobStore, JoinOutcome, JoinProgress,
    JoinStore, LeaseGrant, LeaseStore, OutboxStore, RenewReply, TimerStore, WorkQueue,
};

// Re-export dispatch plumbing
pub use backoff::BackoffPolicy;
pub use context::DispatchContext;
pub use dispatcher::{Poller, PollerConfig, Processor, RegistryProcessor};
pub use registry::{Handler, HandlerRegistry, UnknownTopicPolicy};

// Re-export primitives
pub use inbox::Inbox;
pub use join::{JoinWaitHandler, JoinWaitRequest, Joins, JOIN_WAIT_TOPIC};
pub use lease::{run_exclusive, LeaseRunner, LeaseRunnerConfig};
pub use outbox::Outbox;
pub use scheduler::{parse_cron, run_tick_loop, JobRunProcessor, Scheduler, TimerProcessor};

// Re-export multi-store plumbing
pub use provider::{
    ConfiguredStoreProvider, DatabaseDiscovery, DiscoveredDatabase, DynamicStoreProvider,
    StoreHandle, StoreProvider, StoreRouter,
};
pub use strategy::{DrainFirst, LastPoll, RoundRobin, SelectionStrategy};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
