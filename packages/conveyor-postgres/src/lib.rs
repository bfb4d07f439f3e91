//! # conveyor-postgres
//!
//! PostgreSQL provider for the conveyor work-queue substrate: one
//! [`PgStore`] implements every store trait against one database.
//!
//! - Claims use a `FOR UPDATE SKIP LOCKED` CTE feeding an
//!   `UPDATE ... RETURNING`, so concurrent claimers take disjoint batches
//!   without blocking.
//! - All correctness-relevant timestamps come from the server's `NOW()`.
//! - The inbox dedupe is a single upsert whose `xmax = 0` projection tells
//!   the winning insert apart from conflict updates.
//! - Fencing tokens increment inside the lease upsert and survive release.
//! - Schema deployment is idempotent and runs on construction by default.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{NewOutboxMessage, Outbox};
//! use conveyor_postgres::{PgStore, PgStoreConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(
//!     PgStore::connect("postgres://app@db/tenant1", PgStoreConfig::default()).await?,
//! );
//!
//! // Standalone enqueue:
//! Outbox::new(store.clone())
//!     .enqueue(NewOutboxMessage::new("billing.invoice", payload))
//!     .await?;
//!
//! // Or atomically with business data:
//! let mut tx = store.pool().begin().await?;
//! sqlx::query("INSERT INTO invoices ...").execute(&mut *tx).await?;
//! store.enqueue_outbox_in(&mut tx, NewOutboxMessage::new("billing.invoice", payload)).await?;
//! tx.commit().await?;
//! ```

mod config;
mod queue;
mod rows;
mod schema;
mod store;

pub use config::PgStoreConfig;
pub use store::PgStore;
