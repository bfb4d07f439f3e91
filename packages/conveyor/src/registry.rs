//! Handler registration by topic.
//!
//! The registry is an explicit `topic → handler` map populated at startup -
//! no runtime type discovery, no process-wide mutable state. What happens on
//! an unknown topic is a policy: during a rolling deploy a handler may be
//! registered later in the process lifetime, so the default is to retry.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{Handler, HandlerRegistry, DispatchContext, HandlerError, OutboxRow};
//!
//! struct SendInvoice;
//!
//! #[async_trait::async_trait]
//! impl Handler<OutboxRow> for SendInvoice {
//!     async fn handle(
//!         &self,
//!         row: &OutboxRow,
//!         _ctx: &DispatchContext,
//!         _cancel: &CancellationToken,
//!     ) -> Result<(), HandlerError> {
//!         let invoice: Invoice = serde_json::from_value(row.payload.clone())
//!             .map_err(|e| HandlerError::permanent(anyhow::anyhow!(e)))?;
//!         mailer.send(invoice).await?; // anyhow errors retry with backoff
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("billing.invoice", SendInvoice);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::DispatchContext;
use crate::error::HandlerError;
use crate::row::WorkItem;

// =============================================================================
// Handler
// =============================================================================

/// Processes one claimed row.
///
/// Handlers must be idempotent: the queue guarantees at-least-once dispatch,
/// and a crash between handling and ack replays the row. They must also
/// observe `cancel` at their own await points; a handler that ignores
/// cancellation cannot outlive its lease.
#[async_trait]
pub trait Handler<R: WorkItem>: Send + Sync {
    async fn handle(
        &self,
        row: &R,
        ctx: &DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

// =============================================================================
// Unknown-topic policy
// =============================================================================

/// What the dispatcher does with a row whose topic has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTopicPolicy {
    /// Ack the row as if handled. For topics intentionally retired.
    Complete,
    /// Abandon with backoff; a handler may be registered later in the
    /// process lifetime.
    #[default]
    Retry,
    /// Terminally fail the row.
    Poison,
}

// =============================================================================
// HandlerRegistry
// =============================================================================

/// `topic → handler` map for one row variant.
pub struct HandlerRegistry<R: WorkItem> {
    handlers: HashMap<String, Arc<dyn Handler<R>>>,
    unknown_topic: UnknownTopicPolicy,
}

impl<R: WorkItem> HandlerRegistry<R> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            unknown_topic: UnknownTopicPolicy::default(),
        }
    }

    /// Set the unknown-topic policy.
    pub fn with_unknown_topic_policy(mut self, policy: UnknownTopicPolicy) -> Self {
        self.unknown_topic = policy;
        self
    }

    /// Register a handler for a topic.
    ///
    /// # Panics
    ///
    /// Panics if the topic already has a handler; duplicate registration is
    /// a wiring bug.
    pub fn register<H>(&mut self, topic: impl Into<String>, handler: H)
    where
        H: Handler<R> + 'static,
    {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            panic!("handler already registered for topic: {}", topic);
        }
        self.handlers.insert(topic, Arc::new(handler));
    }

    /// Register an already-shared handler (for handlers serving several
    /// topics).
    pub fn register_shared(&mut self, topic: impl Into<String>, handler: Arc<dyn Handler<R>>) {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            panic!("handler already registered for topic: {}", topic);
        }
        self.handlers.insert(topic, handler);
    }

    /// Look up the handler for a topic.
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn Handler<R>>> {
        self.handlers.get(topic).cloned()
    }

    pub fn unknown_topic_policy(&self) -> UnknownTopicPolicy {
        self.unknown_topic
    }

    pub fn has(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<R: WorkItem> Default for HandlerRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: WorkItem> std::fmt::Debug for HandlerRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .field("unknown_topic", &self.unknown_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{OutboxRow, OwnerToken, StoreId, WorkStatus};
    use chrono::Utc;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl Handler<OutboxRow> for NoopHandler {
        async fn handle(
            &self,
            _row: &OutboxRow,
            _ctx: &DispatchContext,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn sample_row(topic: &str) -> OutboxRow {
        OutboxRow {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload: serde_json::json!({}),
            message_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            due_at: None,
            status: WorkStatus::Ready,
            owner_token: None,
            locked_until: None,
            retry_count: 0,
            next_attempt_at: Utc::now(),
            last_error: None,
            processed_at: None,
            processed_by: None,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry: HandlerRegistry<OutboxRow> = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("t", NoopHandler);
        assert!(registry.has("t"));
        assert!(registry.resolve("t").is_some());
        assert!(registry.resolve("other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry: HandlerRegistry<OutboxRow> = HandlerRegistry::new();
        registry.register("t", NoopHandler);
        registry.register("t", NoopHandler);
    }

    #[test]
    fn test_default_unknown_topic_policy_is_retry() {
        let registry: HandlerRegistry<OutboxRow> = HandlerRegistry::new();
        assert_eq!(registry.unknown_topic_policy(), UnknownTopicPolicy::Retry);

        let registry = registry.with_unknown_topic_policy(UnknownTopicPolicy::Poison);
        assert_eq!(registry.unknown_topic_policy(), UnknownTopicPolicy::Poison);
    }

    #[tokio::test]
    async fn test_resolved_handler_runs() {
        let mut registry: HandlerRegistry<OutboxRow> = HandlerRegistry::new();
        registry.register("t", NoopHandler);

        let row = sample_row("t");
        let ctx = DispatchContext::new(
            None,
            OwnerToken::mint("test"),
            StoreId::new("store-a"),
            row.id,
        );
        let handler = registry.resolve("t").unwrap();
        let result = handler.handle(&row, &ctx, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}
