//! Fan-in join coordinator.
//!
//! A join groups N outbox messages; when every member reaches a terminal
//! state, a single follow-up message is emitted. The mechanism is a regular
//! outbox message on the [`JOIN_WAIT_TOPIC`] whose handler re-checks member
//! progress: while any member is non-terminal it reports
//! [`HandlerError::JoinNotReady`] and the dispatcher abandons the row with a
//! short fixed delay, giving cheap backpressure-friendly re-checks.
//!
//! Settlement - marking the join terminal, enqueueing the follow-up, and
//! acking the wait row - happens in one store transaction
//! ([`JoinStore::settle`]), so completion is emitted exactly once no matter
//! how often the wait row retries or replays.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::DispatchContext;
use crate::error::{ConveyorError, HandlerError};
use crate::provider::StoreProvider;
use crate::registry::Handler;
use crate::row::{NewOutboxMessage, OutboxRow};
use crate::store::{JoinOutcome, JoinStore};

/// Topic of the wait message that drives a join to completion.
pub const JOIN_WAIT_TOPIC: &str = "join.wait";

// =============================================================================
// JoinWaitRequest
// =============================================================================

/// Payload of a `join.wait` outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitRequest {
    pub join_id: Uuid,
    /// When true and any member failed, the join settles Failed and emits
    /// the on-fail message instead of the on-complete one.
    #[serde(default)]
    pub fail_if_any_step_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_payload: Option<serde_json::Value>,
}

impl JoinWaitRequest {
    pub fn new(join_id: Uuid) -> Self {
        Self {
            join_id,
            fail_if_any_step_failed: false,
            on_complete_topic: None,
            on_complete_payload: None,
            on_fail_topic: None,
            on_fail_payload: None,
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_if_any_step_failed = true;
        self
    }

    pub fn on_complete(mut self, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        self.on_complete_topic = Some(topic.into());
        self.on_complete_payload = Some(payload);
        self
    }

    pub fn on_fail(mut self, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        self.on_fail_topic = Some(topic.into());
        self.on_fail_payload = Some(payload);
        self
    }
}

// =============================================================================
// Joins API
// =============================================================================

/// Producer-side join API over one store.
pub struct Joins<S: ?Sized> {
    store: Arc<S>,
}

impl<S: JoinStore + ?Sized> Joins<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a join id. Idempotent.
    pub async fn create(&self, join_id: Uuid) -> Result<(), ConveyorError> {
        Ok(self.store.create_join(join_id).await?)
    }

    /// Enqueue an outbox message as a member of the join.
    pub async fn enqueue_member(
        &self,
        join_id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<Uuid, ConveyorError> {
        crate::outbox::validate(&message)?;
        Ok(self.store.enqueue_member(join_id, message).await?)
    }

    /// Enqueue the wait message that will emit the join's completion.
    pub async fn enqueue_wait(&self, request: JoinWaitRequest) -> Result<Uuid, ConveyorError>
    where
        S: crate::store::OutboxStore,
    {
        if let Some(topic) = &request.on_complete_topic {
            if topic.trim().is_empty() {
                return Err(ConveyorError::validation(
                    "on_complete_topic must not be empty when provided",
                ));
            }
        }
        if let Some(topic) = &request.on_fail_topic {
            if topic.trim().is_empty() {
                return Err(ConveyorError::validation(
                    "on_fail_topic must not be empty when provided",
                ));
            }
        }
        let payload = serde_json::to_value(&request)
            .map_err(|e| ConveyorError::validation(format!("join payload: {e}")))?;
        Ok(self
            .store
            .enqueue(NewOutboxMessage::new(JOIN_WAIT_TOPIC, payload))
            .await?)
    }
}

// =============================================================================
// JoinWaitHandler
// =============================================================================

/// Outbox handler for [`JOIN_WAIT_TOPIC`].
///
/// Resolves the join store for the tenant the wait row was claimed from, so
/// one registration serves every store a poller visits.
pub struct JoinWaitHandler<Q: ?Sized> {
    provider: Arc<dyn StoreProvider<Q>>,
}

impl<Q: JoinStore + ?Sized> JoinWaitHandler<Q> {
    pub fn new(provider: Arc<dyn StoreProvider<Q>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<Q> Handler<OutboxRow> for JoinWaitHandler<Q>
where
    Q: JoinStore + ?Sized + 'static,
{
    async fn handle(
        &self,
        row: &OutboxRow,
        ctx: &DispatchContext,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let request: JoinWaitRequest = serde_json::from_value(row.payload.clone())
            .map_err(|e| HandlerError::permanent(anyhow::anyhow!("malformed join.wait payload: {e}")))?;

        let store = self
            .provider
            .store_for_key(ctx.store_id.as_str())
            .await
            .ok_or_else(|| {
                HandlerError::transient(anyhow::anyhow!(
                    "store {} not available for join check",
                    ctx.store_id
                ))
            })?;

        let progress = store
            .store
            .progress(request.join_id)
            .await?
            .ok_or_else(|| {
                HandlerError::permanent(anyhow::anyhow!("unknown join {}", request.join_id))
            })?;

        if !progress.is_settled() {
            debug!(
                join = %request.join_id,
                pending = progress.pending(),
                "join members still running"
            );
            return Err(HandlerError::JoinNotReady);
        }

        let (outcome, message) = if progress.failed > 0 && request.fail_if_any_step_failed {
            let message = request.on_fail_topic.as_ref().map(|topic| {
                NewOutboxMessage::new(
                    topic.clone(),
                    request
                        .on_fail_payload
                        .clone()
                        .unwrap_or(serde_json::Value::Null),
                )
            });
            (JoinOutcome::Failed, message)
        } else {
            // All succeeded - or some failed with fail-fast off, which still
            // counts as completion of the fan-out.
            let message = request.on_complete_topic.as_ref().map(|topic| {
                NewOutboxMessage::new(
                    topic.clone(),
                    request
                        .on_complete_payload
                        .clone()
                        .unwrap_or(serde_json::Value::Null),
                )
            });
            (JoinOutcome::Completed, message)
        };

        let settled = store
            .store
            .settle(request.join_id, outcome, &ctx.owner, row.id, message)
            .await?;
        if settled {
            info!(join = %request.join_id, outcome = ?outcome, done = progress.done, failed = progress.failed, "join settled");
        }
        Ok(())
    }
}
