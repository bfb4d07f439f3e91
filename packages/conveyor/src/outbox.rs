//! Outbox: durable enqueue-and-dispatch of application messages.
//!
//! Producers enqueue messages; the polling loop (see [`crate::dispatcher`])
//! claims batches and routes them through a [`HandlerRegistry`]. The
//! transactional variant - committing the message atomically with business
//! data - is a provider surface (`enqueue_outbox_in` on the PostgreSQL
//! store), since it needs the caller's live transaction.
//!
//! Delivery is at-least-once; handlers are required to be idempotent.

use std::sync::Arc;

use crate::error::ConveyorError;
use crate::row::NewOutboxMessage;
use crate::store::OutboxStore;

/// Producer-side API over one outbox store.
pub struct Outbox<S: ?Sized> {
    store: Arc<S>,
}

impl<S: OutboxStore + ?Sized> Outbox<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Enqueue a message for dispatch.
    ///
    /// Validates at the boundary: an empty topic never reaches storage.
    /// The store stamps `created_at` and defaults the message id.
    pub async fn enqueue(&self, message: NewOutboxMessage) -> Result<uuid::Uuid, ConveyorError> {
        validate(&message)?;
        Ok(self.store.enqueue(message).await?)
    }

    /// The underlying store, for claim/reap/revive administration.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

pub(crate) fn validate(message: &NewOutboxMessage) -> Result<(), ConveyorError> {
    if message.topic.trim().is_empty() {
        return Err(ConveyorError::validation("topic must not be empty"));
    }
    if let Some(id) = &message.message_id {
        if id.trim().is_empty() {
            return Err(ConveyorError::validation(
                "message_id must not be empty when provided",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_empty_topic() {
        let message = NewOutboxMessage::new("", json!({}));
        assert!(validate(&message).is_err());

        let message = NewOutboxMessage::new("   ", json!({}));
        assert!(validate(&message).is_err());
    }

    #[test]
    fn test_validate_rejects_blank_message_id() {
        let message = NewOutboxMessage::new("t", json!({})).with_message_id("");
        assert!(validate(&message).is_err());
    }

    #[test]
    fn test_validate_accepts_plain_message() {
        let message = NewOutboxMessage::new("t", json!({"p": 1}));
        assert!(validate(&message).is_ok());
    }
}
