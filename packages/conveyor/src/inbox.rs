//! Inbox: deduplicating, retriable inbound-message handling.
//!
//! Two surfaces over the same rows:
//!
//! 1. **Edge dedupe** - [`Inbox::already_processed`] is an atomic upsert at
//!    the transport boundary. The first observer of a key inserts a Seen row
//!    and gets `false`; once the message is marked Done every later observer
//!    gets `true` and skips its work.
//! 2. **Queued pipeline** - [`Inbox::enqueue`] makes the row dispatchable and
//!    the inbox poller drives it through a handler registry with the shared
//!    work-queue protocol. Exceeding the attempt budget moves the row to
//!    Dead.
//!
//! The dedupe key is `(source, message_id, hash)` with an absent hash
//! normalized to the empty string: the same `(source, message_id)` arriving
//! with a different payload hash is a *distinct logical message*.
//!
//! The inbox guarantees at most one *acknowledged* processing per key;
//! a worker crashing mid-handler yields another attempt, so handlers must be
//! idempotent.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::ConveyorError;
use crate::row::{InboxKey, InboxStatus, NewInboxMessage, Observation};
use crate::store::InboxStore;

/// Edge API over one inbox store.
pub struct Inbox<S: ?Sized> {
    store: Arc<S>,
}

impl<S: InboxStore + ?Sized> Inbox<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Record an observation of `(source, message_id[, hash])` and report
    /// whether the message was already fully processed.
    ///
    /// Exactly one concurrent caller per key observes the insert; everyone
    /// bumps `attempt` and `last_seen_at`. Returns `true` only when the row
    /// has reached Done.
    pub async fn already_processed(
        &self,
        source: &str,
        message_id: &str,
        hash: Option<&str>,
    ) -> Result<bool, ConveyorError> {
        let key = build_key(source, message_id, hash)?;
        let observation = self.store.observe(&key).await?;
        Ok(!observation.first_seen && observation.status == InboxStatus::Done)
    }

    /// Record an observation and return its full projection (row id, first
    /// sighting, status, attempt).
    pub async fn observe(
        &self,
        source: &str,
        message_id: &str,
        hash: Option<&str>,
    ) -> Result<Observation, ConveyorError> {
        let key = build_key(source, message_id, hash)?;
        Ok(self.store.observe(&key).await?)
    }

    /// Enqueue an inbound message for the queued pipeline. Deduped like
    /// `already_processed`; re-enqueueing an existing key bumps observation
    /// counters without resetting processing state.
    pub async fn enqueue(&self, message: NewInboxMessage) -> Result<Observation, ConveyorError> {
        if message.topic.trim().is_empty() {
            return Err(ConveyorError::validation("topic must not be empty"));
        }
        validate_key(&message.key)?;
        Ok(self.store.enqueue(message).await?)
    }

    /// `Seen → Processing` (bumps attempt).
    pub async fn mark_processing(&self, id: Uuid) -> Result<bool, ConveyorError> {
        Ok(self.store.mark_processing(id).await?)
    }

    /// `{Seen, Processing} → Done`.
    pub async fn mark_processed(&self, id: Uuid) -> Result<bool, ConveyorError> {
        Ok(self.store.mark_processed(id).await?)
    }

    /// `{Seen, Processing} → Dead`.
    pub async fn mark_dead(&self, id: Uuid) -> Result<bool, ConveyorError> {
        Ok(self.store.mark_dead(id).await?)
    }

    /// The underlying store, for claim/reap/revive administration.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

fn build_key(
    source: &str,
    message_id: &str,
    hash: Option<&str>,
) -> Result<InboxKey, ConveyorError> {
    let mut key = InboxKey::new(source, message_id);
    if let Some(hash) = hash {
        key = key.with_hash(hash);
    }
    validate_key(&key)?;
    Ok(key)
}

fn validate_key(key: &InboxKey) -> Result<(), ConveyorError> {
    if key.source.trim().is_empty() {
        return Err(ConveyorError::validation("source must not be empty"));
    }
    if key.message_id.trim().is_empty() {
        return Err(ConveyorError::validation("message_id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key_normalizes_missing_hash() {
        let key = build_key("src", "m1", None).unwrap();
        assert_eq!(key.hash, "");

        let key = build_key("src", "m1", Some("deadbeef")).unwrap();
        assert_eq!(key.hash, "deadbeef");
    }

    #[test]
    fn test_build_key_rejects_blank_parts() {
        assert!(build_key("", "m1", None).is_err());
        assert!(build_key("src", " ", None).is_err());
    }
}
