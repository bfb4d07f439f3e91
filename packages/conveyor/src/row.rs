//! Persisted row models shared by every primitive.
//!
//! All four work queues (outbox, inbox, timers, job runs) carry the same
//! claim/lease columns; the [`WorkItem`] trait exposes the fields the
//! dispatcher needs without caring which variant it is polling.
//!
//! Statuses are stored as lowercase snake-case text so providers stay free of
//! database-side enum types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle of an outbox, timer, or job-run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Eligible for claiming once due.
    #[default]
    Ready,
    /// Claimed by a worker; `owner_token` and `locked_until` are set.
    InProgress,
    /// Successfully processed; terminal.
    Done,
    /// Terminally failed (poisoned); recoverable only via `revive`.
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Ready => "ready",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Done => "done",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(WorkStatus::Ready),
            "in_progress" => Some(WorkStatus::InProgress),
            "done" => Some(WorkStatus::Done),
            "failed" => Some(WorkStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never re-dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Done | WorkStatus::Failed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an inbox row: `Seen → Processing → {Done, Dead}`.
///
/// Seen may be re-observed any number of times without a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    #[default]
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Seen => "seen",
            InboxStatus::Processing => "processing",
            InboxStatus::Done => "done",
            InboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seen" => Some(InboxStatus::Seen),
            "processing" => Some(InboxStatus::Processing),
            "done" => Some(InboxStatus::Done),
            "dead" => Some(InboxStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InboxStatus::Done | InboxStatus::Dead)
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Opaque worker identity recorded on a claim.
///
/// Only the holder of the matching token may ack, abandon, or fail a row;
/// everyone else's writes are silently skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Mint a fresh token, prefixed for log readability.
    pub fn mint(prefix: &str) -> Self {
        OwnerToken(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerToken {
    fn from(s: String) -> Self {
        OwnerToken(s)
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable tag identifying one tenant store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        StoreId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        StoreId(s.to_string())
    }
}

impl From<String> for StoreId {
    fn from(s: String) -> Self {
        StoreId(s)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// WorkItem
// =============================================================================

/// The dispatcher's view of a claimed row, independent of primitive.
pub trait WorkItem: Clone + Send + Sync + 'static {
    /// Row identity.
    fn id(&self) -> Uuid;

    /// Topic used for handler resolution and logging.
    fn topic(&self) -> &str;

    /// How many times processing has been attempted (or observed, for the
    /// inbox). Monotonically non-decreasing for the lifetime of the row.
    fn attempt(&self) -> i32;

    /// Correlation id for the dispatch span, when the row carries one.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// A persisted outbox message.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Client-stable message id; defaults to the row id when not supplied.
    pub message_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Earliest eligible dispatch time, when deferred.
    pub due_at: Option<DateTime<Utc>>,
    pub status: WorkStatus,
    pub owner_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

impl WorkItem for OutboxRow {
    fn id(&self) -> Uuid {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn attempt(&self) -> i32 {
        self.retry_count
    }

    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
}

/// A new outbox message to enqueue.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub message_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub due_at: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            message_id: None,
            correlation_id: None,
            due_at: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

// =============================================================================
// Inbox
// =============================================================================

/// A persisted inbound message, deduplicated by [`InboxKey`].
#[derive(Debug, Clone)]
pub struct InboxRow {
    /// Surrogate id; the dedupe identity is `(source, message_id, hash)`.
    pub id: Uuid,
    pub source: String,
    pub message_id: String,
    /// Payload hash; empty when the producer supplied none. A differing hash
    /// for the same `(source, message_id)` is a distinct logical message.
    pub hash: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub due_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub status: InboxStatus,
    /// Only queued rows are eligible for the inbox dispatcher; rows created
    /// by edge dedupe alone stay unqueued.
    pub queued: bool,
    pub owner_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WorkItem for InboxRow {
    fn id(&self) -> Uuid {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn attempt(&self) -> i32 {
        self.attempt
    }
}

/// Dedupe identity of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboxKey {
    pub source: String,
    pub message_id: String,
    /// Normalized hash; `None` becomes the empty string.
    pub hash: String,
}

impl InboxKey {
    pub fn new(source: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message_id: message_id.into(),
            hash: String::new(),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}

/// Result of the atomic dedupe upsert.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: Uuid,
    /// True exactly once per key: for the insert that won the race.
    pub first_seen: bool,
    pub status: InboxStatus,
    pub attempt: i32,
}

/// A new inbound message for the queued inbox pipeline.
#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub key: InboxKey,
    pub topic: String,
    pub payload: serde_json::Value,
    pub due_at: Option<DateTime<Utc>>,
}

impl NewInboxMessage {
    pub fn new(key: InboxKey, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key,
            topic: topic.into(),
            payload,
            due_at: None,
        }
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// A one-shot durable timer.
#[derive(Debug, Clone)]
pub struct TimerRow {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: WorkStatus,
    pub owner_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

impl WorkItem for TimerRow {
    fn id(&self) -> Uuid {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn attempt(&self) -> i32 {
        self.retry_count
    }

    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
}

/// A new one-shot timer.
#[derive(Debug, Clone)]
pub struct NewTimer {
    pub topic: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub due_at: DateTime<Utc>,
}

impl NewTimer {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, due_at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            correlation_id: None,
            due_at,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A recurring cron job definition.
#[derive(Debug, Clone)]
pub struct JobRow {
    /// Unique job name.
    pub name: String,
    pub topic: String,
    pub cron: String,
    pub payload: Option<serde_json::Value>,
    pub enabled: bool,
    /// When true, missed fires collapse to the latest one instead of
    /// catching up.
    pub coalesce: bool,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert shape for [`JobRow`].
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub topic: String,
    pub cron: String,
    pub payload: Option<serde_json::Value>,
    pub coalesce: bool,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, topic: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            cron: cron.into(),
            payload: None,
            coalesce: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }
}

/// One scheduled execution of a job.
#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub id: Uuid,
    pub job_name: String,
    pub topic: String,
    pub payload: serde_json::Value,
    /// The cron fire time this run represents (drift-free, derived from the
    /// schedule rather than the tick that noticed it).
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: WorkStatus,
    pub owner_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

impl WorkItem for JobRunRow {
    fn id(&self) -> Uuid {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn attempt(&self) -> i32 {
        self.retry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_status_round_trip() {
        for status in [
            WorkStatus::Ready,
            WorkStatus::InProgress,
            WorkStatus::Done,
            WorkStatus::Failed,
        ] {
            assert_eq!(WorkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkStatus::parse("nope"), None);
    }

    #[test]
    fn test_inbox_status_round_trip() {
        for status in [
            InboxStatus::Seen,
            InboxStatus::Processing,
            InboxStatus::Done,
            InboxStatus::Dead,
        ] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InboxStatus::parse(""), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkStatus::Done.is_terminal());
        assert!(WorkStatus::Failed.is_terminal());
        assert!(!WorkStatus::Ready.is_terminal());
        assert!(!WorkStatus::InProgress.is_terminal());

        assert!(InboxStatus::Done.is_terminal());
        assert!(InboxStatus::Dead.is_terminal());
        assert!(!InboxStatus::Seen.is_terminal());
        assert!(!InboxStatus::Processing.is_terminal());
    }

    #[test]
    fn test_owner_token_mint_is_unique() {
        let a = OwnerToken::mint("worker");
        let b = OwnerToken::mint("worker");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-"));
    }

    #[test]
    fn test_inbox_key_hash_normalization() {
        let bare = InboxKey::new("src", "m1");
        assert_eq!(bare.hash, "");

        let hashed = InboxKey::new("src", "m1").with_hash("abc123");
        assert_ne!(bare, hashed);
    }

    #[test]
    fn test_new_outbox_message_builders() {
        let msg = NewOutboxMessage::new("billing.invoice", serde_json::json!({"n": 1}))
            .with_message_id("inv-1")
            .with_correlation_id(Uuid::nil());
        assert_eq!(msg.topic, "billing.invoice");
        assert_eq!(msg.message_id.as_deref(), Some("inv-1"));
        assert_eq!(msg.correlation_id, Some(Uuid::nil()));
        assert!(msg.due_at.is_none());
    }
}
