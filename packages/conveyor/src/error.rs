//! Structured error types for the work-queue substrate.
//!
//! `ConveyorError` is the pattern-matchable surface returned by the public
//! APIs. `StoreError` wraps storage backends. `HandlerError` is what message
//! handlers return so the dispatcher can classify the row's fate:
//!
//! | handler result            | dispatcher action                    |
//! |---------------------------|--------------------------------------|
//! | `Ok(())`                  | ack (row is Done)                    |
//! | `HandlerError::Transient` | abandon with exponential backoff     |
//! | `HandlerError::Permanent` | fail (row is Failed / Dead)          |
//! | `HandlerError::JoinNotReady` | abandon with a short fixed delay  |
//!
//! Anything convertible to `anyhow::Error` classifies as transient; permanence
//! must be signalled explicitly.

use thiserror::Error;

// =============================================================================
// Store Error
// =============================================================================

/// Error from a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed (connection, timeout, serialization, constraint).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Wrap any error as a backend failure.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

// =============================================================================
// Conveyor Error
// =============================================================================

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Rejected at the API boundary before any row was written.
    #[error("validation error: {0}")]
    Validation(String),

    /// A cron expression failed to parse.
    #[error("invalid cron expression {expr:?}: {reason}")]
    Cron { expr: String, reason: String },

    /// A routed write named a store key the provider does not know.
    #[error("unknown store key: {0}")]
    UnknownStoreKey(String),

    /// An operation that requires a held lease observed it lost.
    #[error("lease {0:?} was lost")]
    LeaseLost(String),

    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConveyorError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        ConveyorError::Validation(msg.into())
    }
}

// =============================================================================
// Handler Error
// =============================================================================

/// Failure modes a message handler can report.
///
/// The blanket `From<anyhow::Error>` keeps handler bodies ergonomic: `?` on
/// any error yields a transient failure, and the row retries with backoff.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Possibly-temporary failure; the row is retried with backoff.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Permanent failure; the row is terminally failed (poisoned).
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The fan-in join still has non-terminal members; re-check shortly.
    #[error("join is not ready")]
    JoinNotReady,
}

impl HandlerError {
    /// Classify an error as transient.
    pub fn transient<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        HandlerError::Transient(err.into())
    }

    /// Classify an error as permanent.
    pub fn permanent<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        HandlerError::Permanent(err.into())
    }

    /// Is this a permanent (poison) failure?
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Transient(err)
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Transient(err.into())
    }
}
