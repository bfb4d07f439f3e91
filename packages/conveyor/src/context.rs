//! Dispatch context carried on every handler call.
//!
//! Rather than ambient task-local state, the correlation scope is an explicit
//! value: handlers and observability collaborators receive everything they
//! need to attach records to the right tenant, worker, and message.

use uuid::Uuid;

use crate::row::{OwnerToken, StoreId};

/// The correlation scope of one row dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Correlation id from the row, when present.
    pub correlation_id: Option<Uuid>,
    /// The claiming worker's token.
    pub owner: OwnerToken,
    /// The tenant store the row was claimed from.
    pub store_id: StoreId,
    /// The row being dispatched.
    pub row_id: Uuid,
}

impl DispatchContext {
    pub fn new(
        correlation_id: Option<Uuid>,
        owner: OwnerToken,
        store_id: StoreId,
        row_id: Uuid,
    ) -> Self {
        Self {
            correlation_id,
            owner,
            store_id,
            row_id,
        }
    }
}
