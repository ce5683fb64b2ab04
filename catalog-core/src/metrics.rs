//! Aggregate sync metrics

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Read-only projection over the staging store and supervisor state.
///
/// Always computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SyncMetrics {
    /// Pending staged changes
    pub pending_changes: u64,
    /// Unresolved conflicts across pending changes
    pub conflicts: u64,
    /// Approved changes waiting for a push stage
    pub queue_size: u64,
    /// Operations pending, running or paused
    pub active_operations: u64,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub last_sync: Option<Timestamp>,
    /// Items per minute over operations completed in the trailing hour
    pub sync_rate: f64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub computed_at: Timestamp,
}
