//! Catalog Core - Entity Types
//!
//! Pure data structures shared by every other crate in the workspace:
//! staged changes and their conflicts, batch operations and stages, import
//! jobs, the canonical product snapshot, the error taxonomy, configuration,
//! and the Source Connector contract.
//!
//! State machines live on the entities themselves (`StagedChange::approve`,
//! `BatchOperation::mark_paused`, ...) so that every caller enforces the same
//! transitions regardless of which storage backend holds the records.

pub mod catalog;
pub mod change;
pub mod config;
pub mod connector;
pub mod enums;
pub mod error;
pub mod filter;
pub mod import;
pub mod metrics;
pub mod operation;

pub use catalog::{FieldStamp, ProductSnapshot, SourceRecord, INTEGER_FIELDS, NUMERIC_FIELDS};
pub use change::{ChangeConflict, FieldChange, StagedChange};
pub use config::CatalogConfig;
pub use connector::{FetchPage, PushOutcome, PushRejection, SourceConnector};
pub use enums::{
    ChangeStatus, ChangeType, ConflictResolution, DataType, EntityKind, Impact, ImportStatus,
    OperationStatus, OperationType, PauseReason, Source, StageStatus,
};
pub use error::{
    CatalogError, CatalogResult, ChangeError, ConfigError, ConnectorError, OperationError,
    RecordError, StorageError,
};
pub use filter::{ChangeFilter, OperationFilter};
pub use import::{ImportJob, ImportValidation};
pub use metrics::SyncMetrics;
pub use operation::{BatchOperation, BatchStage, ItemFailure};

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Identifier of a staged change.
pub type ChangeId = EntityId;

/// Identifier of a batch operation.
pub type OperationId = EntityId;

/// Identifier of an import job.
pub type ImportId = EntityId;

/// Products are keyed by their catalog SKU / product id string.
pub type ProductId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}
