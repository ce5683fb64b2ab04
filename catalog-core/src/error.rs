//! Error types for catalog operations

use crate::{
    ChangeId, ChangeStatus, DataType, EntityKind, ImportId, ImportStatus, OperationId,
    OperationStatus, Source,
};
use thiserror::Error;

/// Staged change lifecycle and review errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChangeError {
    #[error("Change {change_id} has unresolved conflicts on: {}", fields.join(", "))]
    UnresolvedConflict {
        change_id: ChangeId,
        fields: Vec<String>,
    },

    #[error("Invalid custom value for {field} on change {change_id}: expected {expected}, got {got}")]
    InvalidCustomValue {
        change_id: ChangeId,
        field: String,
        expected: DataType,
        got: String,
    },

    #[error("Invalid transition for change {change_id}: {from} -> {to}")]
    InvalidTransition {
        change_id: ChangeId,
        from: ChangeStatus,
        to: ChangeStatus,
    },

    #[error("Change {change_id} is {status}, only pending changes can be edited")]
    NotPending {
        change_id: ChangeId,
        status: ChangeStatus,
    },

    #[error("No conflict on field {field} for change {change_id}")]
    ConflictNotFound { change_id: ChangeId, field: String },

    #[error("Invalid resolution for {field}: {reason}")]
    InvalidResolution { field: String, reason: String },
}

/// Batch operation and import errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("Operation {existing} is already running for source {origin}")]
    OperationAlreadyRunning {
        origin: Source,
        existing: OperationId,
    },

    #[error("Invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Stage {stage} of operation {operation_id} cannot start: {reason}")]
    StageOutOfOrder {
        operation_id: OperationId,
        stage: String,
        reason: String,
    },

    #[error("Import {import_id} is not validated: {reason}")]
    NotValidated { import_id: ImportId, reason: String },

    #[error("Invalid transition for import {import_id}: {from} -> {to}")]
    ImportTransition {
        import_id: ImportId,
        from: ImportStatus,
        to: ImportStatus,
    },

    #[error("File of {size} bytes exceeds the {limit} byte import limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Operation {operation_id} does not allow {action}")]
    CapabilityDenied {
        operation_id: OperationId,
        action: String,
    },

    #[error("Unknown operation: {operation_id}")]
    UnknownOperation { operation_id: OperationId },

    #[error("No connector registered for source {origin}")]
    ConnectorNotRegistered { origin: Source },

    #[error("Invalid operation request: {reason}")]
    InvalidRequest { reason: String },
}

/// Errors reported by a Source Connector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Connector for {origin} unavailable: {reason}")]
    Unavailable { origin: Source, reason: String },

    #[error("Connector for {origin} rejected credentials: {reason}")]
    AuthRejected { origin: Source, reason: String },

    #[error("Rate limited by {origin}")]
    RateLimited {
        origin: Source,
        resume_cursor: Option<String>,
        retry_after_ms: Option<u64>,
    },

    #[error("Connector for {origin} rejected the request: {reason}")]
    Rejected { origin: Source, reason: String },
}

impl ConnectorError {
    /// Systemic faults fail the running stage and the whole operation. A
    /// refused push batch is instead recorded against each of its changes.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ConnectorError::Unavailable { .. } | ConnectorError::AuthRejected { .. }
        )
    }
}

/// Per-record ingestion errors. Never fatal to an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Malformed source record{}: {reason}", product_id.as_ref().map(|p| format!(" {}", p)).unwrap_or_default())]
    MalformedSourceRecord {
        product_id: Option<String>,
        reason: String,
    },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity:?} with id {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("Entity already exists: {entity:?} with id {id}")]
    AlreadyExists { entity: EntityKind, id: String },

    #[error("Version conflict on {entity:?} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: EntityKind,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Persistence failed: {reason}")]
    Persistence { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all catalog errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Change error: {0}")]
    Change(#[from] ChangeError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CatalogError {
    /// Whether this is a lost compare-and-set race.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CatalogError::Storage(StorageError::VersionConflict { .. }))
    }
}

/// Result type alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_unresolved_conflict_lists_fields() {
        let err = ChangeError::UnresolvedConflict {
            change_id: Uuid::nil(),
            fields: vec!["price".to_string(), "title".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("unresolved conflicts"));
        assert!(msg.contains("price, title"));
    }

    #[test]
    fn test_already_running_display() {
        let err = OperationError::OperationAlreadyRunning {
            origin: Source::VendorFeed,
            existing: Uuid::nil(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vendor-feed"));
        assert!(msg.contains("already running"));
    }

    #[test]
    fn test_connector_error_systemic() {
        let down = ConnectorError::Unavailable {
            origin: Source::Storefront,
            reason: "connection refused".to_string(),
        };
        let auth = ConnectorError::AuthRejected {
            origin: Source::Storefront,
            reason: "expired token".to_string(),
        };
        let throttled = ConnectorError::RateLimited {
            origin: Source::Storefront,
            resume_cursor: Some("page-9".to_string()),
            retry_after_ms: Some(1500),
        };
        assert!(down.is_systemic());
        assert!(auth.is_systemic());
        assert!(!throttled.is_systemic());
    }

    #[test]
    fn test_malformed_record_display() {
        let with_id = RecordError::MalformedSourceRecord {
            product_id: Some("X1".to_string()),
            reason: "price is negative".to_string(),
        };
        assert!(with_id.to_string().contains("X1"));

        let without_id = RecordError::MalformedSourceRecord {
            product_id: None,
            reason: "missing sku".to_string(),
        };
        assert_eq!(
            without_id.to_string(),
            "Malformed source record: missing sku"
        );
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "pull_page_size".to_string(),
            value: "0".to_string(),
            reason: "must be greater than 0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pull_page_size"));
        assert!(msg.contains("must be greater than 0"));
    }

    #[test]
    fn test_catalog_error_from_variants() {
        let storage = CatalogError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, CatalogError::Storage(_)));

        let conflict = CatalogError::from(StorageError::VersionConflict {
            entity: EntityKind::StagedChange,
            id: "abc".to_string(),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_version_conflict());
        assert!(!storage.is_version_conflict());

        let op = CatalogError::from(OperationError::UnknownOperation {
            operation_id: Uuid::nil(),
        });
        assert!(matches!(op, CatalogError::Operation(_)));
    }
}
