//! Enum types for catalog entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its database string representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

/// Implements `as_db_str`, `from_db_str`, `Display` and `FromStr` for a
/// fieldless enum from a single variant/string table.
macro_rules! db_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// All variants in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Convert to database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }

            /// Parse from database string representation (case-insensitive).
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                let lowered = s.trim().to_lowercase();
                $(if lowered == $s { return Ok($ty::$variant); })+
                Err(EnumParseError { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_db_str())
            }
        }

        impl FromStr for $ty {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// SOURCES
// ============================================================================

/// External (or internal) system a staged change originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Commerce storefront
    Storefront,
    /// Periodic vendor data-feed drop
    VendorFeed,
    /// Second-party inventory/pricing authority
    InventoryAuthority,
    /// Changes authored inside the catalog itself
    Internal,
}

db_enum!(Source, "source", {
    Storefront => "storefront",
    VendorFeed => "vendor-feed",
    InventoryAuthority => "inventory-authority",
    Internal => "internal",
});

// ============================================================================
// STAGED CHANGE ENUMS
// ============================================================================

/// Kind of mutation a staged change proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Price,
    Inventory,
    Metadata,
}

db_enum!(ChangeType, "change type", {
    Create => "create",
    Update => "update",
    Delete => "delete",
    Price => "price",
    Inventory => "inventory",
    Metadata => "metadata",
});

/// Review status of a staged change. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
}

db_enum!(ChangeStatus, "change status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

impl ChangeStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeStatus::Approved | ChangeStatus::Rejected)
    }
}

/// JSON shape of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

db_enum!(DataType, "data type", {
    String => "string",
    Number => "number",
    Boolean => "boolean",
    Array => "array",
    Object => "object",
});

impl DataType {
    /// Data type of a JSON value. `null` has no type of its own.
    pub fn of(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(_) => Some(DataType::Boolean),
            serde_json::Value::Number(_) => Some(DataType::Number),
            serde_json::Value::String(_) => Some(DataType::String),
            serde_json::Value::Array(_) => Some(DataType::Array),
            serde_json::Value::Object(_) => Some(DataType::Object),
        }
    }

    /// Infer the type of a field from its new value, falling back to the old one.
    pub fn infer(old_value: &serde_json::Value, new_value: &serde_json::Value) -> Self {
        Self::of(new_value)
            .or_else(|| Self::of(old_value))
            .unwrap_or(DataType::String)
    }
}

/// Impact of a field change. Used only for sorting and highlighting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    #[default]
    Low,
    Medium,
    High,
}

db_enum!(Impact, "impact", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

impl Impact {
    /// Default impact of a change to the named product field.
    pub fn for_field(field: &str) -> Self {
        match field {
            "price" | "compare_at_price" | "cost" | "inventory" | "quantity" | "status" => {
                Impact::High
            }
            "title" | "name" | "sku" | "barcode" | "vendor" => Impact::Medium,
            _ => Impact::Low,
        }
    }
}

/// How a conflict on a single field is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the locally edited canonical value
    Local,
    /// Take the incoming remote value
    Remote,
    /// Take the value already staged by an earlier pending change
    Staged,
    /// Use a reviewer-supplied value
    Custom,
}

db_enum!(ConflictResolution, "conflict resolution", {
    Local => "local",
    Remote => "remote",
    Staged => "staged",
    Custom => "custom",
});

// ============================================================================
// BATCH OPERATION ENUMS
// ============================================================================

/// Kind of long-running batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sync,
    Update,
    Delete,
    Import,
}

db_enum!(OperationType, "operation type", {
    Sync => "sync",
    Update => "update",
    Delete => "delete",
    Import => "import",
});

impl OperationType {
    /// Declared stage names, in execution order.
    pub fn stage_plan(&self) -> &'static [&'static str] {
        match self {
            OperationType::Sync => &["pull", "push"],
            OperationType::Update | OperationType::Delete => &["push"],
            OperationType::Import => &["upload", "validate", "execute"],
        }
    }

    /// `(can_pause, can_cancel)` capability flags for this operation type.
    pub fn capabilities(&self) -> (bool, bool) {
        match self {
            OperationType::Import => (false, true),
            _ => (true, true),
        }
    }
}

/// Lifecycle status of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Idle,
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

db_enum!(OperationStatus, "operation status", {
    Idle => "idle",
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl OperationStatus {
    /// Terminal states are final: a new operation must be started to retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Whether an operation in this state still holds its source.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::Running | OperationStatus::Paused
        )
    }
}

/// Status of a single stage of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Error,
    Paused,
}

db_enum!(StageStatus, "stage status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Error => "error",
    Paused => "paused",
});

/// Why an operation is paused, so the resume action is informed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    /// The upstream source throttled us
    RateLimited {
        /// Suggested wait before resuming, when the source provided one
        retry_after_ms: Option<u64>,
    },
    /// A caller asked for the pause
    Manual,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::RateLimited {
                retry_after_ms: Some(ms),
            } => write!(f, "rate limited (retry after {}ms)", ms),
            PauseReason::RateLimited { retry_after_ms: None } => f.write_str("rate limited"),
            PauseReason::Manual => f.write_str("manual"),
        }
    }
}

// ============================================================================
// IMPORT ENUMS
// ============================================================================

/// Status of a file import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Queued,
    Downloading,
    Processing,
    Completed,
    Failed,
}

db_enum!(ImportStatus, "import status", {
    Queued => "queued",
    Downloading => "downloading",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl ImportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }
}

// ============================================================================
// ENTITY KIND
// ============================================================================

/// Entity type discriminator used in storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    StagedChange,
    BatchOperation,
    ImportJob,
    ProductSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_roundtrip() {
        for source in Source::ALL {
            let parsed = Source::from_db_str(source.as_db_str()).unwrap();
            assert_eq!(*source, parsed);
        }
        assert_eq!("Vendor-Feed".parse::<Source>().unwrap(), Source::VendorFeed);
    }

    #[test]
    fn test_source_serde_matches_db_str() {
        let json = serde_json::to_string(&Source::InventoryAuthority).unwrap();
        assert_eq!(json, "\"inventory-authority\"");
    }

    #[test]
    fn test_resolution_rejects_unknown() {
        let err = ConflictResolution::from_db_str("newest").unwrap_err();
        assert_eq!(err.kind, "conflict resolution");
        assert!(err.to_string().contains("newest"));
    }

    #[test]
    fn test_operation_status_terminal_and_active_are_disjoint() {
        for status in OperationStatus::ALL {
            assert!(!(status.is_terminal() && status.is_active()));
        }
        assert!(!OperationStatus::Idle.is_active());
        assert!(OperationStatus::Paused.is_active());
    }

    #[test]
    fn test_data_type_inference() {
        assert_eq!(DataType::of(&json!(1.5)), Some(DataType::Number));
        assert_eq!(DataType::of(&json!(null)), None);
        assert_eq!(DataType::infer(&json!("a"), &json!(null)), DataType::String);
        assert_eq!(DataType::infer(&json!(null), &json!([1])), DataType::Array);
    }

    #[test]
    fn test_impact_ordering() {
        assert!(Impact::High > Impact::Medium);
        assert!(Impact::Medium > Impact::Low);
        assert_eq!(Impact::for_field("price"), Impact::High);
        assert_eq!(Impact::for_field("description"), Impact::Low);
    }

    #[test]
    fn test_import_is_cancel_only() {
        assert_eq!(OperationType::Import.capabilities(), (false, true));
        assert_eq!(OperationType::Sync.stage_plan(), &["pull", "push"]);
    }
}
