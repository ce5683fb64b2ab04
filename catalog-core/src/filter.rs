//! Query filters for staged changes and batch operations
//!
//! Filters are plain data so the presentation layer can build them from
//! query strings; matching is done here so every store applies the same
//! semantics.

use crate::{
    BatchOperation, ChangeStatus, ChangeType, OperationStatus, OperationType, Source, StagedChange,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter for listing staged changes. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ChangeFilter {
    pub status: Option<ChangeStatus>,
    pub source: Option<Source>,
    pub change_type: Option<ChangeType>,
    /// Case-insensitive match on product id, field names and field values
    pub search: Option<String>,
    pub has_conflicts: Option<bool>,
}

impl ChangeFilter {
    /// Filter matching only pending changes.
    pub fn pending() -> Self {
        Self {
            status: Some(ChangeStatus::Pending),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn matches(&self, change: &StagedChange) -> bool {
        if self.status.is_some_and(|s| s != change.status) {
            return false;
        }
        if self.source.is_some_and(|s| s != change.source) {
            return false;
        }
        if self.change_type.is_some_and(|t| t != change.change_type) {
            return false;
        }
        if self
            .has_conflicts
            .is_some_and(|wanted| wanted != change.has_conflicts())
        {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => search_matches(change, &needle.to_lowercase()),
            _ => true,
        }
    }
}

fn search_matches(change: &StagedChange, needle: &str) -> bool {
    if change.product_id.to_lowercase().contains(needle) {
        return true;
    }
    change.fields.iter().any(|f| {
        f.field.to_lowercase().contains(needle)
            || value_text(&f.old_value).contains(needle)
            || value_text(&f.new_value).contains(needle)
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        Value::Null => String::new(),
        other => other.to_string().to_lowercase(),
    }
}

/// Filter for listing batch operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct OperationFilter {
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub source: Option<Source>,
}

impl OperationFilter {
    pub fn matches(&self, op: &BatchOperation) -> bool {
        self.operation_type.is_none_or(|t| t == op.operation_type)
            && self.status.is_none_or(|s| s == op.status)
            && self.source.is_none_or(|s| Some(s) == op.source)
    }
}
