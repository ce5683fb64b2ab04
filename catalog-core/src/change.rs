//! Staged changes, field changes and conflicts

use crate::{
    new_entity_id, ChangeError, ChangeId, ChangeStatus, ChangeType, ConflictResolution, DataType,
    Impact, OperationId, ProductId, Source, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// FIELD CHANGE
// ============================================================================

/// One field's before/after value inside a staged change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FieldChange {
    pub field: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub old_value: Value,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub new_value: Value,
    pub data_type: DataType,
    pub impact: Impact,
    /// Set when a later change from another source replaced this value.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub superseded_by: Option<ChangeId>,
}

impl FieldChange {
    /// Build a field change, inferring data type and impact from the field.
    pub fn new(field: impl Into<String>, old_value: Value, new_value: Value) -> Self {
        let field = field.into();
        let data_type = DataType::infer(&old_value, &new_value);
        let impact = Impact::for_field(&field);
        Self {
            field,
            old_value,
            new_value,
            data_type,
            impact,
            superseded_by: None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

// ============================================================================
// CHANGE CONFLICT
// ============================================================================

/// A field where the local canonical value and the incoming remote value
/// diverged independently since the last successful sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ChangeConflict {
    pub field: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub local_value: Value,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub remote_value: Value,
    /// Value proposed by another pending change for the same field, if any.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub staged_value: Option<Value>,
    pub data_type: DataType,
    pub resolution: Option<ConflictResolution>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub custom_value: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub detected_at: Timestamp,
}

impl ChangeConflict {
    pub fn new(
        field: impl Into<String>,
        local_value: Value,
        remote_value: Value,
        staged_value: Option<Value>,
        detected_at: Timestamp,
    ) -> Self {
        let data_type = DataType::infer(&local_value, &remote_value);
        Self {
            field: field.into(),
            local_value,
            remote_value,
            staged_value,
            data_type,
            resolution: None,
            custom_value: None,
            detected_at,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// The value this conflict settles on, once a resolution is chosen.
    pub fn resolved_value(&self) -> Option<Value> {
        match self.resolution? {
            ConflictResolution::Local => Some(self.local_value.clone()),
            ConflictResolution::Remote => Some(self.remote_value.clone()),
            ConflictResolution::Staged => self.staged_value.clone(),
            ConflictResolution::Custom => self.custom_value.clone(),
        }
    }
}

// ============================================================================
// STAGED CHANGE
// ============================================================================

/// A proposed mutation to one product, from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StagedChange {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub change_id: ChangeId,
    pub source: Source,
    pub product_id: ProductId,
    pub change_type: ChangeType,
    pub fields: Vec<FieldChange>,
    pub status: ChangeStatus,
    pub priority: Impact,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub staged_at: Timestamp,
    pub staged_by: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    pub conflicts: Vec<ChangeConflict>,
    /// Compare-and-set token, bumped by the store on every write.
    pub version: u64,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub reviewed_at: Option<Timestamp>,
    pub reviewed_by: Option<String>,
    /// Operation that staged or last merged into this change.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub operation_id: Option<OperationId>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub pushed_at: Option<Timestamp>,
    pub push_error: Option<String>,
}

impl StagedChange {
    /// Create a pending change. Priority is derived from the fields.
    pub fn new(
        source: Source,
        product_id: impl Into<ProductId>,
        change_type: ChangeType,
        fields: Vec<FieldChange>,
        staged_by: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        let mut change = Self {
            change_id: new_entity_id(),
            source,
            product_id: product_id.into(),
            change_type,
            fields,
            status: ChangeStatus::Pending,
            priority: Impact::Low,
            staged_at: now,
            staged_by: staged_by.into(),
            updated_at: now,
            conflicts: Vec::new(),
            version: 0,
            reviewed_at: None,
            reviewed_by: None,
            operation_id: None,
            pushed_at: None,
            push_error: None,
        };
        change.refresh_priority();
        change
    }

    /// Recompute priority as the highest impact among live field changes.
    pub fn refresh_priority(&mut self) {
        self.priority = self
            .fields
            .iter()
            .filter(|f| !f.is_superseded())
            .map(|f| f.impact)
            .max()
            .unwrap_or(Impact::Low);
    }

    pub fn field(&self, name: &str) -> Option<&FieldChange> {
        self.fields.iter().find(|f| f.field == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldChange> {
        self.fields.iter_mut().find(|f| f.field == name)
    }

    pub fn conflict(&self, field: &str) -> Option<&ChangeConflict> {
        self.conflicts.iter().find(|c| c.field == field)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Fields whose conflict still lacks a resolution.
    pub fn unresolved_fields(&self) -> Vec<String> {
        self.conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .map(|c| c.field.clone())
            .collect()
    }

    /// Whether the change is waiting on the push stage.
    pub fn is_awaiting_push(&self) -> bool {
        self.status == ChangeStatus::Approved && self.pushed_at.is_none() && self.push_error.is_none()
    }

    /// Set or overwrite the resolution for one conflicting field.
    ///
    /// Other conflicts on the same change are left untouched. `custom`
    /// requires a value of the field's data type; `staged` requires that a
    /// staged value exists.
    pub fn resolve_conflict(
        &mut self,
        field: &str,
        resolution: ConflictResolution,
        custom_value: Option<Value>,
        now: Timestamp,
    ) -> Result<(), ChangeError> {
        if self.status != ChangeStatus::Pending {
            return Err(ChangeError::NotPending {
                change_id: self.change_id,
                status: self.status,
            });
        }
        let change_id = self.change_id;
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.field == field)
            .ok_or_else(|| ChangeError::ConflictNotFound {
                change_id,
                field: field.to_string(),
            })?;

        match resolution {
            ConflictResolution::Custom => {
                let value = custom_value.unwrap_or(Value::Null);
                if DataType::of(&value) != Some(conflict.data_type) {
                    return Err(ChangeError::InvalidCustomValue {
                        change_id,
                        field: field.to_string(),
                        expected: conflict.data_type,
                        got: DataType::of(&value)
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "null".to_string()),
                    });
                }
                conflict.custom_value = Some(value);
            }
            ConflictResolution::Staged => {
                if conflict.staged_value.is_none() {
                    return Err(ChangeError::InvalidResolution {
                        field: field.to_string(),
                        reason: "no staged value exists for this field".to_string(),
                    });
                }
                conflict.custom_value = None;
            }
            ConflictResolution::Local | ConflictResolution::Remote => {
                conflict.custom_value = None;
            }
        }

        conflict.resolution = Some(resolution);
        self.updated_at = now;
        Ok(())
    }

    /// Values this change will write: live field changes, with any conflict
    /// resolution overriding the field's `new_value`.
    pub fn resolved_fields(&self) -> Vec<(String, Value)> {
        self.fields
            .iter()
            .filter(|f| !f.is_superseded())
            .map(|f| {
                let value = self
                    .conflict(&f.field)
                    .and_then(ChangeConflict::resolved_value)
                    .unwrap_or_else(|| f.new_value.clone());
                (f.field.clone(), value)
            })
            .collect()
    }

    /// Transition `pending -> approved`.
    ///
    /// Fails with `UnresolvedConflict` if any conflict lacks a resolution.
    /// Resolved values are folded into the field changes and the conflicts
    /// are cleared.
    pub fn approve(&mut self, reviewer: &str, now: Timestamp) -> Result<(), ChangeError> {
        if self.status != ChangeStatus::Pending {
            return Err(ChangeError::InvalidTransition {
                change_id: self.change_id,
                from: self.status,
                to: ChangeStatus::Approved,
            });
        }
        let unresolved = self.unresolved_fields();
        if !unresolved.is_empty() {
            return Err(ChangeError::UnresolvedConflict {
                change_id: self.change_id,
                fields: unresolved,
            });
        }

        for (field, value) in self.resolved_fields() {
            if let Some(fc) = self.field_mut(&field) {
                fc.new_value = value;
            }
        }
        self.conflicts.clear();
        self.status = ChangeStatus::Approved;
        self.reviewed_at = Some(now);
        self.reviewed_by = Some(reviewer.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Transition `pending -> rejected`.
    pub fn reject(&mut self, reviewer: &str, now: Timestamp) -> Result<(), ChangeError> {
        if self.status != ChangeStatus::Pending {
            return Err(ChangeError::InvalidTransition {
                change_id: self.change_id,
                from: self.status,
                to: ChangeStatus::Rejected,
            });
        }
        self.status = ChangeStatus::Rejected;
        self.reviewed_at = Some(now);
        self.reviewed_by = Some(reviewer.to_string());
        self.updated_at = now;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    fn change_with_conflict(field: &str, local: Value, remote: Value) -> StagedChange {
        let now = Utc::now();
        let mut change = StagedChange::new(
            Source::VendorFeed,
            "X1",
            ChangeType::Price,
            vec![FieldChange::new(field, local.clone(), remote.clone())],
            "sync",
            now,
        );
        change
            .conflicts
            .push(ChangeConflict::new(field, local, remote, None, now));
        change
    }

    #[test]
    fn test_priority_is_max_live_impact() {
        let mut change = StagedChange::new(
            Source::Storefront,
            "X1",
            ChangeType::Update,
            vec![
                FieldChange::new("description", json!("a"), json!("b")),
                FieldChange::new("price", json!(1.0), json!(2.0)),
            ],
            "sync",
            Utc::now(),
        );
        assert_eq!(change.priority, Impact::High);

        change.fields[1].superseded_by = Some(new_entity_id());
        change.refresh_priority();
        assert_eq!(change.priority, Impact::Low);
    }

    #[test]
    fn test_approve_blocked_until_resolved() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        let err = change.approve("reviewer", Utc::now()).unwrap_err();
        assert!(matches!(err, ChangeError::UnresolvedConflict { .. }));
        assert_eq!(change.status, ChangeStatus::Pending);

        change
            .resolve_conflict("price", ConflictResolution::Remote, None, Utc::now())
            .unwrap();
        change.approve("reviewer", Utc::now()).unwrap();
        assert_eq!(change.status, ChangeStatus::Approved);
        assert!(change.conflicts.is_empty());
        assert_eq!(change.fields[0].new_value, json!(12.0));
    }

    #[test]
    fn test_local_resolution_overrides_new_value() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        change
            .resolve_conflict("price", ConflictResolution::Local, None, Utc::now())
            .unwrap();
        assert_eq!(
            change.resolved_fields(),
            vec![("price".to_string(), json!(10.0))]
        );
        change.approve("reviewer", Utc::now()).unwrap();
        assert_eq!(change.fields[0].new_value, json!(10.0));
    }

    #[test]
    fn test_custom_requires_matching_type() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        let err = change
            .resolve_conflict(
                "price",
                ConflictResolution::Custom,
                Some(json!("eleven")),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidCustomValue { .. }));

        let err = change
            .resolve_conflict("price", ConflictResolution::Custom, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidCustomValue { .. }));
        assert!(change.conflicts[0].resolution.is_none());

        change
            .resolve_conflict(
                "price",
                ConflictResolution::Custom,
                Some(json!(11.0)),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(change.conflicts[0].resolved_value(), Some(json!(11.0)));
    }

    #[test]
    fn test_resolution_is_idempotent_overwrite() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        change
            .resolve_conflict("price", ConflictResolution::Custom, Some(json!(11.0)), Utc::now())
            .unwrap();
        change
            .resolve_conflict("price", ConflictResolution::Remote, None, Utc::now())
            .unwrap();
        let conflict = &change.conflicts[0];
        assert_eq!(conflict.resolution, Some(ConflictResolution::Remote));
        assert_eq!(conflict.custom_value, None);
    }

    #[test]
    fn test_resolving_one_field_leaves_others() {
        let now = Utc::now();
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        change
            .fields
            .push(FieldChange::new("title", json!("A"), json!("B")));
        change
            .conflicts
            .push(ChangeConflict::new("title", json!("A"), json!("B"), None, now));

        change
            .resolve_conflict("price", ConflictResolution::Remote, None, now)
            .unwrap();
        assert!(change.conflicts[1].resolution.is_none());
        assert_eq!(change.unresolved_fields(), vec!["title".to_string()]);
    }

    #[test]
    fn test_staged_resolution_requires_staged_value() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        let err = change
            .resolve_conflict("price", ConflictResolution::Staged, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidResolution { .. }));

        change.conflicts[0].staged_value = Some(json!(9.5));
        change
            .resolve_conflict("price", ConflictResolution::Staged, None, Utc::now())
            .unwrap();
        assert_eq!(change.resolved_fields()[0].1, json!(9.5));
    }

    #[test]
    fn test_unknown_conflict_field() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        let err = change
            .resolve_conflict("title", ConflictResolution::Remote, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChangeError::ConflictNotFound { .. }));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut change = change_with_conflict("price", json!(10.0), json!(12.0));
        change.reject("reviewer", Utc::now()).unwrap();
        assert!(change.status.is_terminal());
        assert!(matches!(
            change.approve("reviewer", Utc::now()),
            Err(ChangeError::InvalidTransition { .. })
        ));
        assert!(matches!(
            change.reject("reviewer", Utc::now()),
            Err(ChangeError::InvalidTransition { .. })
        ));
        assert!(matches!(
            change.resolve_conflict("price", ConflictResolution::Remote, None, Utc::now()),
            Err(ChangeError::NotPending { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Approval succeeds exactly when every conflict has a resolution.
        #[test]
        fn prop_approve_requires_all_resolved(resolved in proptest::collection::vec(any::<bool>(), 0..8)) {
            let now = Utc::now();
            let mut change = StagedChange::new(
                Source::InventoryAuthority,
                "P",
                ChangeType::Update,
                Vec::new(),
                "sync",
                now,
            );
            for (i, _) in resolved.iter().enumerate() {
                let field = format!("f{}", i);
                change.fields.push(FieldChange::new(field.clone(), json!(i), json!(i + 1)));
                change.conflicts.push(ChangeConflict::new(field, json!(i), json!(i + 1), None, now));
            }
            for (i, done) in resolved.iter().enumerate() {
                if *done {
                    change
                        .resolve_conflict(&format!("f{}", i), ConflictResolution::Remote, None, now)
                        .unwrap();
                }
            }

            let result = change.approve("reviewer", now);
            if resolved.iter().all(|r| *r) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(change.status, ChangeStatus::Approved);
            } else {
                let is_unresolved = matches!(result, Err(ChangeError::UnresolvedConflict { .. }));
                prop_assert!(is_unresolved);
                prop_assert_eq!(change.status, ChangeStatus::Pending);
            }
        }
    }
}
