//! Diff Engine
//!
//! Pure comparison of a validated source record against the canonical
//! snapshot of the same product.

use crate::normalize::{canonical_value, values_equal};
use catalog_core::{
    ChangeType, FieldChange, ProductSnapshot, SourceRecord, INTEGER_FIELDS, NUMERIC_FIELDS,
};
use serde_json::Value;

/// Fields whose changes are more than descriptive metadata.
pub const CORE_FIELDS: &[&str] = &[
    "price",
    "compare_at_price",
    "cost",
    "inventory",
    "quantity",
    "title",
    "name",
    "sku",
    "barcode",
    "status",
    "vendor",
];

/// Field-level differences between a record and the canonical snapshot.
///
/// Only fields present in the record are compared; a field missing from a
/// partial record is not a removal. Nothing is emitted for fields whose
/// normalized values are equal.
pub fn diff_record(record: &SourceRecord, snapshot: Option<&ProductSnapshot>) -> Vec<FieldChange> {
    let live_snapshot = snapshot.filter(|s| !s.deleted);
    record
        .fields
        .iter()
        .filter_map(|(field, remote)| {
            let local = live_snapshot.map(|s| s.value(field)).unwrap_or(&Value::Null);
            if values_equal(local, remote) {
                None
            } else {
                Some(FieldChange::new(
                    field.clone(),
                    local.clone(),
                    canonical_value(remote),
                ))
            }
        })
        .collect()
}

/// Classify a change from the record, the snapshot and the differing fields.
pub fn infer_change_type(
    record: &SourceRecord,
    snapshot: Option<&ProductSnapshot>,
    fields: &[FieldChange],
) -> ChangeType {
    if record.deleted {
        return ChangeType::Delete;
    }
    if snapshot.is_none_or(|s| s.deleted) {
        return ChangeType::Create;
    }
    classify_fields(fields.iter().map(|f| f.field.as_str()))
}

/// Classify an update by the names of the fields it touches.
pub fn classify_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> ChangeType {
    let names: Vec<&str> = fields.into_iter().collect();
    if names.is_empty() {
        return ChangeType::Update;
    }
    if names.iter().all(|f| NUMERIC_FIELDS.contains(f)) {
        ChangeType::Price
    } else if names.iter().all(|f| INTEGER_FIELDS.contains(f)) {
        ChangeType::Inventory
    } else if names.iter().all(|f| !CORE_FIELDS.contains(f)) {
        ChangeType::Metadata
    } else {
        ChangeType::Update
    }
}
