//! Canonical product snapshots and validated source records

use crate::{ProductId, RecordError, Source, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Fields that must hold a non-negative decimal.
pub const NUMERIC_FIELDS: &[&str] = &["price", "compare_at_price", "cost"];

/// Fields that must hold a non-negative integer.
pub const INTEGER_FIELDS: &[&str] = &["inventory", "quantity"];

/// Keys that may carry the product identity, in lookup order.
pub const ID_FIELDS: &[&str] = &["product_id", "sku"];

// ============================================================================
// FIELD STAMP
// ============================================================================

/// Per-field version stamps used to tell local edits from synced values.
///
/// A field counts as locally edited while `local_version > synced_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FieldStamp {
    pub local_version: u64,
    pub synced_version: u64,
    /// Source of the last synced value
    pub synced_source: Option<Source>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub edited_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub synced_at: Option<Timestamp>,
}

impl FieldStamp {
    pub fn is_locally_edited(&self) -> bool {
        self.local_version > self.synced_version
    }
}

// ============================================================================
// PRODUCT SNAPSHOT
// ============================================================================

/// The system's current locally stored view of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProductSnapshot {
    pub product_id: ProductId,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub fields: BTreeMap<String, Value>,
    pub stamps: BTreeMap<String, FieldStamp>,
    pub deleted: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
}

impl ProductSnapshot {
    pub fn new(product_id: impl Into<ProductId>, now: Timestamp) -> Self {
        Self {
            product_id: product_id.into(),
            fields: BTreeMap::new(),
            stamps: BTreeMap::new(),
            deleted: false,
            updated_at: now,
        }
    }

    /// Field value, `Null` when absent.
    pub fn value(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    pub fn is_locally_edited(&self, field: &str) -> bool {
        self.stamps
            .get(field)
            .is_some_and(FieldStamp::is_locally_edited)
    }

    /// Record an edit made inside the catalog itself.
    pub fn record_local_edit(&mut self, field: &str, value: Value, now: Timestamp) {
        self.fields.insert(field.to_string(), value);
        let stamp = self.stamps.entry(field.to_string()).or_default();
        stamp.local_version = stamp.local_version.max(stamp.synced_version) + 1;
        stamp.edited_at = Some(now);
        self.updated_at = now;
    }

    /// Apply a value accepted from a source. Clears the local-edit flag.
    pub fn apply_synced(&mut self, field: &str, value: Value, source: Source, now: Timestamp) {
        self.fields.insert(field.to_string(), value);
        let stamp = self.stamps.entry(field.to_string()).or_default();
        stamp.synced_version = stamp.local_version;
        stamp.synced_source = Some(source);
        stamp.synced_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.deleted = true;
        self.updated_at = now;
    }
}

// ============================================================================
// SOURCE RECORD
// ============================================================================

/// A source payload that passed schema validation.
///
/// This is the only place loosely typed connector payloads are accepted.
/// Anything that fails here is a `MalformedSourceRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: Source,
    pub product_id: ProductId,
    pub fields: BTreeMap<String, Value>,
    pub deleted: bool,
}

impl SourceRecord {
    /// Validate a raw connector payload.
    ///
    /// - must be a JSON object with a non-empty `product_id` or `sku`
    /// - price-like fields must be non-negative numbers (numeric strings are
    ///   accepted and converted, empty strings become `null`)
    /// - inventory-like fields must be non-negative integers
    /// - `_deleted: true` flags a deletion, other `_`-prefixed keys are ignored
    pub fn parse(source: Source, raw: &Value) -> Result<Self, RecordError> {
        let object = raw.as_object().ok_or_else(|| malformed(None, "record is not an object"))?;
        let (id_key, product_id) = extract_id(object)?;

        let mut fields = BTreeMap::new();
        let mut deleted = false;
        for (key, value) in object {
            if key == id_key {
                continue;
            }
            if key == "_deleted" {
                deleted = match value {
                    Value::Bool(b) => *b,
                    Value::Null => false,
                    _ => {
                        return Err(malformed(Some(&product_id), "_deleted must be a boolean"));
                    }
                };
                continue;
            }
            if key.starts_with('_') {
                continue;
            }
            if key.trim().is_empty() {
                return Err(malformed(Some(&product_id), "empty field name"));
            }

            let value = if NUMERIC_FIELDS.contains(&key.as_str()) {
                coerce_decimal(&product_id, key, value)?
            } else if INTEGER_FIELDS.contains(&key.as_str()) {
                coerce_integer(&product_id, key, value)?
            } else {
                value.clone()
            };
            fields.insert(key.clone(), value);
        }

        Ok(Self {
            source,
            product_id,
            fields,
            deleted,
        })
    }
}

fn malformed(product_id: Option<&str>, reason: impl Into<String>) -> RecordError {
    RecordError::MalformedSourceRecord {
        product_id: product_id.map(str::to_string),
        reason: reason.into(),
    }
}

fn extract_id(object: &Map<String, Value>) -> Result<(&'static str, ProductId), RecordError> {
    for key in ID_FIELDS {
        let id = match object.get(*key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => continue,
            Some(_) => return Err(malformed(None, format!("{} must be a string", key))),
        };
        if !id.is_empty() {
            return Ok((*key, id));
        }
    }
    Err(malformed(None, "missing product_id or sku"))
}

fn coerce_decimal(product_id: &str, field: &str, value: &Value) -> Result<Value, RecordError> {
    let number = match value {
        Value::Null => return Ok(Value::Null),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => return Ok(Value::Null),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let number = number
        .filter(|n| n.is_finite())
        .ok_or_else(|| malformed(Some(product_id), format!("{} must be numeric", field)))?;
    if number < 0.0 {
        return Err(malformed(
            Some(product_id),
            format!("{} must not be negative", field),
        ));
    }
    Number::from_f64(number)
        .map(Value::Number)
        .ok_or_else(|| malformed(Some(product_id), format!("{} must be numeric", field)))
}

fn coerce_integer(product_id: &str, field: &str, value: &Value) -> Result<Value, RecordError> {
    let parsed = match value {
        Value::Null => return Ok(Value::Null),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) if s.trim().is_empty() => return Ok(Value::Null),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let number = parsed
        .ok_or_else(|| malformed(Some(product_id), format!("{} must be an integer", field)))?;
    if number < 0 {
        return Err(malformed(
            Some(product_id),
            format!("{} must not be negative", field),
        ));
    }
    Ok(Value::from(number))
}
