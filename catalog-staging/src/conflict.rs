//! Conflict Detector
//!
//! A field conflicts only when the canonical value was edited locally since
//! the last sync and the incoming remote value differs from that local
//! value. Disagreement between sources is never a conflict: the newest
//! change wins the field and the older pending field change is superseded.

use crate::normalize::values_equal;
use catalog_core::{
    ChangeConflict, ChangeId, FieldChange, ProductSnapshot, Source, StagedChange, Timestamp,
};
use serde_json::Value;

/// Outcome of conflict detection for one incoming change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Conflicts to attach to the incoming change
    pub conflicts: Vec<ChangeConflict>,
    /// Pending field changes of other sources the incoming change supersedes
    pub superseded: Vec<(ChangeId, String)>,
}

/// Decide conflicts and supersessions for `fields` arriving from `source`.
///
/// `pending` holds the currently pending changes for the product from any
/// source; entries from `source` itself are ignored.
pub fn detect(
    source: Source,
    fields: &[FieldChange],
    snapshot: Option<&ProductSnapshot>,
    pending: &[StagedChange],
    now: Timestamp,
) -> Detection {
    let mut detection = Detection::default();

    for fc in fields {
        let others: Vec<(&StagedChange, &FieldChange)> = pending
            .iter()
            .filter(|c| c.source != source)
            .filter_map(|c| {
                c.field(&fc.field)
                    .filter(|f| !f.is_superseded())
                    .map(|f| (c, f))
            })
            .collect();

        let local_edit = snapshot
            .filter(|s| !s.deleted && s.is_locally_edited(&fc.field))
            .map(|s| s.value(&fc.field));

        match local_edit {
            Some(local) if !values_equal(local, &fc.new_value) => {
                let staged_value: Option<Value> = others
                    .iter()
                    .max_by_key(|(c, _)| c.updated_at)
                    .map(|(_, f)| f.new_value.clone());
                detection.conflicts.push(ChangeConflict::new(
                    fc.field.clone(),
                    local.clone(),
                    fc.new_value.clone(),
                    staged_value,
                    now,
                ));
            }
            _ => {
                detection.superseded.extend(
                    others
                        .iter()
                        .map(|(c, f)| (c.change_id, f.field.clone())),
                );
            }
        }
    }

    detection
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::ChangeType;
    use catalog_test_utils::product_snapshot;
    use chrono::Utc;
    use serde_json::json;

    fn pending_from(source: Source, field: &str, value: Value) -> StagedChange {
        StagedChange::new(
            source,
            "X1",
            ChangeType::Update,
            vec![FieldChange::new(field, json!(10.0), value)],
            "sync",
            Utc::now(),
        )
    }

    #[test]
    fn test_plain_update_is_not_a_conflict() {
        let snapshot = product_snapshot("X1", &[("price", json!(10.0))]);
        let fields = vec![FieldChange::new("price", json!(10.0), json!(12.0))];
        let detection = detect(Source::VendorFeed, &fields, Some(&snapshot), &[], Utc::now());
        assert!(detection.conflicts.is_empty());
        assert!(detection.superseded.is_empty());
    }

    #[test]
    fn test_local_edit_raises_conflict() {
        let mut snapshot = product_snapshot("X1", &[("price", json!(9.0))]);
        snapshot.record_local_edit("price", json!(10.0), Utc::now());
        let fields = vec![FieldChange::new("price", json!(10.0), json!(12.0))];

        let detection = detect(Source::VendorFeed, &fields, Some(&snapshot), &[], Utc::now());
        assert_eq!(detection.conflicts.len(), 1);
        let conflict = &detection.conflicts[0];
        assert_eq!(conflict.field, "price");
        assert_eq!(conflict.local_value, json!(10.0));
        assert_eq!(conflict.remote_value, json!(12.0));
        assert_eq!(conflict.staged_value, None);
        assert!(conflict.resolution.is_none());
    }

    #[test]
    fn test_cross_source_disagreement_supersedes() {
        let snapshot = product_snapshot("X1", &[("price", json!(10.0))]);
        let earlier = pending_from(Source::Storefront, "price", json!(11.0));
        let fields = vec![FieldChange::new("price", json!(10.0), json!(12.0))];

        let detection = detect(
            Source::VendorFeed,
            &fields,
            Some(&snapshot),
            std::slice::from_ref(&earlier),
            Utc::now(),
        );
        assert!(detection.conflicts.is_empty());
        assert_eq!(
            detection.superseded,
            vec![(earlier.change_id, "price".to_string())]
        );
    }

    #[test]
    fn test_conflict_carries_staged_value_and_keeps_other_pending() {
        let mut snapshot = product_snapshot("X1", &[("price", json!(9.0))]);
        snapshot.record_local_edit("price", json!(10.0), Utc::now());
        let earlier = pending_from(Source::Storefront, "price", json!(11.0));
        let fields = vec![FieldChange::new("price", json!(10.0), json!(12.0))];

        let detection = detect(
            Source::VendorFeed,
            &fields,
            Some(&snapshot),
            std::slice::from_ref(&earlier),
            Utc::now(),
        );
        assert_eq!(detection.conflicts[0].staged_value, Some(json!(11.0)));
        assert!(detection.superseded.is_empty());
    }

    #[test]
    fn test_own_source_pending_ignored() {
        let snapshot = product_snapshot("X1", &[("price", json!(10.0))]);
        let own = pending_from(Source::VendorFeed, "price", json!(11.0));
        let fields = vec![FieldChange::new("price", json!(10.0), json!(12.0))];
        let detection = detect(
            Source::VendorFeed,
            &fields,
            Some(&snapshot),
            std::slice::from_ref(&own),
            Utc::now(),
        );
        assert!(detection.superseded.is_empty());
    }
}
