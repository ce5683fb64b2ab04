//! Stager: diff, detect and persist staged changes for incoming records
//!
//! Holds the per-product lock for the whole read-diff-write sequence so two
//! records for the same product are never staged concurrently. At most one
//! pending change exists per (product, source): a later record from the
//! same source merges into it field by field.

use crate::conflict::{detect, Detection};
use crate::diff::{diff_record, infer_change_type};
use crate::locks::ProductLocks;
use catalog_core::{
    CatalogConfig, CatalogResult, ChangeConflict, ChangeId, ChangeStatus, ChangeType,
    OperationId, ProductSnapshot, Source, SourceRecord, StagedChange, Timestamp,
};
use catalog_storage::{retry_on_conflict, CatalogStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What staging a record did.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// A new pending change was created
    Created(StagedChange),
    /// The source's existing pending change was updated
    Updated(StagedChange),
    /// The record matches the canonical snapshot and any pending change
    Unchanged,
}

impl StageOutcome {
    pub fn change(&self) -> Option<&StagedChange> {
        match self {
            StageOutcome::Created(c) | StageOutcome::Updated(c) => Some(c),
            StageOutcome::Unchanged => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, StageOutcome::Unchanged)
    }
}

/// Entry point of the Diff Engine / Conflict Detector pipeline.
#[derive(Clone)]
pub struct Stager {
    store: Arc<dyn CatalogStore>,
    locks: ProductLocks,
    cas_retries: u32,
}

impl Stager {
    pub fn new(store: Arc<dyn CatalogStore>, locks: ProductLocks, config: &CatalogConfig) -> Self {
        Self {
            store,
            locks,
            cas_retries: config.cas_retry_limit,
        }
    }

    /// Validate a raw connector payload and stage it.
    ///
    /// Fails with `MalformedSourceRecord` without touching the store when
    /// the payload does not pass validation.
    pub async fn stage_raw(
        &self,
        source: Source,
        raw: &serde_json::Value,
        staged_by: &str,
        operation_id: Option<OperationId>,
    ) -> CatalogResult<StageOutcome> {
        let record = SourceRecord::parse(source, raw)?;
        self.stage_record(&record, staged_by, operation_id).await
    }

    /// Diff a validated record against the canonical snapshot and stage the result.
    #[instrument(skip(self, record), fields(product_id = %record.product_id, source = %record.source))]
    pub async fn stage_record(
        &self,
        record: &SourceRecord,
        staged_by: &str,
        operation_id: Option<OperationId>,
    ) -> CatalogResult<StageOutcome> {
        let _guard = self.locks.lock(&record.product_id).await;
        let now = Utc::now();
        let snapshot = self.store.snapshot_get(&record.product_id)?;

        let (outcome, superseded) = retry_on_conflict(self.cas_retries, || {
            self.stage_locked(record, snapshot.as_ref(), staged_by, operation_id, now)
        })?;

        if let Some(change) = outcome.change() {
            self.apply_supersessions(change.change_id, &superseded, now)?;
        }

        match &outcome {
            StageOutcome::Created(c) => info!(
                change_id = %c.change_id,
                change_type = %c.change_type,
                fields = c.fields.len(),
                conflicts = c.conflicts.len(),
                "Staged new change"
            ),
            StageOutcome::Updated(c) => info!(
                change_id = %c.change_id,
                fields = c.fields.len(),
                conflicts = c.conflicts.len(),
                "Merged record into pending change"
            ),
            StageOutcome::Unchanged => debug!("Record matches canonical snapshot"),
        }
        Ok(outcome)
    }

    fn stage_locked(
        &self,
        record: &SourceRecord,
        snapshot: Option<&ProductSnapshot>,
        staged_by: &str,
        operation_id: Option<OperationId>,
        now: Timestamp,
    ) -> CatalogResult<(StageOutcome, Vec<(ChangeId, String)>)> {
        let pending = self.store.change_pending_for_product(&record.product_id)?;
        let own = pending.iter().find(|c| c.source == record.source).cloned();
        let live_snapshot = snapshot.is_some_and(|s| !s.deleted);

        if record.deleted {
            return match own {
                Some(own) => {
                    let mut merged = own.clone();
                    merged.fields.clear();
                    merged.conflicts.clear();
                    merged.change_type = ChangeType::Delete;
                    merged.refresh_priority();
                    if merged == own {
                        return Ok((StageOutcome::Unchanged, Vec::new()));
                    }
                    merged.updated_at = now;
                    merged.operation_id = operation_id.or(merged.operation_id);
                    let stored = self.store.change_update(&merged)?;
                    Ok((StageOutcome::Updated(stored), Vec::new()))
                }
                None if live_snapshot => {
                    let mut change = StagedChange::new(
                        record.source,
                        record.product_id.clone(),
                        ChangeType::Delete,
                        Vec::new(),
                        staged_by,
                        now,
                    );
                    change.operation_id = operation_id;
                    let stored = self.store.change_insert(&change)?;
                    Ok((StageOutcome::Created(stored), Vec::new()))
                }
                None => Ok((StageOutcome::Unchanged, Vec::new())),
            };
        }

        let fields = diff_record(record, snapshot);
        let Detection {
            conflicts,
            superseded,
        } = detect(record.source, &fields, snapshot, &pending, now);

        let Some(own) = own else {
            if fields.is_empty() {
                return Ok((StageOutcome::Unchanged, Vec::new()));
            }
            let change_type = infer_change_type(record, snapshot, &fields);
            let mut change = StagedChange::new(
                record.source,
                record.product_id.clone(),
                change_type,
                fields,
                staged_by,
                now,
            );
            change.conflicts = conflicts;
            change.operation_id = operation_id;
            let stored = self.store.change_insert(&change)?;
            return Ok((StageOutcome::Created(stored), superseded));
        };

        let mut merged = own.clone();

        // Fields the source now reports equal to canonical are no longer proposed.
        for field in record.fields.keys() {
            if !fields.iter().any(|f| &f.field == field) {
                merged.fields.retain(|f| &f.field != field);
                merged.conflicts.retain(|c| &c.field != field);
            }
        }

        let previous: BTreeMap<String, ChangeConflict> = merged
            .conflicts
            .iter()
            .map(|c| (c.field.clone(), c.clone()))
            .collect();
        for fc in fields {
            merged.conflicts.retain(|c| c.field != fc.field);
            if let Some(mut conflict) = conflicts.iter().find(|c| c.field == fc.field).cloned() {
                if let Some(prior) = previous.get(&fc.field) {
                    if prior.local_value == conflict.local_value
                        && prior.remote_value == conflict.remote_value
                    {
                        conflict.resolution = prior.resolution;
                        conflict.custom_value = prior.custom_value.clone();
                        conflict.detected_at = prior.detected_at;
                    }
                }
                merged.conflicts.push(conflict);
            }
            match merged.fields.iter_mut().find(|f| f.field == fc.field) {
                Some(existing) => *existing = fc,
                None => merged.fields.push(fc),
            }
        }

        merged.change_type = infer_change_type(record, snapshot, &merged.fields);
        merged.refresh_priority();

        if merged.fields == own.fields
            && merged.conflicts == own.conflicts
            && merged.change_type == own.change_type
        {
            return Ok((StageOutcome::Unchanged, Vec::new()));
        }

        merged.updated_at = now;
        merged.operation_id = operation_id.or(merged.operation_id);
        let stored = self.store.change_update(&merged)?;
        Ok((StageOutcome::Updated(stored), superseded))
    }

    /// Mark other sources' pending field changes as superseded by `by`.
    fn apply_supersessions(
        &self,
        by: ChangeId,
        superseded: &[(ChangeId, String)],
        now: Timestamp,
    ) -> CatalogResult<()> {
        let mut by_change: BTreeMap<ChangeId, Vec<&str>> = BTreeMap::new();
        for (id, field) in superseded {
            by_change.entry(*id).or_default().push(field.as_str());
        }

        for (id, fields) in by_change {
            retry_on_conflict(self.cas_retries, || {
                let Some(mut other) = self.store.change_get(id)? else {
                    return Ok(());
                };
                if other.status != ChangeStatus::Pending {
                    return Ok(());
                }
                let mut touched = false;
                for field in &fields {
                    if let Some(fc) = other.field_mut(field) {
                        if fc.superseded_by.is_none() {
                            fc.superseded_by = Some(by);
                            touched = true;
                        }
                    }
                }
                if touched {
                    other.refresh_priority();
                    other.updated_at = now;
                    self.store.change_update(&other)?;
                    debug!(change_id = %id, superseded_by = %by, "Superseded pending fields");
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{ChangeFilter, ConflictResolution, Impact};
    use catalog_storage::MemoryStore;
    use catalog_test_utils::product_snapshot;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Stager) {
        let store = Arc::new(MemoryStore::new());
        let stager = Stager::new(store.clone(), ProductLocks::new(), &CatalogConfig::default());
        (store, stager)
    }

    #[tokio::test]
    async fn test_unchanged_record_stages_nothing() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.00))]))
            .unwrap();
        let outcome = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 10.00}), "sync", None)
            .await
            .unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(store.change_count(), 0);
    }

    #[tokio::test]
    async fn test_second_pull_updates_pending_change() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0)), ("title", json!("Mug"))]))
            .unwrap();

        let first = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 11.0}), "sync", None)
            .await
            .unwrap();
        assert!(matches!(first, StageOutcome::Created(_)));

        let second = stager
            .stage_raw(
                Source::VendorFeed,
                &json!({"sku": "X1", "price": 12.0, "title": "Big Mug"}),
                "sync",
                None,
            )
            .await
            .unwrap();
        let StageOutcome::Updated(change) = second else {
            panic!("expected update, got {:?}", second);
        };
        assert_eq!(change.change_id, first.change().unwrap().change_id);
        assert_eq!(change.field("price").unwrap().new_value, json!(12.0));
        assert_eq!(change.field("title").unwrap().new_value, json!("Big Mug"));
        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(store.change_list(&ChangeFilter::pending()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_repull_is_unchanged() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0))]))
            .unwrap();
        let raw = json!({"sku": "X1", "price": 11.0});
        stager.stage_raw(Source::VendorFeed, &raw, "sync", None).await.unwrap();
        let again = stager.stage_raw(Source::VendorFeed, &raw, "sync", None).await.unwrap();
        assert!(again.is_unchanged());
    }

    #[tokio::test]
    async fn test_source_reverting_drops_field() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0)), ("title", json!("Mug"))]))
            .unwrap();
        stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 11.0, "title": "Cup"}), "sync", None)
            .await
            .unwrap();
        let outcome = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 10.0}), "sync", None)
            .await
            .unwrap();
        let change = outcome.change().unwrap();
        assert!(change.field("price").is_none());
        assert!(change.field("title").is_some());
    }

    #[tokio::test]
    async fn test_local_edit_conflict_and_resolution_survives_identical_merge() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(9.0))]))
            .unwrap();
        store
            .snapshot_record_local_edit("X1", "price", json!(10.0), Utc::now())
            .unwrap();

        let outcome = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 12.0}), "sync", None)
            .await
            .unwrap();
        let mut change = outcome.change().unwrap().clone();
        assert_eq!(change.conflicts.len(), 1);

        change
            .resolve_conflict("price", ConflictResolution::Remote, None, Utc::now())
            .unwrap();
        store.change_update(&change).unwrap();

        // Same values again plus a new field: resolution carried over.
        let outcome = stager
            .stage_raw(
                Source::VendorFeed,
                &json!({"sku": "X1", "price": 12.0, "tags": ["sale"]}),
                "sync",
                None,
            )
            .await
            .unwrap();
        let merged = outcome.change().unwrap();
        assert_eq!(
            merged.conflict("price").unwrap().resolution,
            Some(ConflictResolution::Remote)
        );
    }

    #[tokio::test]
    async fn test_cross_source_supersession() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0)), ("title", json!("Mug"))]))
            .unwrap();

        let first = stager
            .stage_raw(Source::Storefront, &json!({"sku": "X1", "price": 11.0, "title": "Cup"}), "sync", None)
            .await
            .unwrap();
        let first_id = first.change().unwrap().change_id;

        let second = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": 12.0}), "sync", None)
            .await
            .unwrap();
        let second_id = second.change().unwrap().change_id;
        assert!(second.change().unwrap().conflicts.is_empty());

        let earlier = store.change_get(first_id).unwrap().unwrap();
        assert_eq!(earlier.field("price").unwrap().superseded_by, Some(second_id));
        assert!(earlier.field("title").unwrap().superseded_by.is_none());
        assert_eq!(earlier.priority, Impact::Medium);
        assert_eq!(earlier.status, ChangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_delete_record() {
        let (store, stager) = setup();
        let outcome = stager
            .stage_raw(Source::Storefront, &json!({"sku": "GONE", "_deleted": true}), "sync", None)
            .await
            .unwrap();
        assert!(outcome.is_unchanged());

        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(1.0))]))
            .unwrap();
        let outcome = stager
            .stage_raw(Source::Storefront, &json!({"sku": "X1", "_deleted": true}), "sync", None)
            .await
            .unwrap();
        let change = outcome.change().unwrap();
        assert_eq!(change.change_type, ChangeType::Delete);
        assert!(change.fields.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_stages_nothing() {
        let (store, stager) = setup();
        let err = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "X1", "price": -5}), "sync", None)
            .await
            .unwrap_err();
        assert!(matches!(err, catalog_core::CatalogError::Record(_)));
        assert_eq!(store.change_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_for_one_product_do_not_duplicate() {
        let (store, stager) = setup();
        store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0))]))
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let stager = stager.clone();
            handles.push(tokio::spawn(async move {
                stager
                    .stage_raw(
                        Source::VendorFeed,
                        &json!({"sku": "X1", "price": 11.0 + i as f64}),
                        "sync",
                        None,
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let pending = store.change_pending_for_product("X1").unwrap();
        assert_eq!(pending.len(), 1);
    }
}
