//! Review/Approval Workflow
//!
//! The only component that moves a StagedChange out of `pending`. Every
//! status or resolution write is a compare-and-set on the stored version,
//! retried after a lost race and then surfaced to the caller.

use crate::locks::ProductLocks;
use catalog_core::{
    CatalogConfig, CatalogError, CatalogResult, ChangeFilter, ChangeId, ChangeStatus, ChangeType,
    ConflictResolution, EntityKind, ProductSnapshot, StagedChange, StorageError, Timestamp,
};
use catalog_storage::{retry_on_conflict, CatalogStore};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One id that failed inside a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkFailure {
    pub change_id: ChangeId,
    pub error: CatalogError,
}

/// Per-id result of a bulk approve/reject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub succeeded: Vec<ChangeId>,
    pub failed: Vec<BulkFailure>,
}

impl BulkOutcome {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure(&self, change_id: ChangeId) -> Option<&CatalogError> {
        self.failed
            .iter()
            .find(|f| f.change_id == change_id)
            .map(|f| &f.error)
    }
}

#[derive(Clone)]
pub struct ReviewWorkflow {
    store: Arc<dyn CatalogStore>,
    locks: ProductLocks,
    cas_retries: u32,
}

impl ReviewWorkflow {
    pub fn new(store: Arc<dyn CatalogStore>, locks: ProductLocks, config: &CatalogConfig) -> Self {
        Self {
            store,
            locks,
            cas_retries: config.cas_retry_limit,
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get(&self, change_id: ChangeId) -> CatalogResult<StagedChange> {
        self.store
            .change_get(change_id)?
            .ok_or_else(|| not_found(change_id))
    }

    pub fn list(&self, filter: &ChangeFilter) -> CatalogResult<Vec<StagedChange>> {
        self.store.change_list(filter)
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Approve one change and apply its resolved values to the canonical snapshot.
    ///
    /// Fails with `UnresolvedConflict` while any conflict lacks a resolution.
    /// The snapshot is written before the status, so a failed approval
    /// leaves the change pending; the approved change lands on its source's
    /// push queue.
    #[instrument(skip(self))]
    pub async fn approve(&self, change_id: ChangeId, reviewer: &str) -> CatalogResult<StagedChange> {
        let product_id = self.get(change_id)?.product_id;
        let _guard = self.locks.lock(&product_id).await;
        let now = Utc::now();

        let mut candidate = self.get(change_id)?;
        candidate.approve(reviewer, now)?;
        let previous = self.store.snapshot_get(&product_id)?;
        self.apply_to_snapshot(&candidate, now)?;

        let approved = match retry_on_conflict(self.cas_retries, || {
            let mut change = self.get(change_id)?;
            change.approve(reviewer, now)?;
            self.store.change_update(&change)
        }) {
            Ok(approved) => approved,
            Err(e) => {
                self.restore_snapshot(&product_id, previous);
                return Err(e);
            }
        };
        info!(
            change_id = %change_id,
            product_id = %approved.product_id,
            source = %approved.source,
            reviewer,
            "Change approved"
        );
        Ok(approved)
    }

    /// Reject one change. Only a pending change can be rejected.
    #[instrument(skip(self))]
    pub async fn reject(&self, change_id: ChangeId, reviewer: &str) -> CatalogResult<StagedChange> {
        let product_id = self.get(change_id)?.product_id;
        let _guard = self.locks.lock(&product_id).await;
        let now = Utc::now();

        let rejected = retry_on_conflict(self.cas_retries, || {
            let mut change = self.get(change_id)?;
            change.reject(reviewer, now)?;
            self.store.change_update(&change)
        })?;
        info!(change_id = %change_id, reviewer, "Change rejected");
        Ok(rejected)
    }

    /// Approve each id independently.
    pub async fn approve_many(&self, ids: &[ChangeId], reviewer: &str) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            match self.approve(id, reviewer).await {
                Ok(_) => outcome.succeeded.push(id),
                Err(error) => {
                    warn!(change_id = %id, error = %error, "Bulk approve item failed");
                    outcome.failed.push(BulkFailure { change_id: id, error });
                }
            }
        }
        outcome
    }

    /// Reject each id independently.
    pub async fn reject_many(&self, ids: &[ChangeId], reviewer: &str) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            match self.reject(id, reviewer).await {
                Ok(_) => outcome.succeeded.push(id),
                Err(error) => {
                    warn!(change_id = %id, error = %error, "Bulk reject item failed");
                    outcome.failed.push(BulkFailure { change_id: id, error });
                }
            }
        }
        outcome
    }

    /// Set or overwrite the resolution of one conflicting field.
    #[instrument(skip(self, custom_value))]
    pub async fn resolve_conflict(
        &self,
        change_id: ChangeId,
        field: &str,
        resolution: ConflictResolution,
        custom_value: Option<Value>,
    ) -> CatalogResult<StagedChange> {
        let product_id = self.get(change_id)?.product_id;
        let _guard = self.locks.lock(&product_id).await;
        let now = Utc::now();

        retry_on_conflict(self.cas_retries, || {
            let mut change = self.get(change_id)?;
            change.resolve_conflict(field, resolution, custom_value.clone(), now)?;
            self.store.change_update(&change)
        })
    }

    /// Parse a resolution name and resolve. Unknown names fail with `InvalidResolution`.
    pub async fn resolve_conflict_named(
        &self,
        change_id: ChangeId,
        field: &str,
        resolution: &str,
        custom_value: Option<Value>,
    ) -> CatalogResult<StagedChange> {
        let parsed = ConflictResolution::from_db_str(resolution).map_err(|e| {
            catalog_core::ChangeError::InvalidResolution {
                field: field.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.resolve_conflict(change_id, field, parsed, custom_value)
            .await
    }

    /// Drop terminal changes staged before `before`.
    pub fn archive_terminal(&self, before: Timestamp) -> CatalogResult<usize> {
        let removed = self.store.change_archive_terminal(before)?;
        if removed > 0 {
            info!(removed, "Archived terminal changes");
        }
        Ok(removed)
    }

    fn restore_snapshot(&self, product_id: &str, previous: Option<ProductSnapshot>) {
        let restored = match previous {
            Some(snapshot) => self.store.snapshot_put(&snapshot),
            None => self.store.snapshot_delete(product_id),
        };
        if let Err(e) = restored {
            warn!(product_id, error = %e, "Could not restore snapshot after a failed approval");
        }
    }

    fn apply_to_snapshot(&self, change: &StagedChange, now: Timestamp) -> CatalogResult<()> {
        debug_assert_eq!(change.status, ChangeStatus::Approved);
        let mut snapshot = self
            .store
            .snapshot_get(&change.product_id)?
            .unwrap_or_else(|| ProductSnapshot::new(change.product_id.clone(), now));

        if change.change_type == ChangeType::Delete {
            snapshot.mark_deleted(now);
        } else {
            snapshot.deleted = false;
            for (field, value) in change.resolved_fields() {
                snapshot.apply_synced(&field, value, change.source, now);
            }
        }
        self.store.snapshot_put(&snapshot)
    }
}

fn not_found(change_id: ChangeId) -> CatalogError {
    StorageError::NotFound {
        entity: EntityKind::StagedChange,
        id: change_id.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stager::Stager;
    use catalog_core::{ChangeError, Source};
    use catalog_storage::MemoryStore;
    use catalog_test_utils::product_snapshot;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryStore>,
        stager: Stager,
        review: ReviewWorkflow,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let locks = ProductLocks::new();
        let config = CatalogConfig::default();
        Harness {
            stager: Stager::new(store.clone(), locks.clone(), &config),
            review: ReviewWorkflow::new(store.clone(), locks, &config),
            store,
        }
    }

    async fn stage(h: &Harness, source: Source, raw: Value) -> StagedChange {
        h.stager
            .stage_raw(source, &raw, "sync", None)
            .await
            .unwrap()
            .change()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_approve_applies_to_snapshot() {
        let h = harness();
        h.store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0))]))
            .unwrap();
        let change = stage(&h, Source::VendorFeed, json!({"sku": "X1", "price": 12.0})).await;

        let approved = h.review.approve(change.change_id, "alice").await.unwrap();
        assert_eq!(approved.status, ChangeStatus::Approved);
        assert_eq!(approved.reviewed_by.as_deref(), Some("alice"));
        assert!(approved.is_awaiting_push());

        let snapshot = h.store.snapshot_get("X1").unwrap().unwrap();
        assert_eq!(snapshot.value("price"), &json!(12.0));
        assert!(!snapshot.is_locally_edited("price"));
    }

    mod outage {
        use super::*;
        use catalog_core::{
            BatchOperation, ImportId, ImportJob, OperationFilter, OperationId, Source,
        };
        use catalog_storage::ReconcileReport;
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Memory store whose snapshot or change writes can be switched off.
        #[derive(Default)]
        pub struct OutageStore {
            pub inner: MemoryStore,
            pub snapshots_down: AtomicBool,
            pub changes_down: AtomicBool,
        }

        fn down(flag: &AtomicBool) -> CatalogResult<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(StorageError::Persistence {
                    reason: "disk unavailable".to_string(),
                }
                .into());
            }
            Ok(())
        }

        impl CatalogStore for OutageStore {
            fn change_insert(&self, change: &StagedChange) -> CatalogResult<StagedChange> {
                self.inner.change_insert(change)
            }
            fn change_get(&self, id: ChangeId) -> CatalogResult<Option<StagedChange>> {
                self.inner.change_get(id)
            }
            fn change_update(&self, change: &StagedChange) -> CatalogResult<StagedChange> {
                down(&self.changes_down)?;
                self.inner.change_update(change)
            }
            fn change_list(&self, filter: &ChangeFilter) -> CatalogResult<Vec<StagedChange>> {
                self.inner.change_list(filter)
            }
            fn change_pending_for_product(&self, product_id: &str) -> CatalogResult<Vec<StagedChange>> {
                self.inner.change_pending_for_product(product_id)
            }
            fn change_awaiting_push(&self, source: Source) -> CatalogResult<Vec<StagedChange>> {
                self.inner.change_awaiting_push(source)
            }
            fn change_archive_terminal(&self, before: Timestamp) -> CatalogResult<usize> {
                self.inner.change_archive_terminal(before)
            }
            fn snapshot_get(&self, product_id: &str) -> CatalogResult<Option<ProductSnapshot>> {
                self.inner.snapshot_get(product_id)
            }
            fn snapshot_put(&self, snapshot: &ProductSnapshot) -> CatalogResult<()> {
                down(&self.snapshots_down)?;
                self.inner.snapshot_put(snapshot)
            }
            fn snapshot_delete(&self, product_id: &str) -> CatalogResult<()> {
                self.inner.snapshot_delete(product_id)
            }
            fn operation_insert(&self, op: &BatchOperation) -> CatalogResult<BatchOperation> {
                self.inner.operation_insert(op)
            }
            fn operation_get(&self, id: OperationId) -> CatalogResult<Option<BatchOperation>> {
                self.inner.operation_get(id)
            }
            fn operation_update(&self, op: &BatchOperation) -> CatalogResult<BatchOperation> {
                self.inner.operation_update(op)
            }
            fn operation_list(&self, filter: &OperationFilter) -> CatalogResult<Vec<BatchOperation>> {
                self.inner.operation_list(filter)
            }
            fn import_put(&self, job: &ImportJob) -> CatalogResult<()> {
                self.inner.import_put(job)
            }
            fn import_get(&self, id: ImportId) -> CatalogResult<Option<ImportJob>> {
                self.inner.import_get(id)
            }
            fn checkpoint_get(&self, source: Source) -> CatalogResult<Option<String>> {
                self.inner.checkpoint_get(source)
            }
            fn checkpoint_put(&self, source: Source, checkpoint: Option<String>) -> CatalogResult<()> {
                self.inner.checkpoint_put(source, checkpoint)
            }
            fn reconcile_orphaned(&self, now: Timestamp) -> CatalogResult<ReconcileReport> {
                self.inner.reconcile_orphaned(now)
            }
        }
    }

    fn outage_harness() -> (Arc<outage::OutageStore>, Stager, ReviewWorkflow) {
        let store = Arc::new(outage::OutageStore::default());
        let locks = ProductLocks::new();
        let config = CatalogConfig::default();
        (
            store.clone(),
            Stager::new(store.clone(), locks.clone(), &config),
            ReviewWorkflow::new(store, locks, &config),
        )
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_leaves_change_pending() {
        use std::sync::atomic::Ordering;
        let (store, stager, review) = outage_harness();
        let change = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "S1", "price": 4.0}), "sync", None)
            .await
            .unwrap()
            .change()
            .cloned()
            .unwrap();

        store.snapshots_down.store(true, Ordering::SeqCst);
        let err = review.approve(change.change_id, "alice").await.unwrap_err();
        assert!(matches!(err, CatalogError::Storage(StorageError::Persistence { .. })));
        let stored = review.get(change.change_id).unwrap();
        assert_eq!(stored.status, ChangeStatus::Pending);
        assert!(!stored.is_awaiting_push());

        // Once storage is back the same approval goes through.
        store.snapshots_down.store(false, Ordering::SeqCst);
        let approved = review.approve(change.change_id, "alice").await.unwrap();
        assert_eq!(approved.status, ChangeStatus::Approved);
        assert_eq!(
            store.snapshot_get("S1").unwrap().unwrap().value("price"),
            &json!(4.0)
        );
    }

    #[tokio::test]
    async fn test_failed_status_write_restores_snapshot() {
        use std::sync::atomic::Ordering;
        let (store, stager, review) = outage_harness();
        store
            .inner
            .snapshot_put(&product_snapshot("S2", &[("price", json!(10.0))]))
            .unwrap();
        let update = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "S2", "price": 11.0}), "sync", None)
            .await
            .unwrap()
            .change()
            .cloned()
            .unwrap();
        let create = stager
            .stage_raw(Source::VendorFeed, &json!({"sku": "S3", "price": 3.0}), "sync", None)
            .await
            .unwrap()
            .change()
            .cloned()
            .unwrap();

        store.changes_down.store(true, Ordering::SeqCst);
        assert!(review.approve(update.change_id, "alice").await.is_err());
        assert!(review.approve(create.change_id, "alice").await.is_err());

        assert_eq!(
            store.snapshot_get("S2").unwrap().unwrap().value("price"),
            &json!(10.0)
        );
        assert!(store.snapshot_get("S3").unwrap().is_none());
        assert_eq!(review.get(update.change_id).unwrap().status, ChangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_changes_cannot_reopen() {
        let h = harness();
        let change = stage(&h, Source::Storefront, json!({"sku": "N1", "title": "New"})).await;
        h.review.reject(change.change_id, "bob").await.unwrap();

        let err = h.review.approve(change.change_id, "bob").await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Change(ChangeError::InvalidTransition { .. })
        ));
        let err = h.review.reject(change.change_id, "bob").await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Change(ChangeError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_approve_is_per_id() {
        let h = harness();
        h.store
            .snapshot_put(&product_snapshot("A", &[("price", json!(1.0))]))
            .unwrap();
        h.store
            .snapshot_put(&product_snapshot("B", &[("price", json!(9.0))]))
            .unwrap();
        h.store
            .snapshot_record_local_edit("B", "price", json!(5.0), Utc::now())
            .unwrap();

        let ok = stage(&h, Source::VendorFeed, json!({"sku": "A", "price": 2.0})).await;
        let conflicted = stage(&h, Source::VendorFeed, json!({"sku": "B", "price": 6.0})).await;
        let missing = catalog_core::new_entity_id();

        let outcome = h
            .review
            .approve_many(&[ok.change_id, conflicted.change_id, missing], "alice")
            .await;
        assert_eq!(outcome.succeeded, vec![ok.change_id]);
        assert_eq!(outcome.failed.len(), 2);
        assert!(matches!(
            outcome.failure(conflicted.change_id),
            Some(CatalogError::Change(ChangeError::UnresolvedConflict { .. }))
        ));
        assert!(matches!(
            outcome.failure(missing),
            Some(CatalogError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_custom_resolution_must_match_type() {
        let h = harness();
        h.store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(9.0))]))
            .unwrap();
        h.store
            .snapshot_record_local_edit("X1", "price", json!(10.0), Utc::now())
            .unwrap();
        let change = stage(&h, Source::VendorFeed, json!({"sku": "X1", "price": 12.0})).await;

        let err = h
            .review
            .resolve_conflict(
                change.change_id,
                "price",
                ConflictResolution::Custom,
                Some(json!("eleven")),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Change(ChangeError::InvalidCustomValue { .. })
        ));

        h.review
            .resolve_conflict(
                change.change_id,
                "price",
                ConflictResolution::Custom,
                Some(json!(11.0)),
            )
            .await
            .unwrap();
        h.review.approve(change.change_id, "alice").await.unwrap();
        let snapshot = h.store.snapshot_get("X1").unwrap().unwrap();
        assert_eq!(snapshot.value("price"), &json!(11.0));
    }

    #[tokio::test]
    async fn test_unknown_resolution_name() {
        let h = harness();
        let change = stage(&h, Source::VendorFeed, json!({"sku": "N1", "title": "New"})).await;
        let err = h
            .review
            .resolve_conflict_named(change.change_id, "title", "mine", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Change(ChangeError::InvalidResolution { .. })
        ));
    }

    #[tokio::test]
    async fn test_approve_delete_and_create() {
        let h = harness();
        let create = stage(&h, Source::Storefront, json!({"sku": "N1", "title": "New"})).await;
        assert_eq!(create.change_type, ChangeType::Create);
        h.review.approve(create.change_id, "alice").await.unwrap();
        assert_eq!(
            h.store.snapshot_get("N1").unwrap().unwrap().value("title"),
            &json!("New")
        );

        let delete = stage(&h, Source::Storefront, json!({"sku": "N1", "_deleted": true})).await;
        h.review.approve(delete.change_id, "alice").await.unwrap();
        assert!(h.store.snapshot_get("N1").unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_fully_superseded_change_applies_nothing() {
        let h = harness();
        h.store
            .snapshot_put(&product_snapshot("X1", &[("price", json!(10.0))]))
            .unwrap();
        let earlier = stage(&h, Source::Storefront, json!({"sku": "X1", "price": 11.0})).await;
        let later = stage(&h, Source::VendorFeed, json!({"sku": "X1", "price": 12.0})).await;

        h.review.approve(later.change_id, "alice").await.unwrap();
        h.review.approve(earlier.change_id, "alice").await.unwrap();
        let snapshot = h.store.snapshot_get("X1").unwrap().unwrap();
        assert_eq!(snapshot.value("price"), &json!(12.0));
    }
}
