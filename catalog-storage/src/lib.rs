//! Catalog Storage - Storage Trait and In-Memory Implementation
//!
//! Defines the persistence contract for staged changes, product snapshots,
//! batch operations, import jobs and per-source checkpoints. Concrete
//! database backends implement [`CatalogStore`]; [`MemoryStore`] is the
//! in-process implementation used by tests and single-node deployments.
//!
//! Every write to a `StagedChange` or `BatchOperation` is a compare-and-set
//! on its `version`: a caller that read a stale copy gets
//! `StorageError::VersionConflict` instead of silently overwriting.

pub mod memory;
pub mod retry;

pub use memory::MemoryStore;
pub use retry::retry_on_conflict;

use catalog_core::{
    BatchOperation, CatalogResult, ChangeFilter, ChangeId, ImportId, ImportJob, OperationFilter,
    OperationId, ProductSnapshot, Source, StagedChange, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Error text stored on operations found running with no worker at startup.
pub const ORPHANED_AT_STARTUP: &str = "orphaned at startup";

/// What startup reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub failed_operations: Vec<OperationId>,
    pub failed_imports: Vec<ImportId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.failed_operations.is_empty() && self.failed_imports.is_empty()
    }
}

/// Persistence contract for the staging engine.
pub trait CatalogStore: Send + Sync {
    // ========================================================================
    // STAGED CHANGE OPERATIONS
    // ========================================================================

    /// Insert a new change. Returns the stored copy with its first version.
    fn change_insert(&self, change: &StagedChange) -> CatalogResult<StagedChange>;

    /// Get a change by id.
    fn change_get(&self, id: ChangeId) -> CatalogResult<Option<StagedChange>>;

    /// Compare-and-set update: `change.version` must equal the stored version.
    /// Returns the stored copy with the bumped version.
    fn change_update(&self, change: &StagedChange) -> CatalogResult<StagedChange>;

    /// List changes matching a filter, highest priority first, then oldest first.
    fn change_list(&self, filter: &ChangeFilter) -> CatalogResult<Vec<StagedChange>>;

    /// Pending changes for one product, from any source.
    fn change_pending_for_product(&self, product_id: &str) -> CatalogResult<Vec<StagedChange>>;

    /// Approved changes for a source that have not been pushed yet, oldest approval first.
    fn change_awaiting_push(&self, source: Source) -> CatalogResult<Vec<StagedChange>>;

    /// Remove approved/rejected changes staged before `before`. Returns the count.
    fn change_archive_terminal(&self, before: Timestamp) -> CatalogResult<usize>;

    // ========================================================================
    // PRODUCT SNAPSHOT OPERATIONS
    // ========================================================================

    /// Get the canonical snapshot for a product.
    fn snapshot_get(&self, product_id: &str) -> CatalogResult<Option<ProductSnapshot>>;

    /// Insert or replace the canonical snapshot for a product.
    fn snapshot_put(&self, snapshot: &ProductSnapshot) -> CatalogResult<()>;

    /// Remove the canonical snapshot for a product, if any.
    fn snapshot_delete(&self, product_id: &str) -> CatalogResult<()>;

    /// Record an edit made inside the catalog, creating the snapshot if needed.
    fn snapshot_record_local_edit(
        &self,
        product_id: &str,
        field: &str,
        value: serde_json::Value,
        now: Timestamp,
    ) -> CatalogResult<ProductSnapshot> {
        let mut snapshot = self
            .snapshot_get(product_id)?
            .unwrap_or_else(|| ProductSnapshot::new(product_id, now));
        snapshot.record_local_edit(field, value, now);
        self.snapshot_put(&snapshot)?;
        Ok(snapshot)
    }

    // ========================================================================
    // BATCH OPERATION OPERATIONS
    // ========================================================================

    /// Insert a new operation. Returns the stored copy with its first version.
    fn operation_insert(&self, op: &BatchOperation) -> CatalogResult<BatchOperation>;

    /// Get an operation by id.
    fn operation_get(&self, id: OperationId) -> CatalogResult<Option<BatchOperation>>;

    /// Compare-and-set update on `op.version`.
    fn operation_update(&self, op: &BatchOperation) -> CatalogResult<BatchOperation>;

    /// List operations matching a filter, newest first.
    fn operation_list(&self, filter: &OperationFilter) -> CatalogResult<Vec<BatchOperation>>;

    // ========================================================================
    // IMPORT JOB OPERATIONS
    // ========================================================================

    /// Insert or replace an import job.
    fn import_put(&self, job: &ImportJob) -> CatalogResult<()>;

    /// Get an import job by id.
    fn import_get(&self, id: ImportId) -> CatalogResult<Option<ImportJob>>;

    // ========================================================================
    // CHECKPOINTS
    // ========================================================================

    /// Last completed pull position for a source.
    fn checkpoint_get(&self, source: Source) -> CatalogResult<Option<String>>;

    /// Store (or clear) the pull position for a source.
    fn checkpoint_put(&self, source: Source, checkpoint: Option<String>) -> CatalogResult<()>;

    // ========================================================================
    // STARTUP
    // ========================================================================

    /// Fail every operation left `running`/`pending` and every import left
    /// `downloading`/`processing` by a previous process. Paused operations
    /// are kept so they can be resumed.
    fn reconcile_orphaned(&self, now: Timestamp) -> CatalogResult<ReconcileReport>;
}
