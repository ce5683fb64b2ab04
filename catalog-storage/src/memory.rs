//! In-memory store with compare-and-set writes and JSON snapshot persistence

use crate::{CatalogStore, ReconcileReport, ORPHANED_AT_STARTUP};
use catalog_core::{
    BatchOperation, CatalogError, CatalogResult, ChangeFilter, ChangeId, ChangeStatus, EntityKind,
    ImportId, ImportJob, OperationFilter, OperationId, OperationStatus, ProductSnapshot, Source,
    StagedChange, StorageError, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};
use uuid::Uuid;

type Table<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// In-memory catalog store.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    changes: Table<ChangeId, StagedChange>,
    snapshots: Table<String, ProductSnapshot>,
    operations: Table<OperationId, BatchOperation>,
    imports: Table<ImportId, ImportJob>,
    checkpoints: Table<Source, String>,
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreImage {
    changes: Vec<StagedChange>,
    snapshots: Vec<ProductSnapshot>,
    operations: Vec<BatchOperation>,
    imports: Vec<ImportJob>,
    checkpoints: Vec<(Source, String)>,
}

fn read<K, V>(table: &Table<K, V>) -> CatalogResult<RwLockReadGuard<'_, HashMap<K, V>>> {
    table
        .read()
        .map_err(|_| CatalogError::Storage(StorageError::LockPoisoned))
}

fn write<K, V>(table: &Table<K, V>) -> CatalogResult<RwLockWriteGuard<'_, HashMap<K, V>>> {
    table
        .write()
        .map_err(|_| CatalogError::Storage(StorageError::LockPoisoned))
}

fn not_found(entity: EntityKind, id: impl ToString) -> CatalogError {
    CatalogError::Storage(StorageError::NotFound {
        entity,
        id: id.to_string(),
    })
}

fn already_exists(entity: EntityKind, id: impl ToString) -> CatalogError {
    CatalogError::Storage(StorageError::AlreadyExists {
        entity,
        id: id.to_string(),
    })
}

fn version_conflict(entity: EntityKind, id: Uuid, expected: u64, actual: u64) -> CatalogError {
    CatalogError::Storage(StorageError::VersionConflict {
        entity,
        id: id.to_string(),
        expected,
        actual,
    })
}

fn persistence(reason: impl ToString) -> CatalogError {
    CatalogError::Storage(StorageError::Persistence {
        reason: reason.to_string(),
    })
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored changes, terminal ones included.
    pub fn change_count(&self) -> usize {
        self.changes.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Number of stored operations.
    pub fn operation_count(&self) -> usize {
        self.operations.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Persist the whole store as JSON.
    ///
    /// Writes to a sibling temp file first and renames it over `path`, so a
    /// crash mid-write leaves the previous file intact.
    pub fn save_to(&self, path: impl AsRef<Path>) -> CatalogResult<()> {
        let path = path.as_ref();
        let image = StoreImage {
            changes: read(&self.changes)?.values().cloned().collect(),
            snapshots: read(&self.snapshots)?.values().cloned().collect(),
            operations: read(&self.operations)?.values().cloned().collect(),
            imports: read(&self.imports)?.values().cloned().collect(),
            checkpoints: read(&self.checkpoints)?
                .iter()
                .map(|(s, c)| (*s, c.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&image).map_err(persistence)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(persistence)?;
        std::fs::rename(&tmp, path).map_err(persistence)?;

        info!(
            path = %path.display(),
            changes = image.changes.len(),
            operations = image.operations.len(),
            "Saved catalog store"
        );
        Ok(())
    }

    /// Load a store previously written by [`MemoryStore::save_to`].
    ///
    /// A missing file yields an empty store.
    pub fn load_from(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No catalog store file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(persistence(e)),
        };
        let image: StoreImage = serde_json::from_slice(&bytes).map_err(persistence)?;

        let store = Self::new();
        {
            let mut changes = write(&store.changes)?;
            changes.extend(image.changes.into_iter().map(|c| (c.change_id, c)));
            let mut snapshots = write(&store.snapshots)?;
            snapshots.extend(
                image
                    .snapshots
                    .into_iter()
                    .map(|s| (s.product_id.clone(), s)),
            );
            let mut operations = write(&store.operations)?;
            operations.extend(image.operations.into_iter().map(|o| (o.id, o)));
            let mut imports = write(&store.imports)?;
            imports.extend(image.imports.into_iter().map(|j| (j.id, j)));
            let mut checkpoints = write(&store.checkpoints)?;
            checkpoints.extend(image.checkpoints);
        }

        info!(path = %path.display(), changes = store.change_count(), "Loaded catalog store");
        Ok(store)
    }
}

impl CatalogStore for MemoryStore {
    // === Staged Change Operations ===

    fn change_insert(&self, change: &StagedChange) -> CatalogResult<StagedChange> {
        let mut changes = write(&self.changes)?;
        if changes.contains_key(&change.change_id) {
            return Err(already_exists(EntityKind::StagedChange, change.change_id));
        }
        let mut stored = change.clone();
        stored.version = 1;
        changes.insert(stored.change_id, stored.clone());
        Ok(stored)
    }

    fn change_get(&self, id: ChangeId) -> CatalogResult<Option<StagedChange>> {
        Ok(read(&self.changes)?.get(&id).cloned())
    }

    fn change_update(&self, change: &StagedChange) -> CatalogResult<StagedChange> {
        let mut changes = write(&self.changes)?;
        let current = changes
            .get_mut(&change.change_id)
            .ok_or_else(|| not_found(EntityKind::StagedChange, change.change_id))?;
        if current.version != change.version {
            return Err(version_conflict(
                EntityKind::StagedChange,
                change.change_id,
                change.version,
                current.version,
            ));
        }
        let mut stored = change.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    fn change_list(&self, filter: &ChangeFilter) -> CatalogResult<Vec<StagedChange>> {
        let changes = read(&self.changes)?;
        let mut result: Vec<StagedChange> = changes
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.staged_at.cmp(&b.staged_at))
                .then(a.change_id.cmp(&b.change_id))
        });
        Ok(result)
    }

    fn change_pending_for_product(&self, product_id: &str) -> CatalogResult<Vec<StagedChange>> {
        let changes = read(&self.changes)?;
        let mut result: Vec<StagedChange> = changes
            .values()
            .filter(|c| c.product_id == product_id && c.status == ChangeStatus::Pending)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.staged_at.cmp(&b.staged_at));
        Ok(result)
    }

    fn change_awaiting_push(&self, source: Source) -> CatalogResult<Vec<StagedChange>> {
        let changes = read(&self.changes)?;
        let mut result: Vec<StagedChange> = changes
            .values()
            .filter(|c| c.source == source && c.is_awaiting_push())
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.reviewed_at
                .cmp(&b.reviewed_at)
                .then(a.change_id.cmp(&b.change_id))
        });
        Ok(result)
    }

    fn change_archive_terminal(&self, before: Timestamp) -> CatalogResult<usize> {
        let mut changes = write(&self.changes)?;
        let count_before = changes.len();
        changes.retain(|_, c| {
            !(c.status.is_terminal() && !c.is_awaiting_push() && c.staged_at < before)
        });
        Ok(count_before - changes.len())
    }

    // === Product Snapshot Operations ===

    fn snapshot_get(&self, product_id: &str) -> CatalogResult<Option<ProductSnapshot>> {
        Ok(read(&self.snapshots)?.get(product_id).cloned())
    }

    fn snapshot_put(&self, snapshot: &ProductSnapshot) -> CatalogResult<()> {
        write(&self.snapshots)?.insert(snapshot.product_id.clone(), snapshot.clone());
        Ok(())
    }

    fn snapshot_delete(&self, product_id: &str) -> CatalogResult<()> {
        write(&self.snapshots)?.remove(product_id);
        Ok(())
    }

    // === Batch Operation Operations ===

    fn operation_insert(&self, op: &BatchOperation) -> CatalogResult<BatchOperation> {
        let mut operations = write(&self.operations)?;
        if operations.contains_key(&op.id) {
            return Err(already_exists(EntityKind::BatchOperation, op.id));
        }
        let mut stored = op.clone();
        stored.version = 1;
        operations.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn operation_get(&self, id: OperationId) -> CatalogResult<Option<BatchOperation>> {
        Ok(read(&self.operations)?.get(&id).cloned())
    }

    fn operation_update(&self, op: &BatchOperation) -> CatalogResult<BatchOperation> {
        let mut operations = write(&self.operations)?;
        let current = operations
            .get_mut(&op.id)
            .ok_or_else(|| not_found(EntityKind::BatchOperation, op.id))?;
        if current.version != op.version {
            return Err(version_conflict(
                EntityKind::BatchOperation,
                op.id,
                op.version,
                current.version,
            ));
        }
        let mut stored = op.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    fn operation_list(&self, filter: &OperationFilter) -> CatalogResult<Vec<BatchOperation>> {
        let operations = read(&self.operations)?;
        let mut result: Vec<BatchOperation> = operations
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(result)
    }

    // === Import Job Operations ===

    fn import_put(&self, job: &ImportJob) -> CatalogResult<()> {
        write(&self.imports)?.insert(job.id, job.clone());
        Ok(())
    }

    fn import_get(&self, id: ImportId) -> CatalogResult<Option<ImportJob>> {
        Ok(read(&self.imports)?.get(&id).cloned())
    }

    // === Checkpoints ===

    fn checkpoint_get(&self, source: Source) -> CatalogResult<Option<String>> {
        Ok(read(&self.checkpoints)?.get(&source).cloned())
    }

    fn checkpoint_put(&self, source: Source, checkpoint: Option<String>) -> CatalogResult<()> {
        let mut checkpoints = write(&self.checkpoints)?;
        match checkpoint {
            Some(c) => {
                checkpoints.insert(source, c);
            }
            None => {
                checkpoints.remove(&source);
            }
        }
        Ok(())
    }

    // === Startup ===

    fn reconcile_orphaned(&self, now: Timestamp) -> CatalogResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut operations = write(&self.operations)?;
        for op in operations.values_mut() {
            if matches!(op.status, OperationStatus::Running | OperationStatus::Pending) {
                op.mark_failed(ORPHANED_AT_STARTUP, now)
                    .map_err(CatalogError::from)?;
                for stage in op.stages.iter_mut() {
                    if stage.status == catalog_core::StageStatus::Running {
                        stage.status = catalog_core::StageStatus::Error;
                        stage.error = Some(ORPHANED_AT_STARTUP.to_string());
                    }
                }
                op.version += 1;
                warn!(operation_id = %op.id, "Failed orphaned operation at startup");
                report.failed_operations.push(op.id);
            }
        }

        let mut imports = write(&self.imports)?;
        for job in imports.values_mut() {
            if matches!(
                job.status,
                catalog_core::ImportStatus::Downloading | catalog_core::ImportStatus::Processing
            ) {
                job.fail(ORPHANED_AT_STARTUP, now)
                    .map_err(CatalogError::from)?;
                warn!(import_id = %job.id, "Failed orphaned import at startup");
                report.failed_imports.push(job.id);
            }
        }

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
