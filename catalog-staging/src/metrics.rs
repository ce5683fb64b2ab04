//! SyncMetrics projection
//!
//! Computed from the store on every call. Nothing here is cached.

use catalog_core::{
    CatalogResult, ChangeFilter, ChangeStatus, OperationFilter, OperationStatus, OperationType,
    SyncMetrics, Timestamp,
};
use catalog_storage::CatalogStore;
use chrono::Duration;

/// Window over which `sync_rate` is averaged.
const RATE_WINDOW_MINUTES: i64 = 60;

pub fn project(store: &dyn CatalogStore, now: Timestamp) -> CatalogResult<SyncMetrics> {
    let pending = store.change_list(&ChangeFilter {
        status: Some(ChangeStatus::Pending),
        ..Default::default()
    })?;
    let conflicts: usize = pending.iter().map(|c| c.unresolved_fields().len()).sum();

    let approved = store.change_list(&ChangeFilter {
        status: Some(ChangeStatus::Approved),
        ..Default::default()
    })?;
    let queue_size = approved.iter().filter(|c| c.is_awaiting_push()).count();

    let operations = store.operation_list(&OperationFilter::default())?;
    let active_operations = operations.iter().filter(|o| o.status.is_active()).count();

    let last_sync = operations
        .iter()
        .filter(|o| {
            o.operation_type == OperationType::Sync && o.status == OperationStatus::Completed
        })
        .filter_map(|o| o.completed_at)
        .max();

    let window_start = now - Duration::minutes(RATE_WINDOW_MINUTES);
    let processed_in_window: u64 = operations
        .iter()
        .filter(|o| o.status == OperationStatus::Completed)
        .filter(|o| o.completed_at.is_some_and(|t| t >= window_start && t <= now))
        .map(|o| o.items_processed)
        .sum();
    let sync_rate = processed_in_window as f64 / RATE_WINDOW_MINUTES as f64;

    Ok(SyncMetrics {
        pending_changes: pending.len() as u64,
        conflicts: conflicts as u64,
        queue_size: queue_size as u64,
        active_operations: active_operations as u64,
        last_sync,
        sync_rate,
        computed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{
        BatchOperation, ChangeConflict, ChangeType, FieldChange, Source, StagedChange,
    };
    use catalog_storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_empty_store() {
        let store = MemoryStore::new();
        let metrics = project(&store, Utc::now()).unwrap();
        assert_eq!(metrics.pending_changes, 0);
        assert_eq!(metrics.conflicts, 0);
        assert_eq!(metrics.last_sync, None);
        assert_eq!(metrics.sync_rate, 0.0);
    }

    #[test]
    fn test_counts_follow_store_state() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut conflicted = StagedChange::new(
            Source::VendorFeed,
            "A",
            ChangeType::Price,
            vec![FieldChange::new("price", json!(1.0), json!(2.0))],
            "sync",
            now,
        );
        conflicted
            .conflicts
            .push(ChangeConflict::new("price", json!(1.5), json!(2.0), None, now));
        store.change_insert(&conflicted).unwrap();

        let mut queued = StagedChange::new(Source::Storefront, "B", ChangeType::Update, vec![], "sync", now);
        queued.approve("alice", now).unwrap();
        store.change_insert(&queued).unwrap();

        let mut sync = BatchOperation::new(OperationType::Sync, Some(Source::VendorFeed), now);
        sync.mark_pending(now).unwrap();
        sync.mark_running(now).unwrap();
        sync.items_processed = 120;
        sync.mark_completed(now).unwrap();
        store.operation_insert(&sync).unwrap();

        let mut running = BatchOperation::new(OperationType::Update, Some(Source::Storefront), now);
        running.mark_pending(now).unwrap();
        store.operation_insert(&running).unwrap();

        let metrics = project(&store, now).unwrap();
        assert_eq!(metrics.pending_changes, 1);
        assert_eq!(metrics.conflicts, 1);
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(metrics.active_operations, 1);
        assert_eq!(metrics.last_sync, Some(now));
        assert!((metrics.sync_rate - 2.0).abs() < 1e-9);

        // Projection recomputed after a change leaves pending.
        let stored = store.change_get(conflicted.change_id).unwrap().unwrap();
        let mut rejected = stored.clone();
        rejected.reject("bob", now).unwrap();
        store.change_update(&rejected).unwrap();
        let metrics = project(&store, now).unwrap();
        assert_eq!(metrics.pending_changes, 0);
        assert_eq!(metrics.conflicts, 0);
    }
}
