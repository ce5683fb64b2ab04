//! Persisted, observable view of one running operation
//!
//! The worker mutates its operation only through [`OperationTracker::update`],
//! which writes with compare-and-set and re-applies the mutation to a fresh
//! copy after a lost race. Status and progress events go out after the
//! write succeeds.

use catalog_core::{BatchOperation, CatalogError, CatalogResult, EntityKind, OperationError, StorageError};
use catalog_events::{EventType, NotificationBus, Topic};
use catalog_storage::{retry_on_conflict, CatalogStore};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct OperationTracker {
    op: BatchOperation,
    store: Arc<dyn CatalogStore>,
    bus: NotificationBus,
    retries: u32,
}

impl OperationTracker {
    pub fn new(
        op: BatchOperation,
        store: Arc<dyn CatalogStore>,
        bus: NotificationBus,
        retries: u32,
    ) -> Self {
        Self {
            op,
            store,
            bus,
            retries,
        }
    }

    pub fn op(&self) -> &BatchOperation {
        &self.op
    }

    /// Apply `mutate` and persist the result.
    pub fn update<F>(&mut self, mut mutate: F) -> CatalogResult<&BatchOperation>
    where
        F: FnMut(&mut BatchOperation) -> Result<(), OperationError>,
    {
        let store = &self.store;
        let id = self.op.id;
        let mut base = Some(self.op.clone());
        let stored = retry_on_conflict(self.retries, || {
            let mut next = match base.take() {
                Some(op) => op,
                None => store.operation_get(id)?.ok_or_else(|| {
                    CatalogError::Storage(StorageError::NotFound {
                        entity: EntityKind::BatchOperation,
                        id: id.to_string(),
                    })
                })?,
            };
            mutate(&mut next)?;
            store.operation_update(&next)
        })?;
        self.op = stored;
        Ok(&self.op)
    }

    fn status_topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::Operation(self.op.id)];
        if let Some(source) = self.op.source {
            topics.push(Topic::SourceStatus(source));
        }
        if let Some(import_id) = self.op.import_id {
            topics.push(Topic::Import(import_id));
        }
        topics
    }

    fn progress_topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::Operation(self.op.id)];
        if let Some(source) = self.op.source {
            topics.push(Topic::SourceProgress(source));
        }
        if let Some(import_id) = self.op.import_id {
            topics.push(Topic::Import(import_id));
        }
        topics
    }

    /// Close the per-operation and per-import topics once the terminal event is out.
    /// Source topics outlive any single operation.
    pub fn close_topics(&self) {
        self.bus.close(Topic::Operation(self.op.id));
        if let Some(import_id) = self.op.import_id {
            self.bus.close(Topic::Import(import_id));
        }
    }

    /// Publish a status transition on the operation and source-status topics.
    pub fn publish_status(&self, event_type: EventType, message: &str) {
        self.bus
            .publish_all(&self.status_topics(), event_type, status_payload(&self.op, message));
    }

    /// Publish current counters on the operation and source-progress topics.
    pub fn publish_progress(&self, stage: &str) {
        let current_item = self
            .op
            .stage(stage)
            .and_then(|s| s.current_item.clone());
        self.bus.publish_all(
            &self.progress_topics(),
            EventType::Progress,
            json!({
                "operation_id": self.op.id,
                "stage": stage,
                "current_item": current_item,
                "total_progress": self.op.total_progress,
                "items_processed": self.op.items_processed,
                "total_items": self.op.total_items,
                "successful_items": self.op.successful_items,
                "failed_items": self.op.failed_items,
            }),
        );
    }

    /// Publish a free-text `log` event on the operation topic.
    pub fn log(&self, message: impl Into<String>) {
        self.bus.log(Topic::Operation(self.op.id), message);
    }
}

pub(crate) fn status_payload(op: &BatchOperation, message: &str) -> Value {
    json!({
        "operation_id": op.id,
        "operation_type": op.operation_type,
        "source": op.source,
        "status": op.status,
        "message": message,
        "pause_reason": op.pause_reason,
        "resume_cursor": op.resume_cursor,
        "error": op.error,
        "items_processed": op.items_processed,
        "total_items": op.total_items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{OperationStatus, OperationType, Source};
    use catalog_storage::MemoryStore;
    use chrono::Utc;

    #[test]
    fn test_update_recovers_from_stale_copy() {
        let store = Arc::new(MemoryStore::new());
        let bus = NotificationBus::default();
        let now = Utc::now();
        let op = store
            .operation_insert(&BatchOperation::new(OperationType::Sync, Some(Source::Storefront), now))
            .unwrap();

        // Someone else bumps the version behind the tracker's back.
        let mut other = op.clone();
        other.total_items = 7;
        store.operation_update(&other).unwrap();

        let mut tracker = OperationTracker::new(op, store.clone(), bus, 1);
        tracker.update(|op| op.mark_pending(now)).unwrap();
        assert_eq!(tracker.op().status, OperationStatus::Pending);
        assert_eq!(tracker.op().total_items, 7);
        assert_eq!(tracker.op().version, 3);
    }

    #[test]
    fn test_status_events_reach_source_topic() {
        let store = Arc::new(MemoryStore::new());
        let bus = NotificationBus::default();
        let op = store
            .operation_insert(&BatchOperation::new(
                OperationType::Sync,
                Some(Source::VendorFeed),
                Utc::now(),
            ))
            .unwrap();
        let tracker = OperationTracker::new(op, store, bus.clone(), 1);
        tracker.publish_status(EventType::Start, "started");
        tracker.publish_progress("pull");

        assert_eq!(bus.last_seq(Topic::Operation(tracker.op().id)), 2);
        assert_eq!(bus.last_seq(Topic::SourceStatus(Source::VendorFeed)), 1);
        assert_eq!(bus.last_seq(Topic::SourceProgress(Source::VendorFeed)), 1);
        let events = bus.poll(Topic::SourceStatus(Source::VendorFeed), 0);
        assert_eq!(events[0].payload["message"], "started");
    }
}
