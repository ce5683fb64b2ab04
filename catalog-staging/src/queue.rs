//! Push queue: approved changes waiting for a push stage
//!
//! The queue is a view over the store, not a separate structure. A change
//! leaves it when the push stage records either an acceptance or a
//! connector rejection.

use catalog_core::{
    CatalogConfig, CatalogError, CatalogResult, ChangeId, ChangeType, EntityKind, Source,
    StagedChange, StorageError, Timestamp,
};
use catalog_storage::{retry_on_conflict, CatalogStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which approved changes a push stage drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushScope {
    /// Sync operations push everything
    All,
    /// Update operations skip deletes
    NonDelete,
    /// Delete operations push deletes only
    DeleteOnly,
}

impl PushScope {
    pub fn includes(self, change_type: ChangeType) -> bool {
        match self {
            PushScope::All => true,
            PushScope::NonDelete => change_type != ChangeType::Delete,
            PushScope::DeleteOnly => change_type == ChangeType::Delete,
        }
    }
}

#[derive(Clone)]
pub struct PushQueue {
    store: Arc<dyn CatalogStore>,
    cas_retries: u32,
}

impl PushQueue {
    pub fn new(store: Arc<dyn CatalogStore>, config: &CatalogConfig) -> Self {
        Self {
            store,
            cas_retries: config.cas_retry_limit,
        }
    }

    /// Approved, unpushed changes for a source in approval order.
    pub fn pending(&self, source: Source, scope: PushScope) -> CatalogResult<Vec<StagedChange>> {
        Ok(self
            .store
            .change_awaiting_push(source)?
            .into_iter()
            .filter(|c| scope.includes(c.change_type))
            .collect())
    }

    /// Number of queued changes across all sources.
    pub fn size(&self) -> CatalogResult<usize> {
        let mut total = 0;
        for source in Source::ALL {
            total += self.store.change_awaiting_push(*source)?.len();
        }
        Ok(total)
    }

    /// Record that the connector accepted a change.
    pub fn mark_pushed(&self, change_id: ChangeId, now: Timestamp) -> CatalogResult<StagedChange> {
        let change = retry_on_conflict(self.cas_retries, || {
            let mut change = self.get(change_id)?;
            change.pushed_at = Some(now);
            change.push_error = None;
            change.updated_at = now;
            self.store.change_update(&change)
        })?;
        debug!(change_id = %change_id, "Change pushed");
        Ok(change)
    }

    /// Record that the connector rejected a change. It is not retried.
    pub fn mark_failed(
        &self,
        change_id: ChangeId,
        reason: &str,
        now: Timestamp,
    ) -> CatalogResult<StagedChange> {
        let change = retry_on_conflict(self.cas_retries, || {
            let mut change = self.get(change_id)?;
            change.push_error = Some(reason.to_string());
            change.updated_at = now;
            self.store.change_update(&change)
        })?;
        warn!(change_id = %change_id, reason, "Push rejected by connector");
        Ok(change)
    }

    fn get(&self, change_id: ChangeId) -> CatalogResult<StagedChange> {
        self.store.change_get(change_id)?.ok_or_else(|| {
            CatalogError::Storage(StorageError::NotFound {
                entity: EntityKind::StagedChange,
                id: change_id.to_string(),
            })
        })
    }
}
