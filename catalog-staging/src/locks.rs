//! Per-product serialization

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Async mutex per product id.
///
/// Diffing, staging and approval of the same product never interleave;
/// different products proceed in parallel. A product's mutex lives only
/// while someone holds or waits on it.
#[derive(Debug, Clone, Default)]
pub struct ProductLocks {
    locks: LockTable,
}

/// Exclusive access to one product, released on drop.
#[must_use]
#[derive(Debug)]
pub struct ProductGuard {
    product_id: String,
    locks: LockTable,
    _held: OwnedMutexGuard<()>,
}

impl Drop for ProductGuard {
    fn drop(&mut self) {
        // The table and this guard hold one reference each; any more means waiters.
        self.locks
            .remove_if(&self.product_id, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}

impl ProductLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a product.
    pub async fn lock(&self, product_id: &str) -> ProductGuard {
        let mutex = self
            .locks
            .entry(product_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ProductGuard {
            product_id: product_id.to_string(),
            locks: self.locks.clone(),
            _held: mutex.lock_owned().await,
        }
    }

    /// Number of products currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
