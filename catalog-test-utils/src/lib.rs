//! Catalog Test Utilities
//!
//! Shared test infrastructure for the catalog-sync workspace:
//! - Proptest generators for records, field changes and staged changes
//! - A scripted Source Connector whose pages, throttles and failures are set up front
//! - Fixtures for common scenarios
//! - Custom assertions and tracing setup

pub use catalog_core::{
    BatchOperation, CatalogConfig, CatalogError, CatalogResult, ChangeConflict, ChangeError,
    ChangeType, ConflictResolution, ConnectorError, FetchPage, FieldChange, OperationError,
    OperationStatus, ProductSnapshot, PushOutcome, PushRejection, Source, SourceConnector,
    SourceRecord, StagedChange, StorageError, Timestamp,
};
pub use catalog_storage::MemoryStore;

pub use assertions::*;
pub use connector::ScriptedConnector;
pub use fixtures::*;
pub use generators::*;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for catalog entities.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    const CONFLICT_FIELDS: &[&str] = &["price", "cost", "title", "vendor", "inventory", "tags"];

    pub fn arb_source() -> impl Strategy<Value = Source> {
        proptest::sample::select(Source::ALL.to_vec())
    }

    pub fn arb_product_id() -> impl Strategy<Value = String> {
        "[A-Z][0-9]{1,4}"
    }

    /// Non-negative price with at most two decimals.
    pub fn arb_price() -> impl Strategy<Value = f64> {
        (0u32..100_000).prop_map(|cents| cents as f64 / 100.0)
    }

    /// A raw price as a source might send it: number, numeric string, or padded string.
    pub fn arb_raw_price() -> impl Strategy<Value = Value> {
        prop_oneof![
            arb_price().prop_map(|p| json!(p)),
            arb_price().prop_map(|p| json!(format!("{:.2}", p))),
            arb_price().prop_map(|p| json!(format!(" {} ", p))),
        ]
    }

    pub fn arb_title() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[A-Za-z][A-Za-z ]{0,15}".prop_map(Value::String),
            " [A-Za-z]{1,8} ".prop_map(Value::String),
            Just(Value::Null),
            Just(json!("")),
        ]
    }

    /// A raw connector payload that passes record validation.
    pub fn arb_raw_record() -> impl Strategy<Value = Value> {
        (
            arb_product_id(),
            proptest::option::of(arb_raw_price()),
            proptest::option::of(arb_title()),
            proptest::option::of(0u32..10_000),
            proptest::option::of(proptest::collection::vec("[a-z]{1,6}", 0..3)),
        )
            .prop_map(|(sku, price, title, inventory, tags)| {
                let mut object = serde_json::Map::new();
                object.insert("sku".to_string(), json!(sku));
                if let Some(price) = price {
                    object.insert("price".to_string(), price);
                }
                if let Some(title) = title {
                    object.insert("title".to_string(), title);
                }
                if let Some(inventory) = inventory {
                    object.insert("inventory".to_string(), json!(inventory));
                }
                if let Some(tags) = tags {
                    object.insert("tags".to_string(), json!(tags));
                }
                Value::Object(object)
            })
    }

    /// A validated record from any source.
    pub fn arb_source_record() -> impl Strategy<Value = SourceRecord> {
        (arb_source(), arb_raw_record()).prop_filter_map("record must validate", |(source, raw)| {
            SourceRecord::parse(source, &raw).ok()
        })
    }

    /// Resolution to apply to a generated conflict; `None` leaves it open.
    pub fn arb_resolution() -> impl Strategy<Value = Option<ConflictResolution>> {
        prop_oneof![
            Just(None),
            Just(Some(ConflictResolution::Local)),
            Just(Some(ConflictResolution::Remote)),
            Just(Some(ConflictResolution::Custom)),
        ]
    }

    /// A pending change carrying 1..=6 numeric conflicts, each resolved or not at random.
    pub fn arb_staged_change_with_conflicts() -> impl Strategy<Value = StagedChange> {
        (
            arb_source(),
            arb_product_id(),
            proptest::collection::vec(arb_resolution(), 1..=CONFLICT_FIELDS.len()),
        )
            .prop_map(|(source, product_id, resolutions)| {
                let now = Utc::now();
                let mut fields = Vec::new();
                let mut conflicts = Vec::new();
                for (i, resolution) in resolutions.into_iter().enumerate() {
                    let name = CONFLICT_FIELDS[i];
                    let local = json!(i as f64 + 1.0);
                    let remote = json!(i as f64 + 2.0);
                    fields.push(FieldChange::new(name, local.clone(), remote.clone()));
                    let mut conflict = ChangeConflict::new(name, local, remote, None, now);
                    if let Some(resolution) = resolution {
                        conflict.resolution = Some(resolution);
                        if resolution == ConflictResolution::Custom {
                            conflict.custom_value = Some(json!(99.5));
                        }
                    }
                    conflicts.push(conflict);
                }
                let mut change =
                    StagedChange::new(source, product_id, ChangeType::Update, fields, "proptest", now);
                change.conflicts = conflicts;
                change
            })
    }
}

// ============================================================================
// SCRIPTED CONNECTOR
// ============================================================================

pub mod connector {
    //! A Source Connector over an in-memory record list.
    //!
    //! Checkpoints are decimal offsets into the list. Throttles, systemic
    //! failures and push rejections are scripted before the run; an
    //! optional gate holds every fetch until the test releases a permit.

    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::Semaphore;

    #[derive(Debug, Default)]
    struct Script {
        throttle_at: BTreeSet<usize>,
        retry_after_ms: Option<u64>,
        fail_at: Option<(usize, ConnectorError)>,
        push_failure: Option<ConnectorError>,
        reject_products: HashMap<String, String>,
        fetch_log: Vec<Option<String>>,
        pushed: Vec<StagedChange>,
        push_calls: usize,
    }

    #[derive(Debug, Clone)]
    pub struct ScriptedConnector {
        source: Source,
        records: Arc<Vec<Value>>,
        script: Arc<Mutex<Script>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedConnector {
        pub fn new(source: Source, records: Vec<Value>) -> Self {
            Self {
                source,
                records: Arc::new(records),
                script: Arc::new(Mutex::new(Script::default())),
                gate: None,
            }
        }

        /// `count` records `{"sku": "P00001", "price": n}` for products 1..=count.
        pub fn with_products(source: Source, count: usize) -> Self {
            let records = (1..=count)
                .map(|n| serde_json::json!({"sku": format!("P{:05}", n), "price": n as f64}))
                .collect();
            Self::new(source, records)
        }

        /// Throttle (once) the first fetch whose page would include `offset`.
        /// Records before `offset` on that page are still returned.
        pub fn throttle_at(self, offset: usize) -> Self {
            self.script().throttle_at.insert(offset);
            self
        }

        pub fn retry_after_ms(self, ms: u64) -> Self {
            self.script().retry_after_ms = Some(ms);
            self
        }

        /// Fail every fetch starting at or after `offset`.
        pub fn fail_at(self, offset: usize, error: ConnectorError) -> Self {
            self.script().fail_at = Some((offset, error));
            self
        }

        pub fn fail_pushes(self, error: ConnectorError) -> Self {
            self.script().push_failure = Some(error);
            self
        }

        /// Reject pushed changes for `product_id` with `reason`.
        pub fn reject_product(self, product_id: &str, reason: &str) -> Self {
            self.script()
                .reject_products
                .insert(product_id.to_string(), reason.to_string());
            self
        }

        /// Hold every fetch until a permit is released on the returned semaphore.
        pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            self.gate = Some(gate.clone());
            (self, gate)
        }

        /// Checkpoints passed to every fetch, in call order.
        pub fn fetch_log(&self) -> Vec<Option<String>> {
            self.script().fetch_log.clone()
        }

        pub fn pushed(&self) -> Vec<StagedChange> {
            self.script().pushed.clone()
        }

        pub fn push_calls(&self) -> usize {
            self.script().push_calls
        }

        pub fn record_count(&self) -> usize {
            self.records.len()
        }

        fn script(&self) -> MutexGuard<'_, Script> {
            match self.script.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for ScriptedConnector {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch_changes(
            &self,
            checkpoint: Option<&str>,
            page_size: usize,
        ) -> Result<FetchPage, ConnectorError> {
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let mut script = self.script();
            script.fetch_log.push(checkpoint.map(str::to_string));

            let offset = checkpoint
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0)
                .min(self.records.len());
            if let Some((at, error)) = &script.fail_at {
                if offset >= *at {
                    return Err(error.clone());
                }
            }

            let end = (offset + page_size).min(self.records.len());
            let throttle = script
                .throttle_at
                .range(offset..end.max(offset + 1))
                .next()
                .copied();
            if let Some(at) = throttle {
                script.throttle_at.remove(&at);
                return Ok(FetchPage {
                    records: self.records[offset..at.min(end)].to_vec(),
                    next_checkpoint: Some(at.to_string()),
                    has_more: true,
                    rate_limited: true,
                    resume_cursor: Some(at.to_string()),
                    retry_after_ms: script.retry_after_ms,
                    total: Some(self.records.len() as u64),
                });
            }

            Ok(FetchPage {
                records: self.records[offset..end].to_vec(),
                next_checkpoint: Some(end.to_string()),
                has_more: end < self.records.len(),
                rate_limited: false,
                resume_cursor: None,
                retry_after_ms: None,
                total: Some(self.records.len() as u64),
            })
        }

        async fn push_changes(
            &self,
            changes: &[StagedChange],
        ) -> Result<PushOutcome, ConnectorError> {
            let mut script = self.script();
            script.push_calls += 1;
            if let Some(error) = &script.push_failure {
                return Err(error.clone());
            }
            let mut outcome = PushOutcome::default();
            for change in changes {
                match script.reject_products.get(&change.product_id) {
                    Some(reason) => outcome.rejected.push(PushRejection {
                        change_id: change.change_id,
                        reason: reason.clone(),
                    }),
                    None => outcome.accepted.push(change.change_id),
                }
            }
            script.pushed.extend(changes.iter().cloned());
            Ok(outcome)
        }
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    /// A snapshot whose fields were all synced from a source, with no local edits.
    pub fn product_snapshot(product_id: &str, fields: &[(&str, Value)]) -> ProductSnapshot {
        let now = Utc::now();
        let mut snapshot = ProductSnapshot::new(product_id, now);
        for (field, value) in fields {
            snapshot.apply_synced(field, value.clone(), Source::Internal, now);
        }
        snapshot
    }

    /// A validated record, panicking on invalid input.
    pub fn source_record(source: Source, raw: Value) -> SourceRecord {
        match SourceRecord::parse(source, &raw) {
            Ok(record) => record,
            Err(e) => panic!("fixture record failed validation: {}", e),
        }
    }

    /// CSV import file with `rows` products, every `bad_every`-th row carrying a negative price.
    pub fn import_csv(rows: usize, bad_every: Option<usize>) -> Vec<u8> {
        let mut out = String::from("sku,title,price,inventory\n");
        for n in 1..=rows {
            let bad = bad_every.is_some_and(|k| k > 0 && n % k == 0);
            let price = if bad { "-1".to_string() } else { format!("{}.99", n % 100) };
            out.push_str(&format!("IMP{:05},Item {},{},{}\n", n, n, price, n % 50));
        }
        out.into_bytes()
    }

    /// Config with small pages for fast pull tests.
    pub fn small_page_config(page_size: usize) -> CatalogConfig {
        CatalogConfig {
            pull_page_size: page_size,
            ..CatalogConfig::default()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for catalog error variants.

    use super::*;

    #[track_caller]
    pub fn assert_unresolved_conflict<T: std::fmt::Debug>(result: &CatalogResult<T>) {
        match result {
            Err(CatalogError::Change(ChangeError::UnresolvedConflict { .. })) => {}
            other => panic!("Expected UnresolvedConflict, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_already_running<T: std::fmt::Debug>(result: &CatalogResult<T>) {
        match result {
            Err(CatalogError::Operation(OperationError::OperationAlreadyRunning { .. })) => {}
            other => panic!("Expected OperationAlreadyRunning, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_validated<T: std::fmt::Debug>(result: &CatalogResult<T>) {
        match result {
            Err(CatalogError::Operation(OperationError::NotValidated { .. })) => {}
            other => panic!("Expected NotValidated, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CatalogResult<T>) {
        match result {
            Err(CatalogError::Storage(StorageError::NotFound { .. })) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Terminal operations stay terminal and keep consistent counts.
    #[track_caller]
    pub fn assert_terminal_consistent(op: &BatchOperation) {
        assert!(op.status.is_terminal(), "operation {} not terminal: {}", op.id, op.status);
        assert!(op.counts_consistent(), "inconsistent counts on {}: {:?}", op.id, op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_scripted_pages_and_throttle() {
        let connector = ScriptedConnector::with_products(Source::VendorFeed, 10).throttle_at(6);

        let first = connector.fetch_changes(None, 4).await.unwrap();
        assert_eq!(first.records.len(), 4);
        assert_eq!(first.next_checkpoint.as_deref(), Some("4"));
        assert!(first.has_more);

        let throttled = connector.fetch_changes(Some("4"), 4).await.unwrap();
        assert!(throttled.rate_limited);
        assert_eq!(throttled.records.len(), 2);
        assert_eq!(throttled.resume_cursor.as_deref(), Some("6"));

        let resumed = connector.fetch_changes(Some("6"), 4).await.unwrap();
        assert!(!resumed.rate_limited);
        assert_eq!(resumed.records.len(), 4);
        assert!(!resumed.has_more);
        assert_eq!(connector.fetch_log().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_push_rejection() {
        let connector =
            ScriptedConnector::new(Source::Storefront, vec![]).reject_product("B", "unknown sku");
        let now = chrono::Utc::now();
        let a = StagedChange::new(Source::Storefront, "A", ChangeType::Update, vec![], "t", now);
        let b = StagedChange::new(Source::Storefront, "B", ChangeType::Update, vec![], "t", now);
        let outcome = connector.push_changes(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(outcome.accepted, vec![a.change_id]);
        assert_eq!(outcome.rejected[0].change_id, b.change_id);
        assert_eq!(connector.pushed().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_records_validate(raw in arb_raw_record(), source in arb_source()) {
            prop_assert!(SourceRecord::parse(source, &raw).is_ok());
        }
    }
}
