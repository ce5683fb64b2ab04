//! Source Connector contract
//!
//! Each external source (storefront, vendor feed, inventory authority) is
//! reached through an adapter implementing [`SourceConnector`]. Transport,
//! authentication and pagination mechanics stay inside the adapter; the
//! engine only sees opaque checkpoints and raw JSON records, which it
//! validates itself through `SourceRecord::parse`.

use crate::{ChangeId, ConnectorError, Source, StagedChange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page of changed records returned by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPage {
    /// Raw records, validated by the caller
    pub records: Vec<Value>,
    /// Position of the page after this one
    pub next_checkpoint: Option<String>,
    /// Whether more pages remain after `next_checkpoint`
    pub has_more: bool,
    /// The source throttled this call; `records` may be partial or empty
    pub rate_limited: bool,
    /// Where to resume when `rate_limited` is set
    pub resume_cursor: Option<String>,
    pub retry_after_ms: Option<u64>,
    /// Total number of changed records, when the source knows it
    pub total: Option<u64>,
}

/// A change the source refused during push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRejection {
    pub change_id: ChangeId,
    pub reason: String,
}

/// Result of a push call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub accepted: Vec<ChangeId>,
    pub rejected: Vec<PushRejection>,
}

/// Per-source adapter consumed by the batch operation supervisor.
///
/// Every call is a suspension point; the supervisor observes pause and
/// cancel requests around it but never aborts a call in flight.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Which source this connector talks to.
    fn source(&self) -> Source;

    /// Fetch records changed since `checkpoint` (`None` means from the start).
    async fn fetch_changes(
        &self,
        checkpoint: Option<&str>,
        page_size: usize,
    ) -> Result<FetchPage, ConnectorError>;

    /// Push accepted changes back to the source.
    async fn push_changes(&self, changes: &[StagedChange]) -> Result<PushOutcome, ConnectorError>;
}
