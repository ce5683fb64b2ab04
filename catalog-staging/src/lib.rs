//! Catalog Staging - Diff, Conflict Detection and Review
//!
//! Incoming source records flow through [`Stager::stage_record`]: the Diff
//! Engine compares them with the canonical snapshot, the Conflict Detector
//! decides which differing fields conflict with local edits, and the result
//! is written as (or merged into) one pending [`StagedChange`] per product
//! and source. [`ReviewWorkflow`] moves changes to `approved`/`rejected`,
//! applying approved values to the snapshot and queueing them for push.
//!
//! [`StagedChange`]: catalog_core::StagedChange

pub mod conflict;
pub mod diff;
pub mod locks;
pub mod metrics;
pub mod normalize;
pub mod queue;
pub mod review;
pub mod stager;

pub use conflict::{detect, Detection};
pub use diff::{classify_fields, diff_record, infer_change_type, CORE_FIELDS};
pub use locks::{ProductGuard, ProductLocks};
pub use metrics::project as project_metrics;
pub use normalize::{canonical_value, values_equal};
pub use queue::{PushQueue, PushScope};
pub use review::{BulkFailure, BulkOutcome, ReviewWorkflow};
pub use stager::{StageOutcome, Stager};
