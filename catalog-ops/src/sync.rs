//! Pull and push stage runners
//!
//! A pull walks the connector page by page from the stored checkpoint (or
//! the operation's resume cursor) and stages every record. A push drains
//! the approved-change queue for the operation's source in batches.
//!
//! Pause is observed between pages and batches, cancel additionally
//! between records. Connector calls in flight are never aborted.

use crate::control::ControlReceiver;
use crate::stage::{apply_outcomes, check_control, ItemOutcome, StageExit};
use crate::supervisor::Inner;
use crate::tracker::OperationTracker;
use catalog_core::{
    CatalogResult, ChangeId, ConnectorError, PauseReason, PushOutcome, PushRejection,
    SourceConnector, StagedChange, Timestamp,
};
use catalog_staging::PushScope;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, warn};

pub(crate) const PULL: &str = "pull";
pub(crate) const PUSH: &str = "push";

fn record_label(raw: &Value, index: u64) -> String {
    ["sku", "product_id"]
        .iter()
        .find_map(|key| match raw.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("record {}", index))
}

fn connector_failed(e: ConnectorError) -> StageExit {
    if e.is_systemic() {
        error!(error = %e, "Connector fault, failing the stage");
    } else {
        warn!(error = %e, "Connector refused the request, failing the stage");
    }
    StageExit::Failed(e.to_string())
}

fn rate_limited(retry_after_ms: Option<u64>, cursor: Option<String>) -> StageExit {
    StageExit::Paused {
        reason: PauseReason::RateLimited { retry_after_ms },
        cursor,
    }
}

// ============================================================================
// PULL
// ============================================================================

#[instrument(skip_all, fields(operation_id = %tracker.op().id, source = %connector.source()))]
pub(crate) async fn run_pull(
    inner: &Inner,
    tracker: &mut OperationTracker,
    control: &ControlReceiver,
    connector: &dyn SourceConnector,
) -> CatalogResult<StageExit> {
    let source = connector.source();
    let operation_id = tracker.op().id;
    let mut cursor = match tracker.op().resume_cursor.clone() {
        Some(resume) => Some(resume),
        None => inner.store.checkpoint_get(source)?,
    };
    let now = Utc::now();
    tracker.update(|op| op.begin_stage(PULL, now))?;
    debug!(cursor = ?cursor, "Pull stage started");

    let staged_by = format!("{}-sync", source);
    let page_size = inner.config.pull_page_size;
    let failure_cap = inner.config.operation_failure_cap;

    loop {
        if let Some(exit) = check_control(control, &cursor) {
            return Ok(exit);
        }

        let page = match connector.fetch_changes(cursor.as_deref(), page_size).await {
            Ok(page) => page,
            Err(ConnectorError::RateLimited {
                resume_cursor,
                retry_after_ms,
                ..
            }) => {
                warn!(cursor = ?cursor, "Source throttled the pull");
                tracker.log("source throttled the pull");
                return Ok(rate_limited(retry_after_ms, resume_cursor.or(cursor)));
            }
            Err(e) => return Ok(connector_failed(e)),
        };

        // A pause or cancel that arrived during the fetch discards the page;
        // the resume starts from the same cursor.
        if let Some(exit) = check_control(control, &cursor) {
            return Ok(exit);
        }

        let already = tracker.op().stage(PULL).map(|s| s.completed_items).unwrap_or(0);
        let mut outcomes: Vec<ItemOutcome> = Vec::with_capacity(page.records.len());
        let mut last_item = None;
        let mut cancelled = false;
        for raw in &page.records {
            if control.is_cancelled() {
                cancelled = true;
                break;
            }
            let label = record_label(raw, already + outcomes.len() as u64 + 1);
            match inner
                .stager
                .stage_raw(source, raw, &staged_by, Some(operation_id))
                .await
            {
                Ok(_) => outcomes.push(Ok(())),
                Err(e) => outcomes.push(Err((label.clone(), e.to_string()))),
            }
            last_item = Some(label);
        }

        let stage_total = page.total.map(|t| t.max(already + outcomes.len() as u64));
        let now = Utc::now();
        tracker.update(|op| {
            apply_outcomes(op, PULL, &outcomes, stage_total, last_item.clone(), failure_cap, now)
        })?;
        tracker.publish_progress(PULL);

        if cancelled {
            return Ok(StageExit::Cancelled);
        }
        if page.rate_limited {
            // Records of this page are already counted, so the resume must
            // start past them; without a position the stage cannot go on.
            let resume = match page.resume_cursor.or(page.next_checkpoint) {
                Some(resume) => Some(resume),
                None if outcomes.is_empty() => cursor,
                None => {
                    return Ok(StageExit::Failed(
                        "connector throttled mid-page without a resume position".to_string(),
                    ))
                }
            };
            warn!(resume_cursor = ?resume, "Source throttled the pull mid-page");
            tracker.log("source throttled the pull");
            return Ok(rate_limited(page.retry_after_ms, resume));
        }

        if page.next_checkpoint.is_some() {
            cursor = page.next_checkpoint;
        } else if page.has_more {
            return Ok(StageExit::Failed(
                "connector reported more pages without a checkpoint".to_string(),
            ));
        }

        if !page.has_more {
            break;
        }
    }

    inner.store.checkpoint_put(source, cursor.clone())?;
    let now = Utc::now();
    tracker.update(|op| op.complete_stage(PULL, now))?;
    tracker.publish_progress(PULL);
    info!(checkpoint = ?cursor, items = tracker.op().items_processed, "Pull stage completed");
    Ok(StageExit::Completed)
}

// ============================================================================
// PUSH
// ============================================================================

#[instrument(skip_all, fields(operation_id = %tracker.op().id, source = %connector.source(), scope = ?scope))]
pub(crate) async fn run_push(
    inner: &Inner,
    tracker: &mut OperationTracker,
    control: &ControlReceiver,
    connector: &dyn SourceConnector,
    scope: PushScope,
) -> CatalogResult<StageExit> {
    let source = connector.source();
    let now = Utc::now();
    tracker.update(|op| op.begin_stage(PUSH, now))?;

    let queued = inner.queue.pending(source, scope)?;
    let already = tracker.op().stage(PUSH).map(|s| s.completed_items).unwrap_or(0);
    let stage_total = already + queued.len() as u64;
    let failure_cap = inner.config.operation_failure_cap;
    debug!(queued = queued.len(), "Push stage started");

    for batch in queued.chunks(inner.config.push_batch_size) {
        if let Some(exit) = check_control(control, &None) {
            return Ok(exit);
        }

        let outcome = match connector.push_changes(batch).await {
            Ok(outcome) => outcome,
            Err(ConnectorError::RateLimited { retry_after_ms, .. }) => {
                warn!("Source throttled the push");
                tracker.log("source throttled the push");
                return Ok(rate_limited(retry_after_ms, None));
            }
            Err(e) if e.is_systemic() => return Ok(connector_failed(e)),
            // A refused batch is a per-item failure for each of its changes.
            Err(e) => {
                warn!(error = %e, batch = batch.len(), "Source refused a push batch");
                let reason = e.to_string();
                PushOutcome {
                    accepted: Vec::new(),
                    rejected: batch
                        .iter()
                        .map(|c| PushRejection {
                            change_id: c.change_id,
                            reason: reason.clone(),
                        })
                        .collect(),
                }
            }
        };

        // Results are recorded even if a cancel arrived during the call.
        let rejected: HashMap<_, _> = outcome
            .rejected
            .iter()
            .map(|r| (r.change_id, r.reason.as_str()))
            .collect();
        let now = Utc::now();
        let mut outcomes: Vec<ItemOutcome> = Vec::with_capacity(batch.len());
        for change in batch {
            outcomes.push(record_push(inner, change, &outcome.accepted, &rejected, now)?);
        }

        let last_item = batch.last().map(|c| c.product_id.clone());
        tracker.update(|op| {
            apply_outcomes(op, PUSH, &outcomes, Some(stage_total), last_item.clone(), failure_cap, now)
        })?;
        tracker.publish_progress(PUSH);
    }

    let now = Utc::now();
    tracker.update(|op| op.complete_stage(PUSH, now))?;
    tracker.publish_progress(PUSH);
    info!(pushed = queued.len(), "Push stage completed");
    Ok(StageExit::Completed)
}

fn record_push(
    inner: &Inner,
    change: &StagedChange,
    accepted: &[ChangeId],
    rejected: &HashMap<ChangeId, &str>,
    now: Timestamp,
) -> CatalogResult<ItemOutcome> {
    if accepted.contains(&change.change_id) {
        inner.queue.mark_pushed(change.change_id, now)?;
        return Ok(Ok(()));
    }
    let reason = rejected
        .get(&change.change_id)
        .copied()
        .unwrap_or("not acknowledged by source");
    inner.queue.mark_failed(change.change_id, reason, now)?;
    Ok(Err((change.product_id.clone(), reason.to_string())))
}
