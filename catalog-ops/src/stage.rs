//! Shared pieces of stage runners

use crate::control::{ControlReceiver, ControlSignal};
use crate::import::UPLOAD;
use catalog_core::{BatchOperation, OperationError, PauseReason, Timestamp};

/// How a stage runner stopped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageExit {
    Completed,
    Paused {
        reason: PauseReason,
        cursor: Option<String>,
    },
    Cancelled,
    Failed(String),
}

/// Outcome of one item: `Err((item, reason))` for a per-item failure.
pub(crate) type ItemOutcome = Result<(), (String, String)>;

/// Exit the stage if a pause or cancel is pending. `cursor` is where a resume starts.
pub(crate) fn check_control(control: &ControlReceiver, cursor: &Option<String>) -> Option<StageExit> {
    match control.current() {
        ControlSignal::Run => None,
        ControlSignal::Cancel => Some(StageExit::Cancelled),
        ControlSignal::Pause => Some(StageExit::Paused {
            reason: PauseReason::Manual,
            cursor: cursor.clone(),
        }),
    }
}

/// Fold per-item outcomes into the operation and its stage counters.
pub(crate) fn apply_outcomes(
    op: &mut BatchOperation,
    stage: &str,
    outcomes: &[ItemOutcome],
    stage_total: Option<u64>,
    current_item: Option<String>,
    failure_cap: usize,
    now: Timestamp,
) -> Result<(), OperationError> {
    for outcome in outcomes {
        match outcome {
            Ok(()) => op.record_success(),
            Err((item, reason)) => op.record_failure(stage, item.clone(), reason.clone(), failure_cap, now),
        }
    }
    let done = op.stage(stage).map(|s| s.completed_items).unwrap_or(0) + outcomes.len() as u64;
    let total = stage_total.unwrap_or(done).max(done);
    op.update_stage_progress(stage, done, total, current_item, now)?;
    refresh_totals(op);
    Ok(())
}

/// `total_items` is the sum of item-counting stage totals and never below
/// `items_processed`. Upload counts bytes, not items.
pub(crate) fn refresh_totals(op: &mut BatchOperation) {
    let staged: u64 = op
        .stages
        .iter()
        .filter(|s| s.name != UPLOAD)
        .map(|s| s.total_items)
        .sum();
    op.total_items = op.total_items.max(staged).max(op.items_processed);
}
