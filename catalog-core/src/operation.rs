//! Batch operations and their stages
//!
//! A `BatchOperation` is a long-running multi-stage unit of work. The
//! lifecycle is:
//!
//! ```text
//! idle -> pending -> running -> completed
//!                        |  \-> failed
//!                        |  \-> cancelled
//!                        v
//!                     paused -> running | cancelled
//! ```
//!
//! Terminal states are final. Every transition method validates the current
//! state and returns `OperationError::InvalidTransition` otherwise.

use crate::{
    new_entity_id, EntityId, ImportId, OperationError, OperationId, OperationStatus,
    OperationType, PauseReason, Source, StageStatus, Timestamp,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// ITEM FAILURE
// ============================================================================

/// A single item that failed inside a stage without failing the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ItemFailure {
    /// Product id, row number, or change id of the failed item
    pub item: String,
    pub reason: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

// ============================================================================
// BATCH STAGE
// ============================================================================

/// One phase of a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BatchStage {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: EntityId,
    pub name: String,
    pub status: StageStatus,
    /// 0 to 100
    pub progress: f64,
    /// Relative weight in the operation's total progress
    pub weight: f64,
    pub current_item: Option<String>,
    pub total_items: u64,
    pub completed_items: u64,
    pub error: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub started_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub completed_at: Option<Timestamp>,
}

impl BatchStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0.0,
            weight: 1.0,
            current_item: None,
            total_items: 0,
            completed_items: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// BATCH OPERATION
// ============================================================================

/// A long-running multi-stage unit of sync or import work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BatchOperation {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: OperationId,
    pub operation_type: OperationType,
    /// Source the operation pulls from or pushes to
    pub source: Option<Source>,
    pub status: OperationStatus,
    pub stages: Vec<BatchStage>,
    /// Weighted average of stage progress, never decreases
    pub total_progress: f64,
    pub items_processed: u64,
    pub total_items: u64,
    pub successful_items: u64,
    pub failed_items: u64,
    /// Opaque position of the next page to process after a pause
    pub resume_cursor: Option<String>,
    pub pause_reason: Option<PauseReason>,
    pub can_pause: bool,
    pub can_cancel: bool,
    pub failures: Vec<ItemFailure>,
    pub error: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub import_id: Option<ImportId>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub started_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub paused_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub completed_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    /// Compare-and-set token, bumped by the store on every write.
    pub version: u64,
}

impl BatchOperation {
    /// Create an idle operation with the stage plan and capabilities of its type.
    pub fn new(operation_type: OperationType, source: Option<Source>, now: Timestamp) -> Self {
        let (can_pause, can_cancel) = operation_type.capabilities();
        Self {
            id: new_entity_id(),
            operation_type,
            source,
            status: OperationStatus::Idle,
            stages: operation_type
                .stage_plan()
                .iter()
                .map(|name| BatchStage::new(*name))
                .collect(),
            total_progress: 0.0,
            items_processed: 0,
            total_items: 0,
            successful_items: 0,
            failed_items: 0,
            resume_cursor: None,
            pause_reason: None,
            can_pause,
            can_cancel,
            failures: Vec::new(),
            error: None,
            import_id: None,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            updated_at: now,
            version: 0,
        }
    }

    fn transition(
        &mut self,
        allowed_from: &[OperationStatus],
        to: OperationStatus,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        if !allowed_from.contains(&self.status) {
            return Err(OperationError::InvalidTransition {
                operation_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// `idle -> pending`
    pub fn mark_pending(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::Idle], OperationStatus::Pending, now)
    }

    /// `pending -> running` on start, `paused -> running` on resume.
    ///
    /// The resume cursor is kept; the stage that paused consumes it.
    pub fn mark_running(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(
            &[OperationStatus::Pending, OperationStatus::Paused],
            OperationStatus::Running,
            now,
        )?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.pause_reason = None;
        self.paused_at = None;
        Ok(())
    }

    /// `running -> paused`, storing the position to resume from.
    pub fn mark_paused(
        &mut self,
        reason: PauseReason,
        resume_cursor: Option<String>,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::Running], OperationStatus::Paused, now)?;
        for stage in self.stages.iter_mut() {
            if stage.status == StageStatus::Running {
                stage.status = StageStatus::Paused;
            }
        }
        self.pause_reason = Some(reason);
        self.resume_cursor = resume_cursor;
        self.paused_at = Some(now);
        Ok(())
    }

    /// `running -> completed`
    pub fn mark_completed(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::Running], OperationStatus::Completed, now)?;
        self.completed_at = Some(now);
        self.resume_cursor = None;
        Ok(())
    }

    /// `pending | running -> failed`
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        self.transition(
            &[OperationStatus::Pending, OperationStatus::Running],
            OperationStatus::Failed,
            now,
        )?;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// `running | paused -> cancelled`. Partial counts are kept.
    pub fn mark_cancelled(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(
            &[OperationStatus::Running, OperationStatus::Paused],
            OperationStatus::Cancelled,
            now,
        )?;
        self.pause_reason = None;
        self.completed_at = Some(now);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    pub fn stage(&self, name: &str) -> Option<&BatchStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    fn stage_index(&self, name: &str) -> Result<usize, OperationError> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| OperationError::StageOutOfOrder {
                operation_id: self.id,
                stage: name.to_string(),
                reason: "stage is not part of this operation".to_string(),
            })
    }

    /// Mark a stage running. Every earlier stage must be completed and no
    /// other stage may be running.
    pub fn begin_stage(&mut self, name: &str, now: Timestamp) -> Result<(), OperationError> {
        let idx = self.stage_index(name)?;
        let operation_id = self.id;
        let out_of_order = |reason: &str| OperationError::StageOutOfOrder {
            operation_id,
            stage: name.to_string(),
            reason: reason.to_string(),
        };

        if self.status != OperationStatus::Running {
            return Err(out_of_order("operation is not running"));
        }
        if self.stages[..idx]
            .iter()
            .any(|s| s.status != StageStatus::Completed)
        {
            return Err(out_of_order("an earlier stage is not completed"));
        }
        if self
            .stages
            .iter()
            .enumerate()
            .any(|(i, s)| i != idx && s.status == StageStatus::Running)
        {
            return Err(out_of_order("another stage is running"));
        }
        if !matches!(
            self.stages[idx].status,
            StageStatus::Pending | StageStatus::Paused | StageStatus::Running
        ) {
            return Err(out_of_order("stage already finished"));
        }

        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Running;
        if stage.started_at.is_none() {
            stage.started_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Update a stage's item counters and recompute progress.
    pub fn update_stage_progress(
        &mut self,
        name: &str,
        completed_items: u64,
        total_items: u64,
        current_item: Option<String>,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        let idx = self.stage_index(name)?;
        let stage = &mut self.stages[idx];
        stage.total_items = total_items.max(completed_items);
        stage.completed_items = completed_items;
        stage.current_item = current_item;
        let progress = if stage.total_items == 0 {
            0.0
        } else {
            (completed_items as f64 / stage.total_items as f64) * 100.0
        };
        // Stage progress also moves forward only.
        stage.progress = progress.clamp(0.0, 100.0).max(stage.progress);
        self.recompute_progress();
        self.updated_at = now;
        Ok(())
    }

    /// Mark a stage completed. Clears the resume cursor it may have consumed.
    pub fn complete_stage(&mut self, name: &str, now: Timestamp) -> Result<(), OperationError> {
        let idx = self.stage_index(name)?;
        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Completed;
        stage.progress = 100.0;
        stage.current_item = None;
        stage.completed_at = Some(now);
        self.resume_cursor = None;
        self.recompute_progress();
        self.updated_at = now;
        Ok(())
    }

    /// Mark a stage as failed with an unrecoverable error.
    pub fn fail_stage(
        &mut self,
        name: &str,
        error: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        let idx = self.stage_index(name)?;
        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Error;
        stage.error = Some(error.into());
        stage.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Weighted average of stage progress, clamped to never decrease.
    pub fn recompute_progress(&mut self) {
        let total_weight: f64 = self.stages.iter().map(|s| s.weight).sum();
        if total_weight <= 0.0 {
            return;
        }
        let weighted: f64 = self.stages.iter().map(|s| s.progress * s.weight).sum();
        let progress = (weighted / total_weight).clamp(0.0, 100.0);
        if progress > self.total_progress {
            self.total_progress = progress;
        }
    }

    // ------------------------------------------------------------------------
    // Item accounting
    // ------------------------------------------------------------------------

    /// Count one successfully processed item.
    pub fn record_success(&mut self) {
        self.items_processed += 1;
        self.successful_items += 1;
    }

    /// Count one failed item. The failure list is capped; the count is not.
    pub fn record_failure(
        &mut self,
        stage: &str,
        item: impl Into<String>,
        reason: impl Into<String>,
        cap: usize,
        now: Timestamp,
    ) {
        let item = item.into();
        let reason = reason.into();
        self.items_processed += 1;
        self.failed_items += 1;
        if let Some(s) = self.stages.iter_mut().find(|s| s.name == stage) {
            s.error = Some(format!(
                "{} item(s) failed, last: {}: {}",
                self.failed_items, item, reason
            ));
        }
        if self.failures.len() < cap {
            self.failures.push(ItemFailure {
                item,
                reason,
                at: now,
            });
        }
    }

    /// `items_processed = successful_items + failed_items`
    pub fn counts_consistent(&self) -> bool {
        self.items_processed == self.successful_items + self.failed_items
    }
}

// =============================================================================
// TESTS
// =============================================================================
