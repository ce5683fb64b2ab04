//! Import jobs for file-based ingestion

use crate::{
    new_entity_id, ImportId, ImportStatus, ItemFailure, OperationError, OperationId, Source,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// Verdict of the validate stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ImportValidation {
    pub valid: bool,
    pub columns: Vec<String>,
    pub record_count: u64,
    /// Structural problems found in the file, one entry per problem
    pub errors: Vec<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub validated_at: Timestamp,
}

/// State of a single file import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ImportJob {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: ImportId,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub operation_id: Option<OperationId>,
    /// Source the imported rows are attributed to
    pub source: Source,
    pub file_name: String,
    pub status: ImportStatus,
    /// 0 to 100
    pub progress: f64,
    pub file_size: u64,
    pub downloaded_size: u64,
    /// Hex SHA-256 of the uploaded bytes
    pub content_hash: Option<String>,
    pub validation: Option<ImportValidation>,
    pub records_total: u64,
    pub records_processed: u64,
    pub imported_records: u64,
    pub failed_records: u64,
    pub failures: Vec<ItemFailure>,
    pub error: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub completed_at: Option<Timestamp>,
}

impl ImportJob {
    pub fn new(source: Source, file_name: impl Into<String>, file_size: u64, now: Timestamp) -> Self {
        Self {
            id: new_entity_id(),
            operation_id: None,
            source,
            file_name: file_name.into(),
            status: ImportStatus::Queued,
            progress: 0.0,
            file_size,
            downloaded_size: 0,
            content_hash: None,
            validation: None,
            records_total: 0,
            records_processed: 0,
            imported_records: 0,
            failed_records: 0,
            failures: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn transition(
        &mut self,
        allowed_from: &[ImportStatus],
        to: ImportStatus,
        now: Timestamp,
    ) -> Result<(), OperationError> {
        if !allowed_from.contains(&self.status) {
            return Err(OperationError::ImportTransition {
                import_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// `queued -> downloading`
    pub fn begin_download(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(&[ImportStatus::Queued], ImportStatus::Downloading, now)
    }

    /// Account for received bytes. Progress covers the upload only until
    /// processing starts.
    pub fn record_downloaded(&mut self, bytes: u64, now: Timestamp) {
        self.downloaded_size = (self.downloaded_size + bytes).min(self.file_size);
        if self.file_size > 0 {
            self.progress = (self.downloaded_size as f64 / self.file_size as f64) * 100.0;
        }
        self.updated_at = now;
    }

    /// `downloading -> processing`
    pub fn begin_processing(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(&[ImportStatus::Downloading], ImportStatus::Processing, now)?;
        self.progress = 0.0;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| v.valid)
    }

    /// Count one processed row.
    pub fn record_imported(&mut self, now: Timestamp) {
        self.records_processed += 1;
        self.imported_records += 1;
        self.refresh_progress(now);
    }

    /// Count one failed row. The failure list is capped; the count is not.
    pub fn record_failed(
        &mut self,
        item: impl Into<String>,
        reason: impl Into<String>,
        cap: usize,
        now: Timestamp,
    ) {
        self.records_processed += 1;
        self.failed_records += 1;
        if self.failures.len() < cap {
            self.failures.push(ItemFailure {
                item: item.into(),
                reason: reason.into(),
                at: now,
            });
        }
        self.refresh_progress(now);
    }

    fn refresh_progress(&mut self, now: Timestamp) {
        if self.records_total > 0 {
            self.progress =
                (self.records_processed as f64 / self.records_total as f64 * 100.0).min(100.0);
        }
        self.updated_at = now;
    }

    /// `processing -> completed`
    pub fn complete(&mut self, now: Timestamp) -> Result<(), OperationError> {
        self.transition(&[ImportStatus::Processing], ImportStatus::Completed, now)?;
        self.progress = 100.0;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Any non-terminal state `-> failed`.
    pub fn fail(&mut self, error: impl Into<String>, now: Timestamp) -> Result<(), OperationError> {
        self.transition(
            &[
                ImportStatus::Queued,
                ImportStatus::Downloading,
                ImportStatus::Processing,
            ],
            ImportStatus::Failed,
            now,
        )?;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }
}
