//! Import Pipeline
//!
//! File-based ingestion as a three-stage batch operation:
//!
//! 1. `upload` receives the bytes, hashes them in chunks and reports progress
//! 2. `validate` parses the CSV and stores a verdict on the job
//! 3. `execute` stages every row through the [`Stager`](catalog_staging::Stager)
//!
//! `execute` refuses to start until `validate` has produced a valid verdict.
//! Rows that fail record validation are counted and listed on the job; they
//! never fail the operation.

use crate::control::ControlReceiver;
use crate::stage::{apply_outcomes, ItemOutcome, StageExit};
use crate::supervisor::Supervisor;
use crate::tracker::OperationTracker;
use catalog_core::{
    BatchOperation, CatalogError, CatalogResult, EntityKind, ImportId, ImportJob, ImportStatus,
    ImportValidation, OperationError, OperationId, OperationType, Source, StorageError, Timestamp,
};
use catalog_events::EventType;
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub(crate) const UPLOAD: &str = "upload";
pub(crate) const VALIDATE: &str = "validate";
pub(crate) const EXECUTE: &str = "execute";

/// Rows staged between progress writes.
const FLUSH_EVERY: usize = 50;

const ID_COLUMNS: &[&str] = &["sku", "product_id"];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ============================================================================
// CSV PARSING
// ============================================================================

/// One data row of an import file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    /// 1-based line number in the file
    pub line: u64,
    /// Column name to cell, empty cells omitted
    pub record: Value,
}

/// Parse an import file.
///
/// Structural problems (bad header, ragged rows, invalid UTF-8) go into
/// `errors`, capped at `error_cap` entries. Field-level checks such as
/// negative prices are left to record validation during execute.
pub fn parse_import(
    bytes: &[u8],
    error_cap: usize,
    now: Timestamp,
) -> (ImportValidation, Vec<ImportRow>) {
    let mut problems = Problems::new(error_cap);
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(bytes);

    let columns: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(str::to_string).collect(),
        Err(e) => {
            problems.report(format!("header: {}", e));
            Vec::new()
        }
    };

    if columns.is_empty() {
        if problems.count == 0 {
            problems.report("file has no header row".to_string());
        }
    } else {
        let mut seen = HashSet::new();
        for (idx, column) in columns.iter().enumerate() {
            if column.is_empty() {
                problems.report(format!("header: column {} has no name", idx + 1));
            } else if !seen.insert(column.as_str()) {
                problems.report(format!("header: duplicate column {}", column));
            }
        }
        if !columns.iter().any(|c| ID_COLUMNS.contains(&c.as_str())) {
            problems.report("header: missing sku or product_id column".to_string());
        }
    }

    let mut rows = Vec::new();
    if problems.count == 0 {
        for (idx, result) in reader.records().enumerate() {
            let fallback_line = idx as u64 + 2;
            match result {
                Ok(record) => {
                    let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
                    let object: Map<String, Value> = columns
                        .iter()
                        .zip(record.iter())
                        .filter(|(_, cell)| !cell.is_empty())
                        .map(|(column, cell)| (column.clone(), Value::String(cell.to_string())))
                        .collect();
                    rows.push(ImportRow {
                        line,
                        record: Value::Object(object),
                    });
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
                    problems.report(format!("line {}: {}", line, e));
                }
            }
        }
        if rows.is_empty() && problems.count == 0 {
            problems.report("file has no data rows".to_string());
        }
    }

    let valid = problems.count == 0;
    let validation = ImportValidation {
        valid,
        columns,
        record_count: rows.len() as u64,
        errors: problems.finish(),
        validated_at: now,
    };
    (validation, rows)
}

/// Capped list of structural problems with an exact count.
struct Problems {
    errors: Vec<String>,
    count: usize,
    cap: usize,
}

impl Problems {
    fn new(cap: usize) -> Self {
        Self {
            errors: Vec::new(),
            count: 0,
            cap,
        }
    }

    fn report(&mut self, message: String) {
        self.count += 1;
        if self.errors.len() < self.cap {
            self.errors.push(message);
        }
    }

    fn finish(mut self) -> Vec<String> {
        let hidden = self.count - self.errors.len();
        if hidden > 0 {
            if let Some(last) = self.errors.last_mut() {
                last.push_str(&format!(" (and {} more)", hidden));
            }
        }
        self.errors
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Upload, validate and execute import files. Obtained from [`Supervisor::imports`].
#[derive(Clone)]
pub struct ImportPipeline {
    supervisor: Supervisor,
}

impl ImportPipeline {
    pub(crate) fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Get an import job.
    pub fn get(&self, import_id: ImportId) -> CatalogResult<ImportJob> {
        self.supervisor
            .inner
            .store
            .import_get(import_id)?
            .ok_or_else(|| {
                CatalogError::Storage(StorageError::NotFound {
                    entity: EntityKind::ImportJob,
                    id: import_id.to_string(),
                })
            })
    }

    /// Receive a file and run the `upload` stage.
    ///
    /// Creates the import operation (running, cancel-only) and its job.
    /// Rows are attributed to `source`, `vendor-feed` when not given.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn upload(
        &self,
        source: Option<Source>,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> CatalogResult<ImportJob> {
        let inner = &self.supervisor.inner;
        let size = bytes.len() as u64;
        let limit = inner.config.import_max_file_bytes;
        if size > limit {
            return Err(OperationError::FileTooLarge { size, limit }.into());
        }

        let now = Utc::now();
        let source = source.unwrap_or(Source::VendorFeed);
        let mut job = ImportJob::new(source, file_name, size, now);
        let mut op = BatchOperation::new(OperationType::Import, Some(source), now);
        op.import_id = Some(job.id);
        job.operation_id = Some(op.id);
        op.mark_pending(now)?;
        let op = inner.store.operation_insert(&op)?;
        inner.store.import_put(&job)?;

        let mut tracker = self.supervisor.tracker(op);
        tracker.update(|op| op.mark_running(now))?;
        tracker.publish_status(EventType::Start, "import started");
        tracker.update(|op| op.begin_stage(UPLOAD, now))?;
        job.begin_download(now)?;

        let mut hasher = Sha256::new();
        for chunk in bytes.chunks(inner.config.upload_chunk_bytes) {
            hasher.update(chunk);
            let now = Utc::now();
            job.record_downloaded(chunk.len() as u64, now);
            inner.store.import_put(&job)?;
            let downloaded = job.downloaded_size;
            tracker.update(|op| op.update_stage_progress(UPLOAD, downloaded, size, None, now))?;
            tracker.publish_progress(UPLOAD);
        }
        job.content_hash = Some(hex::encode(hasher.finalize()));
        inner.store.import_put(&job)?;

        let now = Utc::now();
        tracker.update(|op| op.complete_stage(UPLOAD, now))?;
        tracker.publish_progress(UPLOAD);
        inner.files.insert(job.id, Arc::new(bytes));

        info!(
            import_id = %job.id,
            operation_id = %tracker.op().id,
            content_hash = job.content_hash.as_deref().unwrap_or_default(),
            "Import uploaded"
        );
        Ok(job)
    }

    /// Run the `validate` stage and store the verdict on the job.
    ///
    /// An invalid file fails the job and its operation.
    #[instrument(skip(self))]
    pub async fn validate(&self, import_id: ImportId) -> CatalogResult<ImportValidation> {
        let inner = &self.supervisor.inner;
        let _guard = inner.control_lock.lock().await;

        let mut job = self.get(import_id)?;
        let operation_id = operation_of(&job)?;
        let bytes = self.file(import_id)?;
        let mut tracker = self.supervisor.tracker(self.supervisor.get(operation_id)?);

        let now = Utc::now();
        tracker.update(|op| op.begin_stage(VALIDATE, now))?;
        job.begin_processing(now)?;
        let (validation, _) = parse_import(&bytes, inner.config.import_failure_cap, now);
        job.validation = Some(validation.clone());
        job.records_total = validation.record_count;

        if validation.valid {
            inner.store.import_put(&job)?;
            let records = validation.record_count;
            tracker.update(|op| {
                op.total_items = op.total_items.max(records);
                op.complete_stage(VALIDATE, now)
            })?;
            tracker.publish_progress(VALIDATE);
            info!(import_id = %import_id, records, "Import validated");
        } else {
            let reason = format!("validation failed: {}", validation.errors.join("; "));
            job.fail(reason.clone(), now)?;
            inner.store.import_put(&job)?;
            tracker.update(|op| {
                op.fail_stage(VALIDATE, reason.clone(), now)?;
                op.mark_failed(reason.clone(), now)
            })?;
            tracker.publish_status(EventType::Complete, "import validation failed");
            tracker.close_topics();
            inner.files.remove(&import_id);
            warn!(import_id = %import_id, errors = validation.errors.len(), "Import rejected");
        }
        Ok(validation)
    }

    /// Start the `execute` stage on a worker. Returns the operation id.
    #[instrument(skip(self))]
    pub async fn execute(&self, import_id: ImportId) -> CatalogResult<OperationId> {
        let inner = &self.supervisor.inner;
        let _guard = inner.control_lock.lock().await;

        let job = self.get(import_id)?;
        match &job.validation {
            None => {
                return Err(OperationError::NotValidated {
                    import_id,
                    reason: "file has not been validated".to_string(),
                }
                .into())
            }
            Some(v) if !v.valid => {
                return Err(OperationError::NotValidated {
                    import_id,
                    reason: format!("validation failed: {}", v.errors.join("; ")),
                }
                .into())
            }
            Some(_) => {}
        }
        if job.status != ImportStatus::Processing {
            return Err(OperationError::ImportTransition {
                import_id,
                from: job.status,
                to: ImportStatus::Processing,
            }
            .into());
        }

        let operation_id = operation_of(&job)?;
        if self.supervisor.worker_live(operation_id) {
            return Err(OperationError::OperationAlreadyRunning {
                origin: job.source,
                existing: operation_id,
            }
            .into());
        }
        self.supervisor.spawn_worker(operation_id);
        info!(import_id = %import_id, operation_id = %operation_id, "Import execute started");
        Ok(operation_id)
    }

    /// Upload, validate and, when the file is valid, execute.
    ///
    /// Returns the job as it stands after the last step that ran. An invalid
    /// file comes back `failed` with its validation errors.
    pub async fn start_import(
        &self,
        source: Option<Source>,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> CatalogResult<ImportJob> {
        let job = self.upload(source, file_name, bytes)?;
        let validation = self.validate(job.id).await?;
        if validation.valid {
            self.execute(job.id).await?;
        }
        self.get(job.id)
    }

    fn file(&self, import_id: ImportId) -> CatalogResult<Arc<Vec<u8>>> {
        self.supervisor
            .inner
            .files
            .get(&import_id)
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                OperationError::InvalidRequest {
                    reason: format!("file for import {} is no longer available", import_id),
                }
                .into()
            })
    }

    /// Fail a job that has not finished yet. Terminal jobs are left as they are.
    pub(crate) fn fail_job(&self, import_id: ImportId, reason: &str) -> CatalogResult<()> {
        let inner = &self.supervisor.inner;
        inner.files.remove(&import_id);
        let mut job = self.get(import_id)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.fail(reason, Utc::now())?;
        inner.store.import_put(&job)
    }
}

fn operation_of(job: &ImportJob) -> CatalogResult<OperationId> {
    job.operation_id.ok_or_else(|| {
        OperationError::InvalidRequest {
            reason: format!("import {} has no operation", job.id),
        }
        .into()
    })
}

// ============================================================================
// EXECUTE STAGE
// ============================================================================

struct ExecuteBatch {
    outcomes: Vec<ItemOutcome>,
    last_item: Option<String>,
}

#[instrument(skip_all, fields(operation_id = %tracker.op().id))]
pub(crate) async fn run_execute(
    pipeline: &ImportPipeline,
    tracker: &mut OperationTracker,
    control: &ControlReceiver,
) -> CatalogResult<StageExit> {
    let inner = &pipeline.supervisor.inner;
    let operation_id = tracker.op().id;
    let import_id = tracker.op().import_id.ok_or_else(|| OperationError::InvalidRequest {
        reason: format!("operation {} has no import", operation_id),
    })?;
    let mut job = pipeline.get(import_id)?;
    let bytes = pipeline.file(import_id)?;

    let now = Utc::now();
    let (_, rows) = parse_import(&bytes, inner.config.import_failure_cap, now);
    let total = rows.len() as u64;
    tracker.update(|op| {
        op.begin_stage(EXECUTE, now)?;
        op.total_items = op.total_items.max(total);
        Ok(())
    })?;
    job.records_total = total;

    let staged_by = format!("import:{}", job.file_name);
    let job_cap = inner.config.import_failure_cap;
    let op_cap = inner.config.operation_failure_cap;
    let mut batch = ExecuteBatch {
        outcomes: Vec::with_capacity(FLUSH_EVERY),
        last_item: None,
    };

    for row in &rows {
        if control.is_cancelled() {
            flush(pipeline, tracker, &job, &mut batch, total, op_cap)?;
            return Ok(StageExit::Cancelled);
        }

        let item = format!("line {}", row.line);
        let result = inner
            .stager
            .stage_raw(job.source, &row.record, &staged_by, Some(operation_id))
            .await;
        let now = Utc::now();
        match result {
            Ok(_) => {
                job.record_imported(now);
                batch.outcomes.push(Ok(()));
            }
            Err(e) => {
                let reason = e.to_string();
                job.record_failed(item.clone(), reason.clone(), job_cap, now);
                batch.outcomes.push(Err((item.clone(), reason)));
            }
        }
        batch.last_item = Some(item);

        if batch.outcomes.len() >= FLUSH_EVERY {
            flush(pipeline, tracker, &job, &mut batch, total, op_cap)?;
        }
    }
    flush(pipeline, tracker, &job, &mut batch, total, op_cap)?;

    let now = Utc::now();
    job.complete(now)?;
    inner.store.import_put(&job)?;
    tracker.update(|op| op.complete_stage(EXECUTE, now))?;
    tracker.publish_progress(EXECUTE);
    inner.files.remove(&import_id);

    info!(
        import_id = %import_id,
        imported = job.imported_records,
        failed = job.failed_records,
        "Import executed"
    );
    Ok(StageExit::Completed)
}

fn flush(
    pipeline: &ImportPipeline,
    tracker: &mut OperationTracker,
    job: &ImportJob,
    batch: &mut ExecuteBatch,
    total: u64,
    failure_cap: usize,
) -> CatalogResult<()> {
    if batch.outcomes.is_empty() {
        return Ok(());
    }
    pipeline.supervisor.inner.store.import_put(job)?;
    let now = Utc::now();
    tracker.update(|op| {
        apply_outcomes(
            op,
            EXECUTE,
            &batch.outcomes,
            Some(total),
            batch.last_item.clone(),
            failure_cap,
            now,
        )
    })?;
    tracker.publish_progress(EXECUTE);
    batch.outcomes.clear();
    Ok(())
}
