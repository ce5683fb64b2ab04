//! Batch Operation Supervisor
//!
//! Owns the lifecycle of batch operations: start, cooperative pause and
//! cancel, resume from the stored cursor, and startup recovery. Each
//! running operation has one worker task; the supervisor talks to it
//! through a control channel and never aborts it.
//!
//! At most one connector-bound operation (sync, update, delete) runs per
//! source. A paused operation keeps its source claimed so a resume cannot
//! race a newer run over the same checkpoint.

use crate::control::{control_channel, ControlHandle, ControlReceiver};
use crate::import::{run_execute, ImportPipeline, EXECUTE};
use crate::stage::StageExit;
use crate::sync::{run_pull, run_push, PULL, PUSH};
use crate::tracker::OperationTracker;
use catalog_core::{
    BatchOperation, CatalogConfig, CatalogError, CatalogResult, EntityKind, ImportId,
    OperationError, OperationFilter, OperationId, OperationStatus, OperationType, Source,
    SourceConnector, StageStatus, StorageError, SyncMetrics,
};
use catalog_events::{EventType, NotificationBus};
use catalog_staging::{project_metrics, ProductLocks, PushQueue, PushScope, ReviewWorkflow, Stager};
use catalog_storage::{retry_on_conflict, CatalogStore, ReconcileReport};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// STATE
// ============================================================================

struct WorkerSlot {
    control: ControlHandle,
    join: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

impl WorkerSlot {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }
}

/// Sets the worker's finished flag however the task ends.
struct ExitFlag(Arc<AtomicBool>);

impl Drop for ExitFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn CatalogStore>,
    pub(crate) bus: NotificationBus,
    pub(crate) config: CatalogConfig,
    pub(crate) stager: Stager,
    pub(crate) queue: PushQueue,
    review: ReviewWorkflow,
    connectors: DashMap<Source, Arc<dyn SourceConnector>>,
    active_sources: DashMap<Source, OperationId>,
    workers: DashMap<OperationId, WorkerSlot>,
    /// Serializes control requests with workers persisting their exit state.
    pub(crate) control_lock: Mutex<()>,
    /// Uploaded import files awaiting validate/execute
    pub(crate) files: DashMap<ImportId, Arc<Vec<u8>>>,
}

/// Entry point for starting and controlling batch operations.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        bus: NotificationBus,
        config: CatalogConfig,
        locks: ProductLocks,
    ) -> Self {
        let stager = Stager::new(store.clone(), locks.clone(), &config);
        let queue = PushQueue::new(store.clone(), &config);
        let review = ReviewWorkflow::new(store.clone(), locks, &config);
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                config,
                stager,
                queue,
                review,
                connectors: DashMap::new(),
                active_sources: DashMap::new(),
                workers: DashMap::new(),
                control_lock: Mutex::new(()),
                files: DashMap::new(),
            }),
        }
    }

    /// Register (or replace) the connector for its source.
    pub fn register_connector(&self, connector: Arc<dyn SourceConnector>) {
        let source = connector.source();
        self.inner.connectors.insert(source, connector);
        debug!(source = %source, "Connector registered");
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    pub fn stager(&self) -> &Stager {
        &self.inner.stager
    }

    /// Review workflow sharing this supervisor's store and product locks.
    pub fn review(&self) -> &ReviewWorkflow {
        &self.inner.review
    }

    pub fn queue(&self) -> &PushQueue {
        &self.inner.queue
    }

    pub fn imports(&self) -> ImportPipeline {
        ImportPipeline::new(self.clone())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get(&self, operation_id: OperationId) -> CatalogResult<BatchOperation> {
        self.inner.store.operation_get(operation_id)?.ok_or_else(|| {
            CatalogError::Storage(StorageError::NotFound {
                entity: EntityKind::BatchOperation,
                id: operation_id.to_string(),
            })
        })
    }

    pub fn list(&self, filter: &OperationFilter) -> CatalogResult<Vec<BatchOperation>> {
        self.inner.store.operation_list(filter)
    }

    /// Aggregate counters, recomputed from the store.
    pub fn metrics(&self) -> CatalogResult<SyncMetrics> {
        project_metrics(self.inner.store.as_ref(), Utc::now())
    }

    /// Wait for the operation's current worker to exit, then return the stored operation.
    ///
    /// A paused operation's worker exits too, so this returns on pause as
    /// well as on a terminal state. With no worker it returns immediately.
    pub async fn join(&self, operation_id: OperationId) -> CatalogResult<BatchOperation> {
        let handle = self
            .inner
            .workers
            .get_mut(&operation_id)
            .and_then(|mut slot| slot.join.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(operation_id = %operation_id, error = %e, "Operation worker panicked");
            }
        }
        self.get(operation_id)
    }

    pub(crate) fn tracker(&self, op: BatchOperation) -> OperationTracker {
        OperationTracker::new(
            op,
            self.inner.store.clone(),
            self.inner.bus.clone(),
            self.inner.config.cas_retry_limit,
        )
    }

    pub(crate) fn worker_live(&self, operation_id: OperationId) -> bool {
        self.inner
            .workers
            .get(&operation_id)
            .is_some_and(|slot| slot.is_live())
    }

    fn connector(&self, source: Source) -> CatalogResult<Arc<dyn SourceConnector>> {
        self.inner
            .connectors
            .get(&source)
            .map(|c| c.value().clone())
            .ok_or_else(|| OperationError::ConnectorNotRegistered { origin: source }.into())
    }

    /// Free what a terminal operation held: its source claim and its topics.
    fn retire(&self, tracker: &OperationTracker) {
        self.release_source(tracker.op());
        tracker.close_topics();
    }

    fn release_source(&self, op: &BatchOperation) {
        if let Some(source) = op.source {
            self.inner
                .active_sources
                .remove_if(&source, |_, owner| *owner == op.id);
        }
    }

    // ========================================================================
    // START
    // ========================================================================

    /// Start a connector-bound operation on a worker.
    ///
    /// Fails with `OperationAlreadyRunning` when another sync, update or
    /// delete holds the source, including a paused one. Imports go through
    /// [`Supervisor::imports`].
    #[instrument(skip(self))]
    pub fn start(
        &self,
        operation_type: OperationType,
        source: Source,
    ) -> CatalogResult<OperationId> {
        if operation_type == OperationType::Import {
            return Err(OperationError::InvalidRequest {
                reason: "imports are started through the import pipeline".to_string(),
            }
            .into());
        }
        self.connector(source)?;

        let now = Utc::now();
        let mut op = BatchOperation::new(operation_type, Some(source), now);
        match self.inner.active_sources.entry(source) {
            Entry::Occupied(existing) => {
                return Err(OperationError::OperationAlreadyRunning {
                    origin: source,
                    existing: *existing.get(),
                }
                .into());
            }
            Entry::Vacant(slot) => {
                slot.insert(op.id);
            }
        }

        let inserted = op
            .mark_pending(now)
            .map_err(CatalogError::from)
            .and_then(|_| self.inner.store.operation_insert(&op));
        let op = match inserted {
            Ok(op) => op,
            Err(e) => {
                self.release_source(&op);
                return Err(e);
            }
        };

        self.tracker(op.clone())
            .publish_status(EventType::Start, "operation started");
        self.prune_workers();
        self.spawn_worker(op.id);
        info!(operation_id = %op.id, "Operation started");
        Ok(op.id)
    }

    fn prune_workers(&self) {
        self.inner.workers.retain(|_, slot| slot.is_live());
    }

    pub(crate) fn spawn_worker(&self, operation_id: OperationId) {
        let (handle, receiver) = control_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = ExitFlag(finished.clone());
        let supervisor = self.clone();
        let join = tokio::spawn(async move {
            let _flag = flag;
            supervisor.drive(operation_id, receiver).await;
        });
        self.inner.workers.insert(
            operation_id,
            WorkerSlot {
                control: handle,
                join: Some(join),
                finished,
            },
        );
    }

    // ========================================================================
    // WORKER
    // ========================================================================

    async fn drive(&self, operation_id: OperationId, control: ControlReceiver) {
        if let Err(e) = self.run_worker(operation_id, &control).await {
            error!(operation_id = %operation_id, error = %e, "Operation worker failed");
            if let Err(e2) = self.fail_after_error(operation_id, &e.to_string()).await {
                error!(operation_id = %operation_id, error = %e2, "Could not record operation failure");
            }
        }
    }

    #[instrument(skip(self, control))]
    async fn run_worker(
        &self,
        operation_id: OperationId,
        control: &ControlReceiver,
    ) -> CatalogResult<()> {
        let mut tracker = self.tracker(self.get(operation_id)?);
        if tracker.op().status == OperationStatus::Pending {
            let now = Utc::now();
            tracker.update(|op| op.mark_running(now))?;
        }
        if tracker.op().status != OperationStatus::Running {
            warn!(status = %tracker.op().status, "Worker found operation not running");
            return Ok(());
        }

        let exit = self.run_stages(&mut tracker, control).await?;
        self.finish(&mut tracker, control, exit).await
    }

    async fn run_stages(
        &self,
        tracker: &mut OperationTracker,
        control: &ControlReceiver,
    ) -> CatalogResult<StageExit> {
        let operation_type = tracker.op().operation_type;
        let connector = match (operation_type, tracker.op().source) {
            (OperationType::Import, _) => None,
            (_, Some(source)) => Some(self.connector(source)?),
            (_, None) => {
                return Ok(StageExit::Failed("operation has no source".to_string()));
            }
        };

        for stage in operation_type.stage_plan() {
            let status = tracker.op().stage(stage).map(|s| s.status);
            if status == Some(StageStatus::Completed) {
                continue;
            }

            let exit = match (*stage, connector.as_deref()) {
                (PULL, Some(connector)) => run_pull(&self.inner, tracker, control, connector).await?,
                (PUSH, Some(connector)) => {
                    let scope = match operation_type {
                        OperationType::Update => PushScope::NonDelete,
                        OperationType::Delete => PushScope::DeleteOnly,
                        _ => PushScope::All,
                    };
                    run_push(&self.inner, tracker, control, connector, scope).await?
                }
                (EXECUTE, None) => run_execute(&self.imports(), tracker, control).await?,
                (other, _) => StageExit::Failed(format!("stage {} cannot run on a worker", other)),
            };
            if exit != StageExit::Completed {
                return Ok(exit);
            }
        }
        Ok(StageExit::Completed)
    }

    /// Persist how the worker stopped. Runs under the control lock so a
    /// concurrent pause, resume or cancel sees either the old or the new state.
    async fn finish(
        &self,
        tracker: &mut OperationTracker,
        control: &ControlReceiver,
        exit: StageExit,
    ) -> CatalogResult<()> {
        let _guard = self.inner.control_lock.lock().await;
        let now = Utc::now();

        // A cancel that raced a pause wins.
        let exit = match exit {
            StageExit::Paused { .. } if control.is_cancelled() => StageExit::Cancelled,
            other => other,
        };

        match exit {
            StageExit::Completed => {
                tracker.update(|op| op.mark_completed(now))?;
                tracker.publish_status(EventType::Complete, "operation completed");
                self.retire(tracker);
                info!(
                    operation_id = %tracker.op().id,
                    items = tracker.op().items_processed,
                    failed = tracker.op().failed_items,
                    "Operation completed"
                );
            }
            StageExit::Paused { reason, cursor } => {
                tracker.update(|op| op.mark_paused(reason.clone(), cursor.clone(), now))?;
                tracker.publish_status(EventType::Log, "operation paused");
                info!(
                    operation_id = %tracker.op().id,
                    reason = ?reason,
                    resume_cursor = ?cursor,
                    "Operation paused"
                );
            }
            StageExit::Cancelled => {
                tracker.update(|op| op.mark_cancelled(now))?;
                self.fail_import(tracker.op(), "cancelled");
                tracker.publish_status(EventType::Complete, "operation cancelled");
                self.retire(tracker);
                info!(operation_id = %tracker.op().id, "Operation cancelled");
            }
            StageExit::Failed(reason) => {
                tracker.update(|op| {
                    let running = op
                        .stages
                        .iter()
                        .find(|s| s.status == StageStatus::Running)
                        .map(|s| s.name.clone());
                    if let Some(stage) = running {
                        op.fail_stage(&stage, reason.clone(), now)?;
                    }
                    op.mark_failed(reason.clone(), now)
                })?;
                self.fail_import(tracker.op(), &reason);
                tracker.publish_status(EventType::Complete, "operation failed");
                self.retire(tracker);
                warn!(operation_id = %tracker.op().id, error = %reason, "Operation failed");
            }
        }
        Ok(())
    }

    async fn fail_after_error(&self, operation_id: OperationId, reason: &str) -> CatalogResult<()> {
        let _guard = self.inner.control_lock.lock().await;
        let now = Utc::now();
        let op = retry_on_conflict(self.inner.config.cas_retry_limit, || {
            let mut op = self.get(operation_id)?;
            if matches!(op.status, OperationStatus::Pending | OperationStatus::Running) {
                op.mark_failed(reason, now)?;
                return self.inner.store.operation_update(&op);
            }
            Ok(op)
        })?;
        let failed_here = op.status == OperationStatus::Failed;
        if failed_here {
            self.fail_import(&op, reason);
        }
        let tracker = self.tracker(op);
        if failed_here {
            tracker.publish_status(EventType::Complete, "operation failed");
        }
        if tracker.op().status.is_terminal() {
            self.retire(&tracker);
        }
        Ok(())
    }

    fn fail_import(&self, op: &BatchOperation, reason: &str) {
        if let Some(import_id) = op.import_id {
            if let Err(e) = self.imports().fail_job(import_id, reason) {
                warn!(import_id = %import_id, error = %e, "Could not fail import job");
            }
        }
    }

    // ========================================================================
    // CONTROL
    // ========================================================================

    /// Ask a running operation to pause at its next page or batch boundary.
    ///
    /// Returns the operation as stored when the request was accepted. Use
    /// [`Supervisor::join`] or the bus to observe the pause.
    #[instrument(skip(self))]
    pub async fn pause(&self, operation_id: OperationId) -> CatalogResult<BatchOperation> {
        let _guard = self.inner.control_lock.lock().await;
        let op = self.get(operation_id)?;
        if !op.can_pause {
            return Err(OperationError::CapabilityDenied {
                operation_id,
                action: "pause".to_string(),
            }
            .into());
        }

        let signalled = matches!(op.status, OperationStatus::Pending | OperationStatus::Running)
            && self
                .inner
                .workers
                .get(&operation_id)
                .is_some_and(|slot| slot.is_live() && slot.control.pause());
        if !signalled {
            return Err(OperationError::InvalidTransition {
                operation_id,
                from: op.status,
                to: OperationStatus::Paused,
            }
            .into());
        }
        info!(operation_id = %operation_id, "Pause requested");
        Ok(op)
    }

    /// Continue a paused operation from its stored cursor on a new worker.
    #[instrument(skip(self))]
    pub async fn resume(&self, operation_id: OperationId) -> CatalogResult<BatchOperation> {
        let _guard = self.inner.control_lock.lock().await;
        let op = self.get(operation_id)?;
        if op.status != OperationStatus::Paused {
            return Err(OperationError::InvalidTransition {
                operation_id,
                from: op.status,
                to: OperationStatus::Running,
            }
            .into());
        }
        if op.operation_type != OperationType::Import {
            if let Some(source) = op.source {
                self.connector(source)?;
                self.inner.active_sources.insert(source, operation_id);
            }
        }
        self.await_exit(operation_id).await;

        let mut tracker = self.tracker(op);
        let now = Utc::now();
        tracker.update(|op| op.mark_running(now))?;
        tracker.publish_status(EventType::Log, "operation resumed");
        self.spawn_worker(operation_id);
        info!(
            operation_id = %operation_id,
            resume_cursor = ?tracker.op().resume_cursor,
            "Operation resumed"
        );
        Ok(tracker.op().clone())
    }

    /// Cancel an operation.
    ///
    /// A running worker stops at its next record boundary and keeps the
    /// counts it reached. A paused operation, or an import waiting between
    /// validate and execute, is cancelled immediately.
    #[instrument(skip(self))]
    pub async fn cancel(&self, operation_id: OperationId) -> CatalogResult<BatchOperation> {
        let _guard = self.inner.control_lock.lock().await;
        let op = self.get(operation_id)?;
        if !op.can_cancel {
            return Err(OperationError::CapabilityDenied {
                operation_id,
                action: "cancel".to_string(),
            }
            .into());
        }
        if op.status.is_terminal() || op.status == OperationStatus::Idle {
            return Err(OperationError::InvalidTransition {
                operation_id,
                from: op.status,
                to: OperationStatus::Cancelled,
            }
            .into());
        }

        if op.status != OperationStatus::Paused && self.worker_live(operation_id) {
            if let Some(slot) = self.inner.workers.get(&operation_id) {
                slot.control.cancel();
            }
            info!(operation_id = %operation_id, "Cancel requested");
            return Ok(op);
        }

        self.await_exit(operation_id).await;
        let mut tracker = self.tracker(op);
        let now = Utc::now();
        tracker.update(|op| op.mark_cancelled(now))?;
        self.fail_import(tracker.op(), "cancelled");
        tracker.publish_status(EventType::Complete, "operation cancelled");
        self.retire(&tracker);
        info!(operation_id = %operation_id, "Operation cancelled");
        Ok(tracker.op().clone())
    }

    /// Wait out a worker that already persisted its exit state.
    async fn await_exit(&self, operation_id: OperationId) {
        let handle = self
            .inner
            .workers
            .remove(&operation_id)
            .and_then(|(_, mut slot)| slot.join.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(operation_id = %operation_id, error = %e, "Operation worker panicked");
            }
        }
    }

    // ========================================================================
    // STARTUP
    // ========================================================================

    /// Reconcile state left by a previous process.
    ///
    /// Running and pending operations are failed as orphaned; paused ones
    /// keep their cursor and reclaim their source so they can be resumed.
    #[instrument(skip(self))]
    pub fn recover(&self) -> CatalogResult<ReconcileReport> {
        let report = self.inner.store.reconcile_orphaned(Utc::now())?;
        for operation_id in &report.failed_operations {
            let op = self.get(*operation_id)?;
            let tracker = self.tracker(op);
            tracker.publish_status(EventType::Complete, catalog_storage::ORPHANED_AT_STARTUP);
            tracker.close_topics();
        }

        let paused = self.list(&OperationFilter {
            status: Some(OperationStatus::Paused),
            ..Default::default()
        })?;
        for op in paused {
            if op.operation_type == OperationType::Import {
                continue;
            }
            if let Some(source) = op.source {
                self.inner.active_sources.insert(source, op.id);
            }
        }

        if !report.is_empty() {
            warn!(
                operations = report.failed_operations.len(),
                imports = report.failed_imports.len(),
                "Failed work orphaned by a previous process"
            );
        }
        Ok(report)
    }
}
