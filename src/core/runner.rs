//! Resumable task queue over a persistent table.
//!
//! A run reads the table once, gives new rows an identifier, and spawns one
//! task per row whose continuation columns are still empty. Results are
//! drained in completion order and written back cell by cell, so an
//! interrupted run can be started again and only picks up unfinished rows.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{RunnerConfig, RuntimeConfig};
use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::context::{Reporter, TaskContext};
use crate::core::executor::{Experiment, RowArgs};
use crate::core::SchedulerError;
use crate::infra::store::{TableStore, WriteOutcome};
use crate::runtime::build_runtime;

/// Counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Rows in the table.
    pub total: usize,
    /// Rows a task was spawned for.
    pub scheduled: usize,
    /// Rows already complete.
    pub skipped: usize,
    /// Tasks whose experiment returned a value.
    pub completed: usize,
    /// Tasks whose experiment failed or panicked.
    pub failed: usize,
    /// Tasks interrupted by cancellation.
    pub cancelled: usize,
}

/// Drives an [`Experiment`] over every pending row of a [`TableStore`].
pub struct Runner {
    store: Arc<dyn TableStore>,
    experiment: Arc<dyn Experiment>,
    config: RunnerConfig,
    audit: Option<Arc<dyn AuditSink>>,
    cancel: CancellationToken,
}

enum RowStatus {
    Done(Value),
    Failed,
    Cancelled,
}

struct RowOutcome {
    row_id: String,
    status: RowStatus,
}

impl Runner {
    /// Create a runner for `experiment` over `store`.
    pub fn new(
        store: Arc<dyn TableStore>,
        experiment: impl Experiment,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            experiment: Arc::new(experiment),
            config,
            audit: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Send lifecycle events to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Token that interrupts the run when cancelled: pending acquisitions
    /// fail, running programs are killed and their results are not recorded.
    ///
    /// Cancellation is final. Once the token fires, every later
    /// [`Runner::run`] on this runner returns [`SchedulerError::Cancelled`]
    /// without touching the store; build a new runner to resume.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runner settings.
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every pending row to completion on the current runtime.
    ///
    /// Failures of individual rows are logged and counted; only store and
    /// configuration problems at startup abort the run.
    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        self.config.validate().map_err(SchedulerError::Config)?;
        if self.cancel.is_cancelled() {
            tracing::warn!("runner was cancelled, not starting {}", self.store.describe());
            return Err(SchedulerError::Cancelled);
        }
        let id_column = self.config.id_column.as_str();

        let table = self.store.prepare(id_column).await?;
        let pending = table.pending_rows(&self.config.continue_cols, self.config.force_rerun);
        let mut summary = RunSummary {
            total: table.len(),
            skipped: table.len() - pending.len(),
            ..RunSummary::default()
        };
        tracing::info!(
            "Adding {} tasks ({} skipped) from {}.",
            pending.len(),
            summary.skipped,
            self.store.describe()
        );

        let writer = Arc::new(StoreReporter {
            store: Arc::clone(&self.store),
            id_column: id_column.to_string(),
            audit: self.audit.clone(),
        });
        let reporter: Arc<dyn Reporter> = writer.clone();

        let mut tasks = JoinSet::new();
        for row in pending {
            let Some(row_id) = table.row_id(id_column, row) else {
                tracing::warn!("row {row} has no identifier, skipping");
                continue;
            };
            let mut args = RowArgs::new(table.row_args(id_column, row));
            args.merge_missing(&self.config.extra_args);

            self.record(&row_id, AuditAction::Submit, None);
            let ctx = TaskContext::new(
                row_id,
                Arc::clone(&reporter),
                self.cancel.clone(),
                self.config.acquire_timeout(),
            );
            tasks.spawn(run_row(
                Arc::clone(&self.experiment),
                ctx,
                args,
                self.audit.clone(),
            ));
            summary.scheduled += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("task aborted: {e}");
                    summary.failed += 1;
                    continue;
                }
            };
            let retval = match outcome.status {
                RowStatus::Done(value) => {
                    summary.completed += 1;
                    value
                }
                RowStatus::Failed => {
                    summary.failed += 1;
                    Value::String(String::new())
                }
                RowStatus::Cancelled => {
                    summary.cancelled += 1;
                    continue;
                }
            };
            if let Some(column) = &self.config.retval_column {
                if let Err(e) = writer.write(&outcome.row_id, column, &retval).await {
                    tracing::error!("could not record result of {}: {e}", outcome.row_id);
                }
            }
        }

        tracing::info!(
            "run finished: {} completed, {} failed, {} cancelled, {} skipped",
            summary.completed,
            summary.failed,
            summary.cancelled,
            summary.skipped
        );
        Ok(summary)
    }

    /// Build a runtime from `runtime` and block on [`Runner::run`].
    pub fn run_blocking(&self, runtime: &RuntimeConfig) -> Result<RunSummary, SchedulerError> {
        build_runtime(runtime)?.block_on(self.run())
    }

    fn record(&self, row_id: &str, action: AuditAction, payload: Option<Value>) {
        record(self.audit.as_deref(), row_id, action, payload);
    }
}

fn record(audit: Option<&dyn AuditSink>, row_id: &str, action: AuditAction, payload: Option<Value>) {
    if let Some(sink) = audit {
        sink.record(build_audit_event(row_id, action, payload));
    }
}

async fn run_row(
    experiment: Arc<dyn Experiment>,
    ctx: TaskContext,
    args: RowArgs,
    audit: Option<Arc<dyn AuditSink>>,
) -> RowOutcome {
    let row_id = ctx.id().to_string();
    tracing::info!("Task {row_id} created");
    record(audit.as_deref(), &row_id, AuditAction::Start, None);

    let result = AssertUnwindSafe(experiment.run(ctx.clone(), args))
        .catch_unwind()
        .await;
    ctx.cleanup().await;

    let status = match result {
        Ok(Ok(value)) => RowStatus::Done(value),
        Ok(Err(err)) => {
            let cancelled = ctx.cancellation_token().is_cancelled()
                || err
                    .downcast_ref::<SchedulerError>()
                    .is_some_and(SchedulerError::is_cancelled);
            if cancelled {
                tracing::warn!("Task {row_id} cancelled");
                RowStatus::Cancelled
            } else {
                tracing::error!("Task {row_id} failed: {err:#}");
                RowStatus::Failed
            }
        }
        Err(panic) => {
            tracing::error!("Task {row_id} panicked: {}", panic_message(panic.as_ref()));
            RowStatus::Failed
        }
    };

    let label = match &status {
        RowStatus::Done(_) => "done",
        RowStatus::Failed => "failed",
        RowStatus::Cancelled => "cancelled",
    };
    tracing::info!("Task {row_id} finished ({label})");
    record(
        audit.as_deref(),
        &row_id,
        AuditAction::Finish,
        Some(json!({ "status": label })),
    );
    RowOutcome { row_id, status }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Writes reported metrics to the store one cell at a time.
struct StoreReporter {
    store: Arc<dyn TableStore>,
    id_column: String,
    audit: Option<Arc<dyn AuditSink>>,
}

#[async_trait]
impl Reporter for StoreReporter {
    async fn report(&self, row_id: &str, metrics: Map<String, Value>) -> Result<(), SchedulerError> {
        let payload = Value::Object(metrics.clone());
        tracing::debug!("report {row_id}: {payload}");
        record(self.audit.as_deref(), row_id, AuditAction::Report, Some(payload));
        for (column, value) in &metrics {
            self.write(row_id, column, value).await?;
        }
        Ok(())
    }
}

impl StoreReporter {
    async fn write(&self, row_id: &str, column: &str, value: &Value) -> Result<(), SchedulerError> {
        let action = match self
            .store
            .write_cell(&self.id_column, row_id, column, value)
            .await?
        {
            WriteOutcome::Written => return Ok(()),
            WriteOutcome::Dropped => AuditAction::WriteDropped,
            WriteOutcome::RolledBack => AuditAction::WriteRestored,
        };
        record(
            self.audit.as_deref(),
            row_id,
            action,
            Some(json!({ "column": column })),
        );
        Ok(())
    }
}
