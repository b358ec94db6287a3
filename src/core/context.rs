//! Per-row execution handle.
//!
//! A [`TaskContext`] is handed to the experiment for one row. Everything the
//! experiment acquires through it is tracked and released by the runner once
//! the experiment returns, fails or panics.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::allocator::{AcquireOptions, Allocator};
use crate::core::element::ResourceSet;
use crate::core::SchedulerError;

/// Destination for metrics reported by a running row.
#[async_trait]
pub trait Reporter: Send + Sync + 'static {
    /// Persist `metrics` for the row identified by `row_id`.
    async fn report(&self, row_id: &str, metrics: Map<String, Value>) -> Result<(), SchedulerError>;
}

/// How [`TaskContext::run_process`] starts a program.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Keep the parent's environment and layer the given variables on top.
    /// When `false` the child sees only the variables passed in.
    pub inherit_env: bool,
}

impl ProcessOptions {
    /// Run the child in `cwd`.
    #[must_use]
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Keep the parent's environment.
    #[must_use]
    pub const fn inherit_env(mut self) -> Self {
        self.inherit_env = true;
        self
    }
}

struct ContextInner {
    id: String,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
    acquire_timeout: Option<Duration>,
    held: Mutex<Vec<ResourceSet>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for set in self.held.get_mut().drain(..) {
            set.release();
        }
    }
}

/// Handle used by an experiment to acquire resources, run programs and
/// report metrics for its row. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.inner.id)
            .field("held_sets", &self.held_sets())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Create a context for row `id`.
    pub fn new(
        id: impl Into<String>,
        reporter: Arc<dyn Reporter>,
        cancel: CancellationToken,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: id.into(),
                reporter,
                cancel,
                acquire_timeout,
                held: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identifier of the row this context runs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Token cancelled when the run is being shut down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Bounds applied by [`TaskContext::acquire`].
    pub fn acquire_options(&self) -> AcquireOptions {
        let options = AcquireOptions::default().with_cancel(self.inner.cancel.clone());
        match self.inner.acquire_timeout {
            Some(timeout) => options.with_timeout(timeout),
            None => options,
        }
    }

    /// Acquire resources from `allocator`. The set is released automatically
    /// when the row finishes.
    pub async fn acquire<A: Allocator>(
        &self,
        allocator: &A,
        request: A::Request,
    ) -> Result<ResourceSet<A::Element>, SchedulerError> {
        self.acquire_with(allocator, request, &self.acquire_options())
            .await
    }

    /// [`TaskContext::acquire`] with explicit bounds.
    pub async fn acquire_with<A: Allocator>(
        &self,
        allocator: &A,
        request: A::Request,
        options: &AcquireOptions,
    ) -> Result<ResourceSet<A::Element>, SchedulerError> {
        let set = allocator.acquire(&request, options).await?;
        tracing::debug!(
            "task {} acquired {} element(s) from {}",
            self.id(),
            set.len(),
            allocator.describe()
        );
        self.inner.held.lock().push(set.to_dyn());
        Ok(set)
    }

    /// Run `args[0]` with the remaining arguments and `env`, returning its
    /// standard output.
    ///
    /// The child is killed if the run is cancelled while it executes. A
    /// non-zero exit yields [`SchedulerError::ProcessFailed`] carrying the
    /// exit code and the captured output.
    pub async fn run_process<S, E, K, V>(
        &self,
        args: &[S],
        env: E,
        options: &ProcessOptions,
    ) -> Result<String, SchedulerError>
    where
        S: AsRef<OsStr> + Sync,
        E: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let Some((program, rest)) = args.split_first() else {
            return Err(SchedulerError::ProcessSpawn("empty argument vector".into()));
        };
        let program_name = program.as_ref().to_string_lossy().into_owned();

        let mut command = tokio::process::Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if !options.inherit_env {
            command.env_clear();
        }
        command.envs(env);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| SchedulerError::ProcessSpawn(format!("{program_name}: {e}")))?;
        tracing::debug!("task {} started {program_name}", self.id());

        let output = tokio::select! {
            () = self.inner.cancel.cancelled() => {
                tracing::warn!("task {} cancelled, killing {program_name}", self.id());
                return Err(SchedulerError::Cancelled);
            }
            output = child.wait_with_output() => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            Err(SchedulerError::ProcessFailed {
                code: output.status.code(),
                stdout,
            })
        }
    }

    /// Record metrics for this row, one cell per entry.
    pub async fn report<K, V>(
        &self,
        metrics: impl IntoIterator<Item = (K, V)> + Send,
    ) -> Result<(), SchedulerError>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let metrics: Map<String, Value> = metrics
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if metrics.is_empty() {
            return Ok(());
        }
        self.inner.reporter.report(self.id(), metrics).await
    }

    /// Number of resource sets currently held.
    pub fn held_sets(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Release every held resource set and forget them. Sets the experiment
    /// already cleaned up itself are skipped.
    ///
    /// Dropping the last handle to a context releases whatever is still held.
    pub async fn cleanup(&self) {
        let held = std::mem::take(&mut *self.inner.held.lock());
        for set in held {
            set.cleanup().await;
        }
    }
}

/// Reporter that keeps metrics in memory, keyed by row.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    rows: Mutex<HashMap<String, Map<String, Value>>>,
}

impl MemoryReporter {
    /// Metrics recorded for `row_id` so far.
    pub fn metrics(&self, row_id: &str) -> Option<Map<String, Value>> {
        self.rows.lock().get(row_id).cloned()
    }
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn report(&self, row_id: &str, metrics: Map<String, Value>) -> Result<(), SchedulerError> {
        self.rows
            .lock()
            .entry(row_id.to_string())
            .or_default()
            .extend(metrics);
        Ok(())
    }
}
