//! Runner and task-table store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default name of the row identifier column.
pub const DEFAULT_ID_COLUMN: &str = ":uuid:";
/// Default name of the return-value column.
pub const DEFAULT_RETVAL_COLUMN: &str = ":retval:";

/// Scheduling behaviour of a [`Runner`](crate::core::Runner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Columns whose null cells mark a row as not yet done.
    #[serde(default)]
    pub continue_cols: Vec<String>,
    /// Run every row regardless of the continuation columns.
    #[serde(default)]
    pub force_rerun: bool,
    /// Column holding the row identifier.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Column receiving the experiment's return value; `None` discards it.
    #[serde(default = "default_retval_column")]
    pub retval_column: Option<String>,
    /// Arguments passed to every row unless the row has its own column.
    #[serde(default)]
    pub extra_args: Map<String, Value>,
    /// Deadline applied to each acquisition made through a task context.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_retval_column() -> Option<String> {
    Some(DEFAULT_RETVAL_COLUMN.to_string())
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            continue_cols: Vec::new(),
            force_rerun: false,
            id_column: default_id_column(),
            retval_column: default_retval_column(),
            extra_args: Map::new(),
            acquire_timeout_secs: None,
        }
    }
}

impl RunnerConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the continuation columns.
    #[must_use]
    pub fn with_continue_cols<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.continue_cols = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Run every row.
    #[must_use]
    pub const fn with_force_rerun(mut self, force: bool) -> Self {
        self.force_rerun = force;
        self
    }

    /// Change the return-value column, or disable it with `None`.
    #[must_use]
    pub fn with_retval_column(mut self, column: Option<&str>) -> Self {
        self.retval_column = column.map(str::to_string);
        self
    }

    /// Add an argument given to every row.
    #[must_use]
    pub fn with_extra_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_args.insert(name.into(), value.into());
        self
    }

    /// Bound every acquisition made by the rows.
    #[must_use]
    pub const fn with_acquire_timeout_secs(mut self, secs: u64) -> Self {
        self.acquire_timeout_secs = Some(secs);
        self
    }

    /// Acquisition deadline as a duration.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }

    /// Validate runner settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.id_column.is_empty() {
            return Err("id_column must not be empty".into());
        }
        if self.retval_column.as_deref() == Some(self.id_column.as_str()) {
            return Err("retval_column must differ from id_column".into());
        }
        if self.retval_column.as_deref() == Some("") {
            return Err("retval_column must not be empty".into());
        }
        if self.continue_cols.contains(&self.id_column) {
            return Err("id_column cannot be a continuation column".into());
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// What a flat-file store does when its lock stays busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTimeoutPolicy {
    /// Log an error and lose the write.
    #[default]
    Drop,
    /// Return a contention error to the writer.
    Fail,
}

/// Lock-file protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Attempts after the first before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Sleep between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Behaviour once retries are exhausted.
    #[serde(default)]
    pub on_timeout: WriteTimeoutPolicy,
    /// Delete a lock file left by a previous run instead of refusing to start.
    #[serde(default)]
    pub clear_stale_lock: bool,
}

const fn default_retries() -> u32 {
    10
}

const fn default_backoff_ms() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            on_timeout: WriteTimeoutPolicy::default(),
            clear_stale_lock: false,
        }
    }
}

impl LockConfig {
    /// Sleep between attempts.
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Task table backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Delimited text file guarded by a sibling lock file.
    Csv {
        /// Table file.
        path: PathBuf,
        /// Field separator.
        #[serde(default = "default_delimiter")]
        delimiter: char,
        /// Lock protocol.
        #[serde(default)]
        lock: LockConfig,
    },
    /// Table inside a SQLite database.
    Sqlite {
        /// Database file.
        path: PathBuf,
        /// Table name.
        table: String,
        /// How long a write waits on a locked database.
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
}

const fn default_delimiter() -> char {
    ','
}

const fn default_busy_timeout_ms() -> u64 {
    5000
}

impl StoreConfig {
    /// CSV store at `path` with default settings.
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self::Csv {
            path: path.into(),
            delimiter: default_delimiter(),
            lock: LockConfig::default(),
        }
    }

    /// SQLite store for `table` in the database at `path`.
    pub fn sqlite(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self::Sqlite {
            path: path.into(),
            table: table.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    /// Validate backend settings.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Csv {
                path,
                delimiter,
                lock,
            } => {
                if path.as_os_str().is_empty() {
                    return Err("csv path must not be empty".into());
                }
                if !delimiter.is_ascii() || *delimiter == '"' || *delimiter == '\n' {
                    return Err(format!("unsupported delimiter {delimiter:?}"));
                }
                if lock.backoff_ms == 0 {
                    return Err("lock backoff_ms must be greater than 0".into());
                }
            }
            Self::Sqlite { path, table, .. } => {
                if path.as_os_str().is_empty() {
                    return Err("sqlite path must not be empty".into());
                }
                if table.is_empty() {
                    return Err("sqlite table must not be empty".into());
                }
            }
        }
        Ok(())
    }
}
