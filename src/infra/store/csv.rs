//! Delimited-text task table guarded by a sibling lock file.
//!
//! Writers take the lock by creating `<file>.lock` exclusively, copy the live
//! table into it as a backup, reload the table, change one cell and write the
//! whole table back. A failed rewrite is undone from the backup. The lock file
//! is removed afterwards unless it is the only surviving copy of the table.
//!
//! Cells are typed on read (see [`parse_cell`]). A rewrite keeps the original
//! text of every cell whose typed value did not change, so `007` or `1e3`
//! survive writes to other cells verbatim.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Number, Value};

use crate::config::{LockConfig, WriteTimeoutPolicy};
use crate::core::table::Table;
use crate::core::SchedulerError;
use crate::infra::store::{TableStore, WriteOutcome};

/// Task table stored as a CSV (or other delimited) file.
pub struct CsvStore {
    file: Arc<CsvFile>,
    lock: LockConfig,
    writers: tokio::sync::Mutex<()>,
}

struct CsvFile {
    path: PathBuf,
    lock_path: PathBuf,
    delimiter: u8,
}

/// Table as read from disk, before typing.
struct RawTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    fn typed(&self) -> Table {
        Table::new(
            self.header.clone(),
            self.rows
                .iter()
                .map(|row| row.iter().map(|cell| parse_cell(cell)).collect())
                .collect(),
        )
    }

    /// Original text for `value` at (`row`, `column`) if it still parses to it.
    fn original(&self, row: usize, column: Option<usize>, value: &Value) -> Option<&str> {
        let raw = self.rows.get(row)?.get(column?)?;
        (parse_cell(raw) == *value).then_some(raw.as_str())
    }
}

enum Committed {
    Written(Table),
    RolledBack(SchedulerError),
}

impl CsvStore {
    /// Store for the file at `path`.
    pub fn new(path: impl Into<PathBuf>, delimiter: u8, lock: LockConfig) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            file: Arc::new(CsvFile {
                path,
                lock_path,
                delimiter,
            }),
            lock,
            writers: tokio::sync::Mutex::new(()),
        }
    }

    /// Table file.
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Sentinel whose presence means a write is in progress.
    pub fn lock_path(&self) -> &Path {
        &self.file.lock_path
    }

    async fn check_stale_lock(&self) -> Result<(), SchedulerError> {
        if !tokio::fs::try_exists(self.lock_path()).await? {
            return Ok(());
        }
        if !self.lock.clear_stale_lock {
            return Err(SchedulerError::StaleLock(self.lock_path().to_path_buf()));
        }
        tracing::warn!(
            "removing stale lock {} left by a previous run",
            self.lock_path().display()
        );
        match tokio::fs::remove_file(self.lock_path()).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Poll for the lock file, creating it once it is absent.
    async fn acquire_lock(&self) -> Result<bool, SchedulerError> {
        let mut attempt = 0;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.lock_path())
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt >= self.lock.retries {
                        return Ok(false);
                    }
                    attempt += 1;
                    tokio::time::sleep(self.lock.backoff()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `mutate` against a fresh copy of the table under the lock.
    /// `None` means the lock could not be taken.
    async fn transact<F>(&self, mutate: F) -> Result<Option<Committed>, SchedulerError>
    where
        F: FnOnce(&mut Table) -> Result<(), SchedulerError> + Send + 'static,
    {
        let _in_process = self.writers.lock().await;
        if !self.acquire_lock().await? {
            return Ok(None);
        }
        let file = Arc::clone(&self.file);
        let committed = tokio::task::spawn_blocking(move || file.transact(mutate)).await??;
        Ok(Some(committed))
    }
}

#[async_trait]
impl TableStore for CsvStore {
    fn describe(&self) -> String {
        format!("csv:{}", self.path().display())
    }

    async fn load(&self) -> Result<Table, SchedulerError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.read()).await?
    }

    async fn prepare(&self, id_column: &str) -> Result<Table, SchedulerError> {
        self.check_stale_lock().await?;
        let id_column = id_column.to_string();
        let committed = self
            .transact(move |table| {
                let assigned = table.assign_ids(&id_column);
                if assigned > 0 {
                    tracing::info!("assigned {assigned} new row identifier(s)");
                }
                Ok(())
            })
            .await?;
        match committed {
            Some(Committed::Written(table)) => Ok(table),
            Some(Committed::RolledBack(err)) => Err(err),
            None => Err(SchedulerError::WriteContention(format!(
                "{} stayed locked while assigning identifiers",
                self.lock_path().display()
            ))),
        }
    }

    async fn write_cell(
        &self,
        id_column: &str,
        row_id: &str,
        column: &str,
        value: &Value,
    ) -> Result<WriteOutcome, SchedulerError> {
        let (id_col, row, col, cell) = (
            id_column.to_string(),
            row_id.to_string(),
            column.to_string(),
            value.clone(),
        );
        let committed = self
            .transact(move |table| {
                if table.set(&id_col, &row, &col, cell) {
                    Ok(())
                } else {
                    Err(SchedulerError::Store(format!("no row with {id_col} = {row}")))
                }
            })
            .await?;

        match committed {
            Some(Committed::Written(_)) => Ok(WriteOutcome::Written),
            Some(Committed::RolledBack(err)) => {
                tracing::warn!(
                    "write of {column} for row {row_id} failed and was rolled back: {err}"
                );
                Ok(WriteOutcome::RolledBack)
            }
            None => match self.lock.on_timeout {
                WriteTimeoutPolicy::Drop => {
                    tracing::error!(
                        "could not lock {} after {} retries, dropping write of {column} for row {row_id}",
                        self.path().display(),
                        self.lock.retries
                    );
                    Ok(WriteOutcome::Dropped)
                }
                WriteTimeoutPolicy::Fail => Err(SchedulerError::WriteContention(format!(
                    "{} stayed locked after {} retries",
                    self.lock_path().display(),
                    self.lock.retries
                ))),
            },
        }
    }
}

impl CsvFile {
    fn read_raw(&self) -> Result<RawTable, SchedulerError> {
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| SchedulerError::Store(format!("{}: {e}", self.path.display())))?;
        let header = reader
            .headers()
            .map_err(SchedulerError::store)?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(SchedulerError::store)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(RawTable { header, rows })
    }

    fn read(&self) -> Result<Table, SchedulerError> {
        Ok(self.read_raw()?.typed())
    }

    fn write(&self, table: &Table, original: &RawTable) -> Result<(), SchedulerError> {
        let mut writer = ::csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&self.path)
            .map_err(SchedulerError::store)?;
        writer
            .write_record(table.columns())
            .map_err(SchedulerError::store)?;
        let sources: Vec<Option<usize>> = table
            .columns()
            .iter()
            .map(|c| original.header.iter().position(|h| h == c))
            .collect();
        for (r, row) in table.rows().iter().enumerate() {
            let cells = row.iter().zip(&sources).map(|(value, source)| {
                original
                    .original(r, *source, value)
                    .map_or_else(|| format_cell(value), str::to_string)
            });
            writer.write_record(cells).map_err(SchedulerError::store)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Called with the lock held. Releases it unless the backup must be kept.
    fn transact<F>(&self, mutate: F) -> Result<Committed, SchedulerError>
    where
        F: FnOnce(&mut Table) -> Result<(), SchedulerError>,
    {
        if let Err(e) = fs::copy(&self.path, &self.lock_path) {
            self.release_lock();
            return Err(e.into());
        }

        let attempt = self.read_raw().and_then(|raw| {
            let mut table = raw.typed();
            mutate(&mut table)?;
            self.write(&table, &raw)?;
            Ok(table)
        });

        match attempt {
            Ok(table) => {
                self.release_lock();
                Ok(Committed::Written(table))
            }
            Err(err) => {
                if let Err(restore) = fs::copy(&self.lock_path, &self.path) {
                    tracing::error!(
                        "restoring {} failed, backup kept at {}: {restore}",
                        self.path.display(),
                        self.lock_path.display()
                    );
                    return Err(SchedulerError::Store(format!(
                        "write failed ({err}) and restore failed ({restore})"
                    )));
                }
                tracing::warn!("restored {} from backup", self.path.display());
                self.release_lock();
                Ok(Committed::RolledBack(err))
            }
        }
    }

    fn release_lock(&self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            tracing::error!("failed to remove lock {}: {e}", self.lock_path.display());
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Type a cell read from text: empty is null, then integer, float, boolean,
/// falling back to the text itself.
fn parse_cell(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Some(float) = raw
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
    {
        return Value::Number(float);
    }
    match raw {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
