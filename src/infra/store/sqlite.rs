//! Task table inside a SQLite database.
//!
//! Every operation opens its own connection and relies on SQLite's statement
//! atomicity; there is no application-level lock. Columns missing from the
//! table are added on first write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection};
use serde_json::{Number, Value};

use crate::core::table::{is_null, new_row_id, Table};
use crate::core::SchedulerError;
use crate::infra::store::{TableStore, WriteOutcome};

/// Task table stored in a SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    table: String,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Store for `table` inside the database at `path`.
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// How long a statement waits for a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, SchedulerError> {
        let conn = Connection::open(&self.path).map_err(SchedulerError::store)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(SchedulerError::store)?;
        Ok(conn)
    }

    fn columns(&self, conn: &Connection) -> Result<Vec<String>, SchedulerError> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote(&self.table)))
            .map_err(SchedulerError::store)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(SchedulerError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(SchedulerError::store)?;
        if names.is_empty() {
            return Err(SchedulerError::Store(format!(
                "table {} not found in {}",
                self.table,
                self.path.display()
            )));
        }
        Ok(names)
    }

    fn ensure_column(&self, conn: &Connection, column: &str) -> Result<(), SchedulerError> {
        if self.columns(conn)?.iter().any(|c| c == column) {
            return Ok(());
        }
        self.add_column(conn, column)
    }

    fn add_column(&self, conn: &Connection, column: &str) -> Result<(), SchedulerError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote(&self.table),
            quote(column)
        );
        match conn.execute(&sql, []) {
            Ok(_) => {
                tracing::info!("added column {column} to {}", self.table);
                Ok(())
            }
            Err(e) => {
                // another writer may have added it first
                if self.columns(conn)?.iter().any(|c| c == column) {
                    tracing::debug!("column {column} appeared concurrently: {e}");
                    Ok(())
                } else {
                    Err(SchedulerError::store(e))
                }
            }
        }
    }

    fn read(&self, conn: &Connection) -> Result<Table, SchedulerError> {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote(&self.table)))
            .map_err(SchedulerError::store)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(SchedulerError::store)?;
        while let Some(row) = cursor.next().map_err(SchedulerError::store)? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(from_sql(row.get_ref(idx).map_err(SchedulerError::store)?));
            }
            rows.push(cells);
        }
        Ok(Table::new(columns, rows))
    }

    fn prepare_blocking(&self, id_column: &str) -> Result<Table, SchedulerError> {
        let mut conn = self.connect()?;
        self.ensure_column(&conn, id_column)?;

        let tx = conn.transaction().map_err(SchedulerError::store)?;
        let missing = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT rowid, {id} FROM {table}",
                    id = quote(id_column),
                    table = quote(&self.table)
                ))
                .map_err(SchedulerError::store)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, from_sql(row.get_ref(1)?)))
                })
                .map_err(SchedulerError::store)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(SchedulerError::store)?;
            rows.into_iter()
                .filter(|(_, id)| is_null(id))
                .map(|(rowid, _)| rowid)
                .collect::<Vec<_>>()
        };
        let update = format!(
            "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
            quote(&self.table),
            quote(id_column)
        );
        for rowid in &missing {
            tx.execute(&update, params![new_row_id(), rowid])
                .map_err(SchedulerError::store)?;
        }
        tx.commit().map_err(SchedulerError::store)?;
        if !missing.is_empty() {
            tracing::info!("assigned {} new row identifier(s)", missing.len());
        }

        self.read(&conn)
    }

    fn write_blocking(
        &self,
        id_column: &str,
        row_id: &str,
        column: &str,
        value: &Value,
    ) -> Result<WriteOutcome, SchedulerError> {
        let conn = self.connect()?;
        self.ensure_column(&conn, column)?;
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote(&self.table),
            quote(column),
            quote(id_column)
        );
        let changed = conn
            .execute(&sql, params![to_sql(value), row_id])
            .map_err(SchedulerError::store)?;
        if changed == 0 {
            return Err(SchedulerError::Store(format!(
                "no row with {id_column} = {row_id}"
            )));
        }
        Ok(WriteOutcome::Written)
    }
}

#[async_trait]
impl TableStore for SqliteStore {
    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.table)
    }

    async fn load(&self) -> Result<Table, SchedulerError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read(&store.connect()?)).await?
    }

    async fn prepare(&self, id_column: &str) -> Result<Table, SchedulerError> {
        let store = self.clone();
        let id_column = id_column.to_string();
        tokio::task::spawn_blocking(move || store.prepare_blocking(&id_column)).await?
    }

    async fn write_cell(
        &self,
        id_column: &str,
        row_id: &str,
        column: &str,
        value: &Value,
    ) -> Result<WriteOutcome, SchedulerError> {
        let store = self.clone();
        let (id_column, row_id, column, value) = (
            id_column.to_string(),
            row_id.to_string(),
            column.to_string(),
            value.clone(),
        );
        tokio::task::spawn_blocking(move || {
            store.write_blocking(&id_column, &row_id, &column, &value)
        })
        .await?
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Booleans become integers and nested values JSON text.
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or_else(|| SqlValue::Text(n.to_string())),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}
