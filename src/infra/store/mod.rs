//! Task table backends.
//!
//! A store owns the persistent copy of the task table. The runner reads it
//! once at submission and then writes single cells as rows report. Every
//! write re-reads the backing data, so concurrent writers never clobber each
//! other's cells.

use async_trait::async_trait;
use serde_json::Value;

use crate::core::table::Table;
use crate::core::SchedulerError;

pub mod csv;
pub mod memory;
pub mod sqlite;

pub use self::csv::CsvStore;
pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;

/// Result of a single cell write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The cell now holds the value.
    Written,
    /// The store stayed locked and the write was abandoned.
    Dropped,
    /// The write failed and the table was restored to its previous content.
    RolledBack,
}

/// Persistent task table.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// Name used in logs.
    fn describe(&self) -> String;

    /// Read the table as it currently is.
    async fn load(&self) -> Result<Table, SchedulerError>;

    /// Read the table, give every row lacking an identifier a fresh one,
    /// persist the identifiers and return the table.
    async fn prepare(&self, id_column: &str) -> Result<Table, SchedulerError>;

    /// Set one cell of the row whose `id_column` equals `row_id`, creating
    /// `column` if it does not exist yet.
    async fn write_cell(
        &self,
        id_column: &str,
        row_id: &str,
        column: &str,
        value: &Value,
    ) -> Result<WriteOutcome, SchedulerError>;
}
