//! In-memory task table for development and testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::core::table::Table;
use crate::core::SchedulerError;
use crate::infra::store::{TableStore, WriteOutcome};

/// Task table kept in process memory. Lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    table: Mutex<Table>,
}

impl InMemoryStore {
    /// Wrap an existing table.
    pub fn new(table: Table) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    /// Copy of the current table.
    pub fn snapshot(&self) -> Table {
        self.table.lock().clone()
    }
}

#[async_trait]
impl TableStore for InMemoryStore {
    fn describe(&self) -> String {
        "memory".into()
    }

    async fn load(&self) -> Result<Table, SchedulerError> {
        Ok(self.snapshot())
    }

    async fn prepare(&self, id_column: &str) -> Result<Table, SchedulerError> {
        let mut table = self.table.lock();
        table.assign_ids(id_column);
        Ok(table.clone())
    }

    async fn write_cell(
        &self,
        id_column: &str,
        row_id: &str,
        column: &str,
        value: &Value,
    ) -> Result<WriteOutcome, SchedulerError> {
        if self.table.lock().set(id_column, row_id, column, value.clone()) {
            Ok(WriteOutcome::Written)
        } else {
            Err(SchedulerError::Store(format!("no row with {id_column} = {row_id}")))
        }
    }
}
