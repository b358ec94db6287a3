//! Builder for task table stores.

use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::core::SchedulerError;
use crate::infra::store::{CsvStore, SqliteStore, TableStore};

/// Build the store described by `cfg`.
pub fn build_store(cfg: &StoreConfig) -> Result<Arc<dyn TableStore>, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("store invalid: {e}")))?;
    let store: Arc<dyn TableStore> = match cfg {
        StoreConfig::Csv {
            path,
            delimiter,
            lock,
        } => {
            let delimiter = u8::try_from(*delimiter).map_err(|_| {
                SchedulerError::Config(format!("delimiter {delimiter:?} is not ASCII"))
            })?;
            Arc::new(CsvStore::new(path, delimiter, lock.clone()))
        }
        StoreConfig::Sqlite {
            path,
            table,
            busy_timeout_ms,
        } => Arc::new(
            SqliteStore::new(path, table).with_busy_timeout(Duration::from_millis(*busy_timeout_ms)),
        ),
    };
    tracing::debug!("using task store {}", store.describe());
    Ok(store)
}
