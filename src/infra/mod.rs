//! Infrastructure adapters for task table storage.

pub mod store;

pub use store::{CsvStore, InMemoryStore, SqliteStore, TableStore, WriteOutcome};
