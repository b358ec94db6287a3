//! Runtime construction for the synchronous entry points.

pub mod tokio_runtime;

pub use tokio_runtime::build_runtime;
