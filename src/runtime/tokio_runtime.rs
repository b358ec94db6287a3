//! Tokio runtime construction.

use crate::config::RuntimeConfig;
use crate::core::SchedulerError;

/// Build a multi-threaded runtime sized by `cfg`, with timers and I/O enabled.
pub fn build_runtime(cfg: &RuntimeConfig) -> Result<tokio::runtime::Runtime, SchedulerError> {
    cfg.validate().map_err(SchedulerError::Config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads)
        .max_blocking_threads(cfg.max_blocking_threads)
        .thread_name("ml-scheduler")
        .enable_all()
        .build()?;
    Ok(runtime)
}
