//! Configuration models for pools, stores, the runner and the runtime.

pub mod pool;
pub mod runner;

pub use pool::{
    PoolConfig, PoolKind, RuntimeConfig, SchedulerConfig, ENV_ACQUIRE_TIMEOUT_SECS,
    ENV_FORCE_RERUN,
};
pub use runner::{
    LockConfig, RunnerConfig, StoreConfig, WriteTimeoutPolicy, DEFAULT_ID_COLUMN,
    DEFAULT_RETVAL_COLUMN,
};
