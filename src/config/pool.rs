//! Pool, runtime and top-level scheduler configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::runner::{RunnerConfig, StoreConfig};
use crate::core::SchedulerError;
use crate::pools::{DiskUnit, DEFAULT_MAX_COPIES};

/// Kind-specific pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolKind {
    /// Unit slots, of which the first `available` can be handed out.
    Counter {
        /// Number of slots.
        size: usize,
        /// Slots usable right now; defaults to all of them.
        #[serde(default)]
        available: Option<usize>,
    },
    /// GPUs addressed by CUDA index.
    Gpu {
        /// Device indices managed by the pool.
        ids: Vec<u32>,
        /// Devices with less free memory than this are skipped.
        #[serde(default = "default_min_free_percent")]
        min_free_percent: f64,
    },
    /// Capacity on the filesystem holding `path`.
    Disk {
        /// Directory whose filesystem is accounted.
        path: PathBuf,
        /// Unit of every size on this pool.
        #[serde(default)]
        unit: DiskUnit,
        /// Concurrent copies allowed per copy allocator.
        #[serde(default = "default_max_copies")]
        max_copies: usize,
    },
}

/// One named pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Kind-specific settings.
    #[serde(flatten)]
    pub kind: PoolKind,
    /// Delay between two scans by allocators of this pool.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_min_free_percent() -> f64 {
    20.0
}

const fn default_max_copies() -> usize {
    DEFAULT_MAX_COPIES
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

impl PoolConfig {
    /// Pool of `kind` polled every second.
    pub const fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        match &self.kind {
            PoolKind::Counter { size, available } => {
                if *size == 0 {
                    return Err("counter size must be greater than 0".into());
                }
                if available.is_some_and(|a| a > *size) {
                    return Err("available must not exceed size".into());
                }
            }
            PoolKind::Gpu {
                ids,
                min_free_percent,
            } => {
                if ids.is_empty() {
                    return Err("at least one GPU id must be listed".into());
                }
                if !(0.0..=100.0).contains(min_free_percent) {
                    return Err("min_free_percent must be within 0..=100".into());
                }
            }
            PoolKind::Disk {
                path, max_copies, ..
            } => {
                if path.as_os_str().is_empty() {
                    return Err("disk path must not be empty".into());
                }
                if *max_copies == 0 {
                    return Err("max_copies must be greater than 0".into());
                }
            }
        }
        Ok(())
    }
}

/// Tokio runtime sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Threads driving async tasks.
    #[serde(default = "num_cpus::get")]
    pub worker_threads: usize,
    /// Upper bound on threads running blocking work (copies, lock files, subprocess I/O).
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
}

fn default_max_blocking_threads() -> usize {
    num_cpus::get() * 4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            max_blocking_threads: default_max_blocking_threads(),
        }
    }
}

impl RuntimeConfig {
    /// Validate runtime sizing.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than 0".into());
        }
        if self.max_blocking_threads == 0 {
            return Err("max_blocking_threads must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Map of pool name to configuration.
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
    /// Task table backend.
    pub store: StoreConfig,
    /// Scheduling behaviour.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Runtime sizing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Environment variable forcing every row to run again.
pub const ENV_FORCE_RERUN: &str = "ML_SCHEDULER_FORCE_RERUN";
/// Environment variable setting the acquisition deadline in seconds.
pub const ENV_ACQUIRE_TIMEOUT_SECS: &str = "ML_SCHEDULER_ACQUIRE_TIMEOUT_SECS";

impl SchedulerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        self.store
            .validate()
            .map_err(|e| format!("store invalid: {e}"))?;
        self.runner
            .validate()
            .map_err(|e| format!("runner invalid: {e}"))?;
        self.runtime
            .validate()
            .map_err(|e| format!("runtime invalid: {e}"))
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `path`, apply environment overrides (after loading `.env` if
    /// present) and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("ignoring unreadable .env file: {e}");
            }
        }
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: Self = serde_json::from_str(&text)
            .map_err(|e| SchedulerError::Config(format!("parse error: {e}")))?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())
            .map_err(SchedulerError::Config)?;
        cfg.validate().map_err(SchedulerError::Config)?;
        Ok(cfg)
    }

    /// Apply the `ML_SCHEDULER_*` overrides found through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), String> {
        if let Some(raw) = lookup(ENV_FORCE_RERUN) {
            self.runner.force_rerun = parse_flag(&raw)
                .ok_or_else(|| format!("{ENV_FORCE_RERUN}: expected a boolean, got `{raw}`"))?;
        }
        if let Some(raw) = lookup(ENV_ACQUIRE_TIMEOUT_SECS) {
            let secs = raw.trim().parse::<u64>().map_err(|e| {
                format!("{ENV_ACQUIRE_TIMEOUT_SECS}: expected seconds, got `{raw}`: {e}")
            })?;
            self.runner.acquire_timeout_secs = Some(secs);
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
