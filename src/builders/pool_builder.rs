//! Builders to construct resource pools and their allocators from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PoolKind, SchedulerConfig};
use crate::core::{SchedulerError, SlotAllocator};
use crate::pools::{
    CopyAllocator, CounterPool, DiskAllocator, DiskPool, GpuPool, GpuProbe, NvidiaSmiProbe,
};

enum Entry {
    Counter(Arc<SlotAllocator<CounterPool>>),
    Gpu(Arc<SlotAllocator<GpuPool>>),
    Disk {
        reserve: Arc<DiskAllocator>,
        copy: Arc<CopyAllocator>,
    },
}

impl Entry {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Gpu(_) => "gpu",
            Self::Disk { .. } => "disk",
        }
    }
}

/// Allocators for every configured pool, looked up by pool name.
///
/// Allocators are built once, so every caller shares the same copy throttle.
#[derive(Default)]
pub struct PoolRegistry {
    entries: HashMap<String, Entry>,
}

impl PoolRegistry {
    /// Configured pool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn mismatch(&self, name: &str, wanted: &str) -> SchedulerError {
        match self.entries.get(name) {
            Some(entry) => SchedulerError::Config(format!(
                "pool `{name}` is a {} pool, not a {wanted} pool",
                entry.kind()
            )),
            None => SchedulerError::Config(format!("unknown pool `{name}`")),
        }
    }

    /// Allocator for the counter pool `name`.
    pub fn counter(&self, name: &str) -> Result<Arc<SlotAllocator<CounterPool>>, SchedulerError> {
        match self.entries.get(name) {
            Some(Entry::Counter(alloc)) => Ok(Arc::clone(alloc)),
            _ => Err(self.mismatch(name, "counter")),
        }
    }

    /// Allocator for the GPU pool `name`.
    pub fn gpu(&self, name: &str) -> Result<Arc<SlotAllocator<GpuPool>>, SchedulerError> {
        match self.entries.get(name) {
            Some(Entry::Gpu(alloc)) => Ok(Arc::clone(alloc)),
            _ => Err(self.mismatch(name, "gpu")),
        }
    }

    /// Plain reservation allocator for the disk pool `name`.
    pub fn disk(&self, name: &str) -> Result<Arc<DiskAllocator>, SchedulerError> {
        match self.entries.get(name) {
            Some(Entry::Disk { reserve, .. }) => Ok(Arc::clone(reserve)),
            _ => Err(self.mismatch(name, "disk")),
        }
    }

    /// Copy allocator for the disk pool `name`.
    pub fn copier(&self, name: &str) -> Result<Arc<CopyAllocator>, SchedulerError> {
        match self.entries.get(name) {
            Some(Entry::Disk { copy, .. }) => Ok(Arc::clone(copy)),
            _ => Err(self.mismatch(name, "disk")),
        }
    }
}

/// Build every configured pool, probing GPUs with `nvidia-smi`.
pub fn build_pools(cfg: &SchedulerConfig) -> Result<PoolRegistry, SchedulerError> {
    let needs_gpu = cfg
        .pools
        .values()
        .any(|p| matches!(p.kind, PoolKind::Gpu { .. }));
    let probe: Option<Arc<dyn GpuProbe>> = needs_gpu.then(|| {
        let ttl = cfg
            .pools
            .values()
            .map(|p| p.poll_interval_ms)
            .min()
            .unwrap_or(1000);
        Arc::new(NvidiaSmiProbe::new(Duration::from_millis(ttl))) as Arc<dyn GpuProbe>
    });
    build(cfg, probe)
}

/// Build every configured pool, reading GPU telemetry from `probe`.
pub fn build_pools_with_probe(
    cfg: &SchedulerConfig,
    probe: Arc<dyn GpuProbe>,
) -> Result<PoolRegistry, SchedulerError> {
    build(cfg, Some(probe))
}

fn build(
    cfg: &SchedulerConfig,
    probe: Option<Arc<dyn GpuProbe>>,
) -> Result<PoolRegistry, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;

    let mut registry = PoolRegistry::default();
    for (name, pool_cfg) in &cfg.pools {
        let interval = Duration::from_millis(pool_cfg.poll_interval_ms);
        let entry = match &pool_cfg.kind {
            PoolKind::Counter { size, available } => {
                let pool = Arc::new(CounterPool::counter(name, *size, *available));
                Entry::Counter(Arc::new(
                    SlotAllocator::new(pool).with_poll_interval(interval),
                ))
            }
            PoolKind::Gpu {
                ids,
                min_free_percent,
            } => {
                let probe = probe.clone().ok_or_else(|| {
                    SchedulerError::Config(format!("no GPU probe for pool `{name}`"))
                })?;
                let pool = Arc::new(GpuPool::gpus(name, ids, *min_free_percent, probe)?);
                Entry::Gpu(Arc::new(
                    SlotAllocator::new(pool).with_poll_interval(interval),
                ))
            }
            PoolKind::Disk {
                path,
                unit,
                max_copies,
            } => {
                let pool = Arc::new(DiskPool::new(name, path, *unit));
                Entry::Disk {
                    reserve: Arc::new(
                        DiskAllocator::new(Arc::clone(&pool)).with_poll_interval(interval),
                    ),
                    copy: Arc::new(
                        CopyAllocator::new(pool, *max_copies).with_poll_interval(interval),
                    ),
                }
            }
        };
        tracing::debug!("built {} pool `{name}`", entry.kind());
        registry.entries.insert(name.clone(), entry);
    }
    Ok(registry)
}
