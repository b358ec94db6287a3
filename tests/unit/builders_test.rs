//! Tests for builder modules

use std::sync::Arc;

use ml_scheduler::builders::{build_pools_with_probe, build_store};
use ml_scheduler::config::{PoolConfig, PoolKind, SchedulerConfig, StoreConfig};
use ml_scheduler::core::{AcquireOptions, Allocator, Pool, SchedulerError};
use ml_scheduler::pools::GpuProbe;

struct TwoIdleGpus;

impl GpuProbe for TwoIdleGpus {
    fn device_indices(&self) -> Result<Vec<u32>, SchedulerError> {
        Ok(vec![0, 1])
    }

    fn free_memory_percent(&self, _index: u32) -> Option<f64> {
        Some(100.0)
    }
}

fn config(pools: &[(&str, PoolKind)]) -> SchedulerConfig {
    SchedulerConfig {
        pools: pools
            .iter()
            .map(|(name, kind)| {
                let mut cfg = PoolConfig::new(kind.clone());
                cfg.poll_interval_ms = 5;
                ((*name).to_string(), cfg)
            })
            .collect(),
        store: StoreConfig::csv("unused.csv"),
        runner: Default::default(),
        runtime: Default::default(),
    }
}

#[tokio::test]
async fn test_registry_hands_out_typed_allocators() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&[
        (
            "slots",
            PoolKind::Counter {
                size: 2,
                available: None,
            },
        ),
        (
            "gpu",
            PoolKind::Gpu {
                ids: vec![1],
                min_free_percent: 10.0,
            },
        ),
        (
            "scratch",
            PoolKind::Disk {
                path: dir.path().to_path_buf(),
                unit: Default::default(),
                max_copies: 1,
            },
        ),
    ]);
    let registry = build_pools_with_probe(&cfg, Arc::new(TwoIdleGpus)).unwrap();
    assert_eq!(registry.names(), vec!["gpu", "scratch", "slots"]);

    let slots = registry.counter("slots").unwrap();
    assert_eq!(slots.pool().total_size(), 2);
    let set = slots.acquire(&2, &AcquireOptions::default()).await.unwrap();
    assert_eq!(set.size(), 2);
    set.cleanup().await;

    let gpu = registry.gpu("gpu").unwrap();
    let set = gpu.acquire(&1, &AcquireOptions::default()).await.unwrap();
    assert_eq!(set.cuda_visible_devices(), "1");
    set.cleanup().await;

    // the copy allocator is shared, not rebuilt per lookup
    assert!(Arc::ptr_eq(
        &registry.copier("scratch").unwrap(),
        &registry.copier("scratch").unwrap()
    ));
    assert!(registry.disk("scratch").is_ok());
}

#[test]
fn test_registry_rejects_wrong_kind_and_unknown_names() {
    let cfg = config(&[(
        "slots",
        PoolKind::Counter {
            size: 1,
            available: None,
        },
    )]);
    let registry = build_pools_with_probe(&cfg, Arc::new(TwoIdleGpus)).unwrap();
    assert!(matches!(registry.gpu("slots"), Err(SchedulerError::Config(_))));
    assert!(matches!(registry.counter("nope"), Err(SchedulerError::Config(_))));
}

#[test]
fn test_missing_gpu_fails_at_startup() {
    let cfg = config(&[(
        "gpu",
        PoolKind::Gpu {
            ids: vec![0, 7],
            min_free_percent: 10.0,
        },
    )]);
    let err = build_pools_with_probe(&cfg, Arc::new(TwoIdleGpus)).err().unwrap();
    assert!(matches!(err, SchedulerError::Config(_)));
}

#[tokio::test]
async fn test_build_store_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.csv");
    std::fs::write(&path, "lr\n0.1\n").unwrap();

    let store = build_store(&StoreConfig::csv(&path)).unwrap();
    assert!(store.describe().starts_with("csv:"));
    assert_eq!(store.prepare(":uuid:").await.unwrap().len(), 1);

    let sqlite = build_store(&StoreConfig::sqlite(dir.path().join("runs.db"), "runs")).unwrap();
    assert!(sqlite.describe().starts_with("sqlite:"));

    let bad = StoreConfig::Csv {
        path: path.clone(),
        delimiter: '→',
        lock: Default::default(),
    };
    assert!(matches!(build_store(&bad), Err(SchedulerError::Config(_))));
}
