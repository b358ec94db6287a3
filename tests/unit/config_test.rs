//! Tests for configuration parsing and validation

use std::collections::HashMap;

use ml_scheduler::config::{
    LockConfig, PoolConfig, PoolKind, RunnerConfig, SchedulerConfig, StoreConfig,
    WriteTimeoutPolicy, DEFAULT_ID_COLUMN, ENV_ACQUIRE_TIMEOUT_SECS, ENV_FORCE_RERUN,
};
use ml_scheduler::pools::DiskUnit;

const FULL: &str = r#"{
    "pools": {
        "slots": { "kind": "counter", "size": 4, "available": 2 },
        "gpu": { "kind": "gpu", "ids": [0, 1], "poll_interval_ms": 250 },
        "scratch": { "kind": "disk", "path": "/scratch", "unit": "MB" }
    },
    "store": { "kind": "csv", "path": "runs.csv", "delimiter": ";",
               "lock": { "retries": 3, "on_timeout": "fail" } },
    "runner": { "continue_cols": ["acc"], "extra_args": { "epochs": 3 } }
}"#;

#[test]
fn test_full_config_parses_with_defaults() {
    let cfg = SchedulerConfig::from_json_str(FULL).unwrap();

    assert_eq!(
        cfg.pools["slots"].kind,
        PoolKind::Counter {
            size: 4,
            available: Some(2)
        }
    );
    assert_eq!(cfg.pools["slots"].poll_interval_ms, 1000);
    assert_eq!(cfg.pools["gpu"].poll_interval_ms, 250);
    match &cfg.pools["gpu"].kind {
        PoolKind::Gpu {
            min_free_percent, ..
        } => assert!((min_free_percent - 20.0).abs() < f64::EPSILON),
        other => panic!("unexpected pool {other:?}"),
    }
    match &cfg.pools["scratch"].kind {
        PoolKind::Disk {
            unit, max_copies, ..
        } => {
            assert_eq!(*unit, DiskUnit::Mb);
            assert_eq!(*max_copies, 2);
        }
        other => panic!("unexpected pool {other:?}"),
    }

    match &cfg.store {
        StoreConfig::Csv {
            delimiter, lock, ..
        } => {
            assert_eq!(*delimiter, ';');
            assert_eq!(lock.retries, 3);
            assert_eq!(lock.backoff_ms, 100);
            assert_eq!(lock.on_timeout, WriteTimeoutPolicy::Fail);
            assert!(!lock.clear_stale_lock);
        }
        other => panic!("unexpected store {other:?}"),
    }

    assert_eq!(cfg.runner.id_column, DEFAULT_ID_COLUMN);
    assert_eq!(cfg.runner.retval_column.as_deref(), Some(":retval:"));
    assert_eq!(cfg.runner.extra_args["epochs"], 3);
    assert!(!cfg.runner.force_rerun);
}

#[test]
fn test_retval_column_can_be_disabled() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{ "store": { "kind": "sqlite", "path": "runs.db", "table": "runs" },
             "runner": { "retval_column": null } }"#,
    )
    .unwrap();
    assert!(cfg.pools.is_empty());
    assert_eq!(cfg.runner.retval_column, None);
}

#[test]
fn test_pool_config_validation() {
    let zero = PoolConfig::new(PoolKind::Counter {
        size: 0,
        available: None,
    });
    assert!(zero.validate().is_err());

    let over = PoolConfig::new(PoolKind::Counter {
        size: 2,
        available: Some(3),
    });
    assert!(over.validate().is_err());

    let no_gpus = PoolConfig::new(PoolKind::Gpu {
        ids: vec![],
        min_free_percent: 10.0,
    });
    assert!(no_gpus.validate().is_err());

    let mut fast = PoolConfig::new(PoolKind::Counter {
        size: 1,
        available: None,
    });
    assert!(fast.validate().is_ok());
    fast.poll_interval_ms = 0;
    assert!(fast.validate().is_err());
}

#[test]
fn test_runner_config_validation() {
    assert!(RunnerConfig::default().validate().is_ok());

    let clash = RunnerConfig::new().with_retval_column(Some(DEFAULT_ID_COLUMN));
    assert!(clash.validate().is_err());

    let resumes_on_id = RunnerConfig::new().with_continue_cols([DEFAULT_ID_COLUMN]);
    assert!(resumes_on_id.validate().is_err());

    let zero_timeout = RunnerConfig::new().with_acquire_timeout_secs(0);
    assert!(zero_timeout.validate().is_err());
}

#[test]
fn test_store_config_validation() {
    assert!(StoreConfig::csv("runs.csv").validate().is_ok());
    let bad_delimiter = StoreConfig::Csv {
        path: "runs.csv".into(),
        delimiter: 'é',
        lock: LockConfig::default(),
    };
    assert!(bad_delimiter.validate().is_err());
    assert!(StoreConfig::sqlite("runs.db", "").validate().is_err());
}

#[test]
fn test_scheduler_config_reports_failing_pool() {
    let mut pools = HashMap::new();
    pools.insert(
        "broken".to_string(),
        PoolConfig::new(PoolKind::Counter {
            size: 0,
            available: None,
        }),
    );
    let cfg = SchedulerConfig {
        pools,
        store: StoreConfig::csv("runs.csv"),
        runner: RunnerConfig::default(),
        runtime: Default::default(),
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("broken"));
}

#[test]
fn test_env_overrides() {
    let mut cfg = SchedulerConfig::from_json_str(FULL).unwrap();
    cfg.apply_env_overrides(|key| match key {
        ENV_FORCE_RERUN => Some("yes".into()),
        ENV_ACQUIRE_TIMEOUT_SECS => Some("90".into()),
        _ => None,
    })
    .unwrap();
    assert!(cfg.runner.force_rerun);
    assert_eq!(cfg.runner.acquire_timeout_secs, Some(90));

    let err = cfg
        .apply_env_overrides(|key| (key == ENV_FORCE_RERUN).then(|| "maybe".to_string()))
        .unwrap_err();
    assert!(err.contains(ENV_FORCE_RERUN));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sweep.json");
    std::fs::write(&path, FULL).unwrap();
    let cfg = SchedulerConfig::load(&path).unwrap();
    assert_eq!(cfg.pools.len(), 3);

    std::fs::write(&path, "{ not json").unwrap();
    assert!(SchedulerConfig::load(&path).is_err());
}
