//! Tests for runtime construction

use ml_scheduler::config::RuntimeConfig;
use ml_scheduler::core::SchedulerError;
use ml_scheduler::runtime::build_runtime;

#[test]
fn test_build_runtime_runs_blocking_work() {
    let runtime = build_runtime(&RuntimeConfig {
        worker_threads: 2,
        max_blocking_threads: 2,
    })
    .unwrap();

    let result = runtime.block_on(async {
        tokio::task::spawn_blocking(|| 40 + 2).await.unwrap()
    });
    assert_eq!(result, 42);
}

#[test]
fn test_build_runtime_rejects_zero_workers() {
    let err = build_runtime(&RuntimeConfig {
        worker_threads: 0,
        max_blocking_threads: 2,
    })
    .unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
}

#[test]
fn test_default_runtime_config_uses_cpu_count() {
    let cfg = RuntimeConfig::default();
    assert_eq!(cfg.worker_threads, num_cpus::get());
    assert!(cfg.max_blocking_threads >= cfg.worker_threads);
}
