//! End-to-end runs of the scheduler over real task tables.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use ml_scheduler::config::{LockConfig, RunnerConfig, RuntimeConfig};
use ml_scheduler::core::{
    experiment_fn, AppResult, Experiment, ProcessOptions, RowArgs, Runner, SchedulerError,
    SlotAllocator, TaskContext,
};
use ml_scheduler::infra::{CsvStore, SqliteStore, TableStore};
use ml_scheduler::pools::CounterPool;

const ID: &str = ":uuid:";

fn csv_store(dir: &Path, content: &str) -> Arc<CsvStore> {
    let path = dir.join("tasks.csv");
    std::fs::write(&path, content).unwrap();
    Arc::new(CsvStore::new(path, b',', LockConfig::default()))
}

#[derive(Deserialize)]
struct Row {
    seed: u64,
}

/// Acquires one counter slot, counts the call per seed and marks the row done.
fn counting_experiment(
    slots: Arc<SlotAllocator<CounterPool>>,
    calls: Arc<Mutex<HashMap<u64, usize>>>,
) -> impl Experiment {
    experiment_fn(move |ctx: TaskContext, args: RowArgs| {
        let (slots, calls) = (slots.clone(), calls.clone());
        async move {
            let row: Row = args.parse()?;
            let _slot = ctx.acquire(slots.as_ref(), 1).await?;
            *calls.lock().entry(row.seed).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.report([("done", true)]).await?;
            AppResult::Ok(json!(row.seed * 10))
        }
    })
}

fn slots(size: usize) -> Arc<SlotAllocator<CounterPool>> {
    Arc::new(
        SlotAllocator::new(Arc::new(CounterPool::counter("slots", size, None)))
            .with_poll_interval(Duration::from_millis(5)),
    )
}

#[tokio::test]
async fn three_rows_run_once_across_two_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let store = csv_store(dir.path(), "seed,done\n1,\n2,\n3,\n");
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let config = RunnerConfig::new().with_continue_cols(["done"]);

    let runner = Runner::new(
        store.clone(),
        counting_experiment(slots(2), calls.clone()),
        config.clone(),
    );
    let first = runner.run().await.unwrap();
    assert_eq!(first.scheduled, 3);
    assert_eq!(first.completed, 3);

    let second = runner.run().await.unwrap();
    assert_eq!(second.scheduled, 0);
    assert_eq!(second.skipped, 3);

    let table = store.load().await.unwrap();
    for row in 0..3 {
        let id = table.row_id(ID, row).unwrap();
        assert_eq!(table.get(ID, &id, "done"), Some(&json!(true)));
    }
    assert!(calls.lock().values().all(|n| *n == 1));
    assert_eq!(calls.lock().len(), 3);
    let ids: Vec<_> = (0..3).map(|r| table.row_id(ID, r).unwrap()).collect();
    assert_eq!(
        table.get(ID, &ids[2], ":retval:"),
        Some(&json!(30)),
        "return value lands in the retval column"
    );
}

#[tokio::test]
async fn resume_schedules_only_unfinished_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = csv_store(dir.path(), "seed,acc\n1,0.9\n2,\n3,0.8\n4,\n5,\n");
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let runner = Runner::new(
        store.clone(),
        counting_experiment(slots(4), calls.clone()),
        RunnerConfig::new().with_continue_cols(["acc"]),
    );
    let summary = runner.run().await.unwrap();
    assert_eq!((summary.total, summary.scheduled, summary.skipped), (5, 3, 2));
    let mut seeds: Vec<_> = calls.lock().keys().copied().collect();
    seeds.sort_unstable();
    assert_eq!(seeds, vec![2, 4, 5]);

    let forced = Runner::new(
        store,
        counting_experiment(slots(4), calls.clone()),
        RunnerConfig::new()
            .with_continue_cols(["acc"])
            .with_force_rerun(true),
    );
    assert_eq!(forced.run().await.unwrap().scheduled, 5);
}

#[tokio::test]
async fn absent_continuation_column_schedules_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = csv_store(dir.path(), "seed\n1\n2\n");
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let runner = Runner::new(
        store.clone(),
        counting_experiment(slots(1), calls),
        RunnerConfig::new().with_continue_cols(["done"]),
    );
    assert_eq!(runner.run().await.unwrap().scheduled, 2);
    // the column now exists and is filled, so nothing is left
    assert_eq!(runner.run().await.unwrap().scheduled, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_do_not_overwrite_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let rows: String = (0..8).map(|i| format!("{i}\n")).collect();
    let store = csv_store(dir.path(), &format!("seed\n{rows}"));

    let experiment = experiment_fn(|ctx: TaskContext, args: RowArgs| async move {
        let row: Row = args.parse()?;
        ctx.report([(format!("metric_{}", row.seed), row.seed)]).await?;
        AppResult::Ok(Value::Null)
    });
    let runner = Runner::new(
        store.clone(),
        experiment,
        RunnerConfig::new().with_retval_column(None),
    );
    let summary = runner.run().await.unwrap();
    assert_eq!(summary.completed, 8);

    let table = store.load().await.unwrap();
    for row in 0..8u64 {
        let id = table.row_id(ID, usize::try_from(row).unwrap()).unwrap();
        for col in 0..8u64 {
            let cell = table.get(ID, &id, &format!("metric_{col}")).unwrap();
            if col == row {
                assert_eq!(cell, &json!(row));
            } else {
                assert_eq!(cell, &Value::Null);
            }
        }
    }
    assert!(!store.lock_path().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn process_failures_reach_the_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let store = csv_store(dir.path(), "code\n0\n4\n");

    let experiment = experiment_fn(|ctx: TaskContext, args: RowArgs| async move {
        let code = args.get("code").cloned().unwrap_or_default();
        let script = format!("echo running; exit {code}");
        let outcome = ctx
            .run_process(
                &["/bin/sh", "-c", script.as_str()],
                std::iter::empty::<(&str, &str)>(),
                &ProcessOptions::default(),
            )
            .await;
        let status = match outcome {
            Ok(stdout) => json!(stdout.trim()),
            Err(SchedulerError::ProcessFailed { code, .. }) => json!(code),
            Err(other) => return Err(other.into()),
        };
        ctx.report([("status", status)]).await?;
        AppResult::Ok(Value::Null)
    });
    let summary = Runner::new(store.clone(), experiment, RunnerConfig::new())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.completed, 2);

    let table = store.load().await.unwrap();
    let statuses: Vec<_> = (0..2)
        .map(|r| table.get(ID, &table.row_id(ID, r).unwrap(), "status").cloned())
        .collect();
    assert_eq!(statuses, vec![Some(json!("running")), Some(json!(4))]);
}

#[tokio::test]
async fn sqlite_tables_resume_too() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE runs (seed INTEGER, done INTEGER);
         INSERT INTO runs (seed) VALUES (1), (2), (3);",
    )
    .unwrap();
    drop(conn);

    let store = Arc::new(SqliteStore::new(&path, "runs"));
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let runner = Runner::new(
        store.clone(),
        counting_experiment(slots(2), calls.clone()),
        RunnerConfig::new().with_continue_cols(["done"]),
    );
    assert_eq!(runner.run().await.unwrap().completed, 3);
    assert_eq!(runner.run().await.unwrap().scheduled, 0);

    let table = store.load().await.unwrap();
    assert!(table.has_column(":retval:"));
    assert_eq!(calls.lock().len(), 3);
}

#[test]
fn run_blocking_drives_its_own_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let store = csv_store(dir.path(), "seed,done\n1,\n");
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let runner = Runner::new(
        store,
        counting_experiment(slots(1), calls.clone()),
        RunnerConfig::new().with_continue_cols(["done"]),
    );
    let summary = runner
        .run_blocking(&RuntimeConfig {
            worker_threads: 2,
            max_blocking_threads: 4,
        })
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(calls.lock().get(&1), Some(&1));
}
