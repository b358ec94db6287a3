//! # ML Scheduler
//!
//! Schedules independent experiment runs against a small set of shared,
//! constrained resources (GPUs, disk capacity, generic counters) and records
//! their results in a persistent table, so that an interrupted run can be
//! resumed without repeating finished work.
//!
//! ## Core Problem Solved
//!
//! Hyper-parameter sweeps and evaluation grids launch many long external
//! programs that compete for a handful of devices and a scratch disk:
//!
//! - **Device contention**: a run must wait until enough GPUs are free, and
//!   GPUs busy with foreign processes must be skipped
//! - **Scratch space**: datasets are staged onto fast local disk only when
//!   there is room, and removed again afterwards
//! - **Restarts**: a crash or Ctrl-C must not lose or repeat finished rows
//! - **Concurrent reporting**: many rows write metrics into the same table
//!
//! ## Key Features
//!
//! - **Polling allocators**: first-fit allocation over pools of elements with
//!   idempotent reservation, optional deadline and cancellation
//! - **Disk staging**: capacity reservation with throttled incremental copies
//!   and one-shot target cleanup
//! - **Resumable runner**: rows are keyed by a persistent identifier and
//!   scheduled only while their continuation columns are empty
//! - **Safe write-back**: CSV files guarded by a lock file with backup and
//!   restore, or SQLite tables updated one statement at a time
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ml_scheduler::builders::{build_pools, build_store};
//! use ml_scheduler::config::SchedulerConfig;
//! use ml_scheduler::core::{experiment_fn, AppResult, ProcessOptions, Runner, RowArgs, TaskContext};
//!
//! let cfg = SchedulerConfig::load("sweep.json")?;
//! let pools = build_pools(&cfg)?;
//! let gpus = pools.gpu("gpu")?;
//!
//! let experiment = experiment_fn(move |ctx: TaskContext, args: RowArgs| {
//!     let gpus = gpus.clone();
//!     async move {
//!         let devices = ctx.acquire(gpus.as_ref(), 1).await?;
//!         let lr = args.get("lr").map(ToString::to_string).unwrap_or_default();
//!         let out = ctx
//!             .run_process(
//!                 &["python", "train.py", "--lr", lr.as_str()],
//!                 [("CUDA_VISIBLE_DEVICES", devices.cuda_visible_devices())],
//!                 &ProcessOptions::default().inherit_env(),
//!             )
//!             .await?;
//!         ctx.report([("done", true)]).await?;
//!         AppResult::Ok(out.into())
//!     }
//! });
//!
//! let runner = Runner::new(build_store(&cfg.store)?, experiment, cfg.runner.clone());
//! let summary = runner.run_blocking(&cfg.runtime)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: elements, pools, allocators, runner.
pub mod core;
/// Configuration models for pools, stores, the runner and the runtime.
pub mod config;
/// Builders to construct pools and stores from configuration.
pub mod builders;
/// Infrastructure adapters for task table storage.
pub mod infra;
/// Concrete resource pools.
pub mod pools;
/// Runtime construction.
pub mod runtime;
/// Shared utilities.
pub mod util;
