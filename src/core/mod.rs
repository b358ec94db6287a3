//! Core scheduling abstractions: elements, pools, allocators, the per-row
//! task context and the runner.

pub mod allocator;
pub mod audit;
pub mod context;
pub mod element;
pub mod error;
pub mod executor;
pub mod pool;
pub mod runner;
pub mod table;

pub use allocator::{AcquireOptions, Allocator, SlotAllocator, DEFAULT_POLL_INTERVAL};
pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, JsonlAuditSink,
};
pub use context::{MemoryReporter, ProcessOptions, Reporter, TaskContext};
pub use element::{allocate, Element, ResourceSet, Slot};
pub use error::{AppResult, SchedulerError};
pub use executor::{experiment_fn, Experiment, FnExperiment, RowArgs};
pub use pool::{ElementPool, Pool};
pub use runner::{RunSummary, Runner};
pub use table::{is_null, new_row_id, Table};
