//! Concrete resource pools: counters, GPUs and disk capacity.

pub mod counter;
pub mod disk;
pub mod gpu;

pub use counter::CounterPool;
pub use disk::{
    CopyAllocator, CopyRequest, CopyStats, DiskAllocator, DiskElement, DiskPool, DiskUnit,
    FreeSpace, PsutilFreeSpace, DEFAULT_MAX_COPIES,
};
pub use gpu::{GpuElement, GpuPool, GpuProbe, NvidiaSmiProbe};
