//! Builders turning configuration into pools, allocators and stores.

pub mod pool_builder;
pub mod store_builder;

pub use pool_builder::{build_pools, build_pools_with_probe, PoolRegistry};
pub use store_builder::build_store;
