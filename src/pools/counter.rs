//! Counter pools: a fixed number of unit-sized slots.

use crate::core::element::Slot;
use crate::core::pool::ElementPool;

/// Pool of unit-sized slots.
pub type CounterPool = ElementPool<Slot>;

impl ElementPool<Slot> {
    /// Create `size` unit slots of which only the first `available` can be
    /// handed out. `None` makes every slot available.
    pub fn counter(name: impl Into<String>, size: usize, available: Option<usize>) -> Self {
        let available = available.unwrap_or(size);
        Self::new(name, (0..size).map(|i| Slot::new(1, i >= available)))
    }
}
