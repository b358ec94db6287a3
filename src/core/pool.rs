//! Pools of resource elements.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::element::Element;

/// Ordered collection of elements of one kind.
///
/// Membership is fixed at construction; only the elements' own state changes.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    /// Element type held by the pool.
    type Element: Element;

    /// Human-readable pool name used in logs.
    fn name(&self) -> &str;

    /// Elements in declaration order. Allocators scan them in this order.
    fn elements(&self) -> &[Arc<Self::Element>];

    /// Update external telemetry the elements read. Awaited before every
    /// scan; element checks themselves must not block.
    async fn refresh(&self) {}

    /// Total capacity of elements that cannot be handed out right now.
    fn unavailable_size(&self) -> u64 {
        self.elements()
            .iter()
            .filter(|e| e.is_unavailable())
            .map(|e| e.size())
            .sum()
    }

    /// Total capacity of the pool.
    fn total_size(&self) -> u64 {
        self.elements().iter().map(|e| e.size()).sum()
    }
}

/// Pool backed by materialized elements.
pub struct ElementPool<E> {
    name: String,
    elements: Vec<Arc<E>>,
}

impl<E: Element> ElementPool<E> {
    /// Create a pool owning `elements`.
    pub fn new(name: impl Into<String>, elements: impl IntoIterator<Item = E>) -> Self {
        Self {
            name: name.into(),
            elements: elements.into_iter().map(Arc::new).collect(),
        }
    }
}

#[async_trait]
impl<E: Element> Pool for ElementPool<E> {
    type Element = E;

    fn name(&self) -> &str {
        &self.name
    }

    fn elements(&self) -> &[Arc<E>] {
        &self.elements
    }
}

impl<E: Element> fmt::Debug for ElementPool<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(unavailable={}/{})",
            self.name,
            self.unavailable_size(),
            self.total_size()
        )
    }
}
