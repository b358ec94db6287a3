//! Resource elements and the sets of elements granted to a single request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// Smallest unit of a resource: one GPU, one counter slot, one disk reservation.
///
/// Elements are shared between every allocator polling their pool, so
/// [`Element::try_allocate`] must be a single atomic check-and-set.
#[async_trait]
pub trait Element: Send + Sync + fmt::Debug + 'static {
    /// Capacity carried by this element.
    fn size(&self) -> u64;

    /// Whether the element is currently reserved by a task.
    fn is_allocated(&self) -> bool;

    /// Whether the element cannot be handed out right now.
    ///
    /// Defaults to [`Element::is_allocated`]; elements backed by live
    /// telemetry add their own checks.
    fn is_unavailable(&self) -> bool {
        self.is_allocated()
    }

    /// Reserve the element. Returns `true` only for the call that flipped it.
    fn try_allocate(&self) -> bool;

    /// Drop the reservation without awaiting. Used where cleanup cannot be
    /// awaited, such as an acquisition abandoned mid-poll.
    fn release(&self);

    /// Release the element. Safe to call on an element that was never allocated.
    async fn cleanup(&self) {
        self.release();
    }
}

/// Reserve `element`, returning it wrapped in a one-item vector, or an empty
/// vector when it is already held.
///
/// Repeating the call without an intervening cleanup never yields the
/// element twice, which lets allocators rescan a whole pool on every tick.
pub fn allocate<E: Element + ?Sized>(element: &Arc<E>) -> Vec<Arc<E>> {
    if element.try_allocate() {
        vec![Arc::clone(element)]
    } else {
        Vec::new()
    }
}

/// Plain capacity-bearing element with an allocation flag.
#[derive(Debug)]
pub struct Slot {
    size: u64,
    allocated: AtomicBool,
}

impl Slot {
    /// Create a slot, optionally already allocated.
    pub const fn new(size: u64, allocated: bool) -> Self {
        Self {
            size,
            allocated: AtomicBool::new(allocated),
        }
    }
}

#[async_trait]
impl Element for Slot {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Acquire)
    }

    fn try_allocate(&self) -> bool {
        self.allocated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.allocated.store(false, Ordering::Release);
    }
}

/// Ordered elements granted to one request and released together.
///
/// Clones share one release guard: the first cleanup of any clone releases
/// the members, later ones do nothing. A member handed to another request
/// after that is never touched by a stale clone.
pub struct ResourceSet<E: ?Sized = dyn Element> {
    elements: Vec<Arc<E>>,
    released: Arc<AtomicBool>,
}

impl<E: Element + ?Sized> ResourceSet<E> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append newly reserved elements.
    pub fn extend(&mut self, elements: impl IntoIterator<Item = Arc<E>>) {
        self.elements.extend(elements);
    }

    /// Sum of sizes of the members that are still allocated.
    pub fn size(&self) -> u64 {
        if self.released.load(Ordering::Acquire) {
            return 0;
        }
        self.elements
            .iter()
            .filter(|e| e.is_allocated())
            .map(|e| e.size())
            .sum()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the set holds no members.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over the members in grant order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<E>> {
        self.elements.iter()
    }

    /// Whether the set was cleaned up or every member has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.elements.iter().all(|e| !e.is_allocated())
    }

    fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Release every member. Only the first call across all clones acts.
    pub async fn cleanup(&self) {
        if !self.claim_release() {
            return;
        }
        for element in &self.elements {
            tracing::debug!("releasing {:?}", element);
            element.cleanup().await;
        }
    }

    /// Synchronous [`ResourceSet::cleanup`] for contexts that cannot await.
    pub fn release(&self) {
        if !self.claim_release() {
            return;
        }
        for element in &self.elements {
            element.release();
        }
    }
}

impl<E: Element> ResourceSet<E> {
    /// Type-erased view sharing the same elements.
    pub fn to_dyn(&self) -> ResourceSet {
        ResourceSet {
            elements: self
                .elements
                .iter()
                .map(|e| Arc::clone(e) as Arc<dyn Element>)
                .collect(),
            released: Arc::clone(&self.released),
        }
    }
}

impl<E: ?Sized> Clone for ResourceSet<E> {
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
            released: Arc::clone(&self.released),
        }
    }
}

impl<E: Element + ?Sized> Default for ResourceSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: fmt::Debug + ?Sized> fmt::Debug for ResourceSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.elements.iter()).finish()
    }
}
