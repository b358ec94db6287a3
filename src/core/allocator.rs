//! Polling allocation protocol shared by every pool kind.
//!
//! An allocator turns a request into a target size, then polls its pool on a
//! fixed interval, greedily reserving elements in pool order until the
//! granted set covers the target. A post-allocation hook (the disk copy, for
//! instance) runs before the set is handed back.
//!
//! There is no fairness between competing requests: whichever request's tick
//! observes a free element first wins it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::element::{allocate, Element, ResourceSet};
use crate::core::pool::Pool;
use crate::core::SchedulerError;

/// Default delay between two scans of a pool.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bounds applied to a single acquisition.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Give up with [`SchedulerError::AcquireTimeout`] after this long.
    pub timeout: Option<Duration>,
    /// Give up with [`SchedulerError::Cancelled`] once this token fires.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    /// Set the acquisition deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Sized resource request protocol.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Element type granted by this allocator.
    type Element: Element;
    /// Arguments accepted by [`Allocator::acquire`].
    type Request: Send + Sync;

    /// Name used in logs.
    fn describe(&self) -> String;

    /// Delay between two pool scans.
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Capacity needed to satisfy `request`.
    async fn required_size(&self, request: &Self::Request) -> Result<u64, SchedulerError>;

    /// One scan of the pool, reserving up to `missing` more units.
    async fn allocate_once(&self, missing: u64) -> Result<Vec<Arc<Self::Element>>, SchedulerError>;

    /// Side effect run once the request is satisfied. It may attach extra
    /// zero-sized elements that need releasing with the rest of the set.
    async fn after_allocate(
        &self,
        _granted: &mut ResourceSet<Self::Element>,
        _request: &Self::Request,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    /// Block until `request` is satisfied, then run the post-allocation hook.
    ///
    /// On timeout, cancellation or hook failure every element reserved so far
    /// is released before the error is returned. Dropping the returned future
    /// before it completes releases the partial grant as well.
    async fn acquire(
        &self,
        request: &Self::Request,
        options: &AcquireOptions,
    ) -> Result<ResourceSet<Self::Element>, SchedulerError> {
        let size = self.required_size(request).await?;
        let mut pending = PendingGrant(ResourceSet::new());

        if let Err(err) = poll_until_satisfied(self, size, &mut pending.0, options).await {
            pending.0.cleanup().await;
            return Err(err);
        }

        if let Err(err) = self.after_allocate(&mut pending.0, request).await {
            tracing::warn!("post-allocation step of {} failed: {err}", self.describe());
            pending.0.cleanup().await;
            return Err(err);
        }
        Ok(pending.complete())
    }
}

/// Elements reserved by an acquisition that has not returned yet.
struct PendingGrant<E: Element + ?Sized>(ResourceSet<E>);

impl<E: Element + ?Sized> PendingGrant<E> {
    fn complete(mut self) -> ResourceSet<E> {
        std::mem::take(&mut self.0)
    }
}

impl<E: Element + ?Sized> Drop for PendingGrant<E> {
    fn drop(&mut self) {
        if !self.0.is_released() {
            tracing::debug!("acquisition abandoned, releasing {} element(s)", self.0.len());
        }
        self.0.release();
    }
}

async fn poll_until_satisfied<A: Allocator + ?Sized>(
    allocator: &A,
    size: u64,
    granted: &mut ResourceSet<A::Element>,
    options: &AcquireOptions,
) -> Result<(), SchedulerError> {
    let started = Instant::now();
    let deadline = options.timeout.map(|t| started + t);
    let mut first = true;

    while granted.size() < size {
        if first {
            tracing::info!("waiting for {size} units from {}", allocator.describe());
            first = false;
        }
        wait_tick(allocator.poll_interval(), deadline, options.cancel.as_ref())
            .await
            .map_err(|err| match err {
                Tick::Expired => SchedulerError::AcquireTimeout {
                    requested: size,
                    waited_ms: started.elapsed().as_millis(),
                },
                Tick::Cancelled => SchedulerError::Cancelled,
            })?;
        let missing = size.saturating_sub(granted.size());
        granted.extend(allocator.allocate_once(missing).await?);
    }
    Ok(())
}

enum Tick {
    Expired,
    Cancelled,
}

async fn wait_tick(
    interval: Duration,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
) -> Result<(), Tick> {
    let sleep_for = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(Tick::Expired);
            }
            interval.min(deadline - now)
        }
        None => interval,
    };

    match cancel {
        Some(token) => tokio::select! {
            () = token.cancelled() => Err(Tick::Cancelled),
            () = tokio::time::sleep(sleep_for) => Ok(()),
        },
        None => {
            tokio::time::sleep(sleep_for).await;
            Ok(())
        }
    }
}

/// First-fit allocator over a pool of materialized elements.
///
/// The request is the number of units wanted.
pub struct SlotAllocator<P> {
    pool: Arc<P>,
    poll_interval: Duration,
}

impl<P: Pool> SlotAllocator<P> {
    /// Create an allocator polling `pool` every second.
    pub const fn new(pool: Arc<P>) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Pool this allocator draws from.
    pub const fn pool(&self) -> &Arc<P> {
        &self.pool
    }
}

impl<P> Clone for SlotAllocator<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            poll_interval: self.poll_interval,
        }
    }
}

#[async_trait]
impl<P: Pool> Allocator for SlotAllocator<P> {
    type Element = P::Element;
    type Request = u64;

    fn describe(&self) -> String {
        self.pool.name().to_string()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn required_size(&self, request: &u64) -> Result<u64, SchedulerError> {
        let total = self.pool.total_size();
        if *request > total {
            tracing::warn!(
                "request for {request} units exceeds the {total} units of pool {}",
                self.pool.name()
            );
        }
        Ok(*request)
    }

    async fn allocate_once(&self, missing: u64) -> Result<Vec<Arc<P::Element>>, SchedulerError> {
        self.pool.refresh().await;
        let mut reserved = Vec::new();
        let mut acquired = 0;
        for element in self.pool.elements() {
            for granted in allocate(element) {
                acquired += granted.size();
                reserved.push(granted);
            }
            if acquired >= missing {
                break;
            }
        }
        Ok(reserved)
    }
}
