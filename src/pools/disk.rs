//! Disk capacity pools.
//!
//! Disk space is fungible, so the pool holds no elements. It tracks a running
//! total of reservations (`pre_allocated`) and compares it against live free
//! space on every check. Each reservation is a synthetic [`DiskElement`].
//!
//! [`CopyAllocator`] sizes its request from the files it has to move, then
//! copies them in the background once the space is reserved. Files already
//! present in the target with the same name and byte size are skipped; this is
//! a size comparison, not a checksum.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::core::allocator::{Allocator, DEFAULT_POLL_INTERVAL};
use crate::core::element::{Element, ResourceSet};
use crate::core::SchedulerError;

/// Default number of concurrent copies per copy allocator.
pub const DEFAULT_MAX_COPIES: usize = 2;

/// Byte scale used for disk accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskUnit {
    /// Single bytes.
    #[serde(rename = "B")]
    Bytes,
    /// 10^3 bytes.
    #[serde(rename = "KB")]
    Kb,
    /// 10^6 bytes.
    #[serde(rename = "MB")]
    Mb,
    /// 10^9 bytes.
    #[default]
    #[serde(rename = "GB")]
    Gb,
}

impl DiskUnit {
    /// Number of bytes in one unit.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kb => 1_000,
            Self::Mb => 1_000_000,
            Self::Gb => 1_000_000_000,
        }
    }
}

/// Source of free-space telemetry.
pub trait FreeSpace: Send + Sync + 'static {
    /// Bytes free on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by `psutil`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsutilFreeSpace;

impl FreeSpace for PsutilFreeSpace {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        psutil::disk::disk_usage(path)
            .map(|usage| usage.free())
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Capacity pool for one filesystem.
pub struct DiskPool {
    name: String,
    path: PathBuf,
    unit: DiskUnit,
    pre_allocated: Mutex<u64>,
    free_space: Arc<dyn FreeSpace>,
}

impl DiskPool {
    /// Create a pool measuring the filesystem that holds `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, unit: DiskUnit) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            unit,
            pre_allocated: Mutex::new(0),
            free_space: Arc::new(PsutilFreeSpace),
        }
    }

    /// Replace the free-space source.
    #[must_use]
    pub fn with_free_space(mut self, free_space: Arc<dyn FreeSpace>) -> Self {
        self.free_space = free_space;
        self
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accounting unit.
    pub const fn unit(&self) -> DiskUnit {
        self.unit
    }

    /// Units reserved but not yet released.
    pub fn pre_allocated(&self) -> u64 {
        *self.pre_allocated.lock()
    }

    async fn free_units(&self) -> Result<u64, SchedulerError> {
        let free_space = Arc::clone(&self.free_space);
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || free_space.free_bytes(&path)).await??;
        Ok(bytes / self.unit.bytes())
    }

    /// Live free space minus outstanding reservations, in units.
    pub async fn available_size(&self) -> Result<u64, SchedulerError> {
        let free = self.free_units().await?;
        Ok(free.saturating_sub(self.pre_allocated()))
    }

    /// Reserve `size` units if they fit. The check and the increment happen
    /// under one lock.
    async fn reserve(&self, size: u64) -> Result<bool, SchedulerError> {
        let free = self.free_units().await?;
        let mut pre_allocated = self.pre_allocated.lock();
        if size > free.saturating_sub(*pre_allocated) {
            return Ok(false);
        }
        *pre_allocated += size;
        Ok(true)
    }

    fn release(&self, size: u64) {
        let mut pre_allocated = self.pre_allocated.lock();
        if size > *pre_allocated {
            tracing::error!(
                "releasing {size} units from pool {} with only {} reserved",
                self.name,
                *pre_allocated
            );
        }
        *pre_allocated = pre_allocated.saturating_sub(size);
    }
}

impl fmt::Debug for DiskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskPool")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("pre_allocated", &self.pre_allocated())
            .finish()
    }
}

/// One disk reservation.
pub struct DiskElement {
    size: u64,
    pool: Arc<DiskPool>,
    allocated: AtomicBool,
    reserved: AtomicBool,
    target: Mutex<Option<PathBuf>>,
}

impl DiskElement {
    fn reservation(pool: Arc<DiskPool>, size: u64) -> Self {
        Self {
            size,
            pool,
            allocated: AtomicBool::new(true),
            reserved: AtomicBool::new(size > 0),
            target: Mutex::new(None),
        }
    }

    /// Return the reserved units to the pool. Only the first call has an effect.
    fn settle(&self) {
        if self.reserved.swap(false, Ordering::AcqRel) {
            self.pool.release(self.size);
        }
    }

    fn remove_target_on_cleanup(&self, target: PathBuf) {
        *self.target.lock() = Some(target);
    }
}

impl fmt::Debug for DiskElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("size", &self.size)
            .field("pool", &self.pool.name)
            .field("allocated", &self.is_allocated())
            .field("target", &*self.target.lock())
            .finish()
    }
}

#[async_trait]
impl Element for DiskElement {
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
        self.settle();

        let Some(target) = self.target.lock().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!("cleaning up {} in the background", target.display());
                handle.spawn_blocking(move || remove_target(&target));
            }
            Err(_) => tracing::warn!("no runtime to remove {}", target.display()),
        }
    }

    async fn cleanup(&self) {
        self.allocated.store(false, Ordering::Release);
        self.settle();

        let Some(target) = self.target.lock().take() else {
            return;
        };
        tracing::info!("cleaning up {}", target.display());
        if let Err(e) = tokio::task::spawn_blocking(move || remove_target(&target)).await {
            tracing::warn!("target removal task failed: {e}");
        }
    }
}

fn remove_target(target: &Path) {
    match fs::remove_dir_all(target) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            tracing::warn!("failed to remove {}: {e}", target.display());
        }
        _ => {}
    }
}

/// Reserves raw disk capacity. The request is the number of units wanted and
/// the reservation is returned to the pool on cleanup.
pub struct DiskAllocator {
    pool: Arc<DiskPool>,
    poll_interval: Duration,
}

impl DiskAllocator {
    /// Create an allocator over `pool`.
    pub const fn new(pool: Arc<DiskPool>) -> Self {
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
}

async fn reserve_element(
    pool: &Arc<DiskPool>,
    missing: u64,
) -> Result<Vec<Arc<DiskElement>>, SchedulerError> {
    if !pool.reserve(missing).await? {
        return Ok(Vec::new());
    }
    Ok(vec![Arc::new(DiskElement::reservation(
        Arc::clone(pool),
        missing,
    ))])
}

#[async_trait]
impl Allocator for DiskAllocator {
    type Element = DiskElement;
    type Request = u64;

    fn describe(&self) -> String {
        self.pool.name.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn required_size(&self, request: &u64) -> Result<u64, SchedulerError> {
        Ok(*request)
    }

    async fn allocate_once(&self, missing: u64) -> Result<Vec<Arc<DiskElement>>, SchedulerError> {
        reserve_element(&self.pool, missing).await
    }
}

/// Files to stage from `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    /// Directory files are read from.
    pub source: PathBuf,
    /// Directory files are written to. Created if missing.
    pub target: PathBuf,
    /// File names relative to `source`; every regular file directly under
    /// `source` when `None`.
    pub files: Option<Vec<String>>,
    /// Remove `target` recursively when the resource set is cleaned up.
    pub cleanup_target: bool,
}

impl CopyRequest {
    /// Copy every file of `source` into `target`, removing `target` on cleanup.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            files: None,
            cleanup_target: true,
        }
    }

    /// Restrict the copy to `files`.
    #[must_use]
    pub fn with_files<S: Into<String>>(mut self, files: impl IntoIterator<Item = S>) -> Self {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    /// Leave `target` in place on cleanup.
    #[must_use]
    pub const fn keep_target(mut self) -> Self {
        self.cleanup_target = false;
        self
    }
}

/// Outcome of one staging run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Files written.
    pub copied: usize,
    /// Files left untouched because the target already matched in size.
    pub skipped: usize,
}

/// Reserves room for a set of files and copies them once the space is granted.
///
/// At most `max_copies` copies run at once per allocator.
pub struct CopyAllocator {
    pool: Arc<DiskPool>,
    max_copies: usize,
    copies: Semaphore,
    poll_interval: Duration,
}

impl CopyAllocator {
    /// Create a copy allocator over `pool`.
    pub fn new(pool: Arc<DiskPool>, max_copies: usize) -> Self {
        let max_copies = max_copies.max(1);
        Self {
            pool,
            max_copies,
            copies: Semaphore::new(max_copies),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Copies currently running.
    pub fn copies_in_flight(&self) -> usize {
        self.max_copies - self.copies.available_permits()
    }
}

#[async_trait]
impl Allocator for CopyAllocator {
    type Element = DiskElement;
    type Request = CopyRequest;

    fn describe(&self) -> String {
        format!("{} (copy)", self.pool.name)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn required_size(&self, request: &CopyRequest) -> Result<u64, SchedulerError> {
        let request = request.clone();
        let unit = self.pool.unit.bytes();
        let size = tokio::task::spawn_blocking(move || copy_size(&request, unit)).await??;
        Ok(size)
    }

    async fn allocate_once(&self, missing: u64) -> Result<Vec<Arc<DiskElement>>, SchedulerError> {
        reserve_element(&self.pool, missing).await
    }

    async fn after_allocate(
        &self,
        granted: &mut ResourceSet<DiskElement>,
        request: &CopyRequest,
    ) -> Result<(), SchedulerError> {
        if request.cleanup_target {
            if granted.is_empty() {
                granted.extend([Arc::new(DiskElement::reservation(Arc::clone(&self.pool), 0))]);
            }
            if let Some(first) = granted.iter().next() {
                first.remove_target_on_cleanup(request.target.clone());
            }
        }

        let permit = self
            .copies
            .acquire()
            .await
            .map_err(|_| SchedulerError::Cancelled)?;
        let job = request.clone();
        let copied = tokio::task::spawn_blocking(move || copy_files(&job)).await;
        drop(permit);

        for element in granted.iter() {
            element.settle();
        }

        let stats = copied??;
        tracing::info!(
            "staged {} into {}: {} copied, {} skipped",
            request.source.display(),
            request.target.display(),
            stats.copied,
            stats.skipped
        );
        Ok(())
    }
}

fn resolve_files(request: &CopyRequest) -> io::Result<Vec<String>> {
    if let Some(files) = &request.files {
        return Ok(files.clone());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&request.source)? {
        let entry = entry?;
        if entry.path().is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// Units still missing from the target, creating it when absent.
fn copy_size(request: &CopyRequest, unit: u64) -> io::Result<u64> {
    let files = resolve_files(request)?;
    let mut source_bytes = 0;
    for file in &files {
        source_bytes += fs::metadata(request.source.join(file))?.len();
    }

    if !request.target.exists() {
        fs::create_dir_all(&request.target)?;
        return Ok(source_bytes / unit);
    }
    let present_bytes: u64 = files
        .iter()
        .filter_map(|file| fs::metadata(request.target.join(file)).ok())
        .map(|meta| meta.len())
        .sum();
    Ok((source_bytes / unit).saturating_sub(present_bytes / unit))
}

fn copy_files(request: &CopyRequest) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    for file in resolve_files(request)? {
        let source = request.source.join(&file);
        let target = request.target.join(&file);
        let source_len = fs::metadata(&source)?.len();
        let up_to_date = fs::metadata(&target).is_ok_and(|meta| meta.len() == source_len);
        if up_to_date {
            stats.skipped += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &target)?;
        stats.copied += 1;
    }
    Ok(stats)
}
