//! GPU pools backed by live memory telemetry.
//!
//! Each element is one device. A device is handed out only when it is not
//! reserved by another task and enough of its memory is free, so GPUs used by
//! foreign processes are skipped until they drain.

use std::fmt;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::element::{Element, ResourceSet, Slot};
use crate::core::pool::{ElementPool, Pool};
use crate::core::SchedulerError;

/// Source of per-device memory telemetry.
pub trait GpuProbe: Send + Sync + 'static {
    /// Indices of the devices present on this host. Called once at startup.
    fn device_indices(&self) -> Result<Vec<u32>, SchedulerError>;

    /// Percentage of memory free on `index` in the latest snapshot, if known.
    /// Must not block: it runs inside every pool scan.
    fn free_memory_percent(&self, index: u32) -> Option<f64>;

    /// Take a fresh snapshot. May block; pools run it on the blocking pool.
    fn refresh(&self) -> Result<(), SchedulerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DeviceMemory {
    index: u32,
    used_mib: f64,
    total_mib: f64,
}

impl DeviceMemory {
    fn free_percent(&self) -> Option<f64> {
        (self.total_mib > 0.0).then(|| 100.0 * (self.total_mib - self.used_mib) / self.total_mib)
    }
}

/// Probe that shells out to `nvidia-smi`, refreshing at most once per `ttl`.
pub struct NvidiaSmiProbe {
    ttl: Duration,
    snapshot: Mutex<Option<(Instant, Vec<DeviceMemory>)>>,
}

impl NvidiaSmiProbe {
    /// Create a probe refreshing at most once per `ttl`.
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            snapshot: Mutex::new(None),
        }
    }

    fn query() -> Result<Vec<DeviceMemory>, SchedulerError> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| SchedulerError::Config(format!("nvidia-smi unavailable: {e}")))?;
        if !output.status.success() {
            return Err(SchedulerError::Config(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }
        Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
    }

    fn is_fresh(&self) -> bool {
        self.snapshot
            .lock()
            .as_ref()
            .is_some_and(|(taken, _)| taken.elapsed() < self.ttl)
    }

    fn store(&self, devices: Vec<DeviceMemory>) {
        *self.snapshot.lock() = Some((Instant::now(), devices));
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn device_indices(&self) -> Result<Vec<u32>, SchedulerError> {
        let devices = Self::query()?;
        let indices = devices.iter().map(|d| d.index).collect();
        self.store(devices);
        Ok(indices)
    }

    fn free_memory_percent(&self, index: u32) -> Option<f64> {
        self.snapshot
            .lock()
            .as_ref()
            .and_then(|(_, devices)| devices.iter().find(|d| d.index == index))
            .and_then(DeviceMemory::free_percent)
    }

    fn refresh(&self) -> Result<(), SchedulerError> {
        if self.is_fresh() {
            return Ok(());
        }
        self.store(Self::query()?);
        Ok(())
    }
}

fn parse_nvidia_smi(output: &str) -> Vec<DeviceMemory> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse().ok()?;
            let used_mib = fields.next()?.parse().ok()?;
            let total_mib = fields.next()?.parse().ok()?;
            Some(DeviceMemory {
                index,
                used_mib,
                total_mib,
            })
        })
        .collect()
}

/// One GPU device.
pub struct GpuElement {
    index: u32,
    min_free_percent: f64,
    slot: Slot,
    probe: Arc<dyn GpuProbe>,
}

impl GpuElement {
    /// Create an element for device `index`.
    pub fn new(index: u32, min_free_percent: f64, probe: Arc<dyn GpuProbe>) -> Self {
        Self {
            index,
            min_free_percent,
            slot: Slot::new(1, false),
            probe,
        }
    }

    /// Device index as seen by CUDA.
    pub const fn index(&self) -> u32 {
        self.index
    }

    fn under_memory_pressure(&self) -> bool {
        self.probe
            .free_memory_percent(self.index)
            .is_some_and(|free| free < self.min_free_percent)
    }
}

impl fmt::Debug for GpuElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpu")
            .field("index", &self.index)
            .field("allocated", &self.slot.is_allocated())
            .field("free_percent", &self.probe.free_memory_percent(self.index))
            .finish()
    }
}

#[async_trait]
impl Element for GpuElement {
    fn size(&self) -> u64 {
        1
    }

    fn is_allocated(&self) -> bool {
        self.slot.is_allocated()
    }

    fn is_unavailable(&self) -> bool {
        self.is_allocated() || self.under_memory_pressure()
    }

    fn try_allocate(&self) -> bool {
        !self.under_memory_pressure() && self.slot.try_allocate()
    }

    fn release(&self) {
        self.slot.release();
    }
}

/// Pool of GPU devices sharing one telemetry probe.
pub struct GpuPool {
    devices: ElementPool<GpuElement>,
    probe: Arc<dyn GpuProbe>,
}

impl GpuPool {
    /// Build a pool over device `ids`, failing if the probe does not report one of them.
    pub fn gpus(
        name: impl Into<String>,
        ids: &[u32],
        min_free_percent: f64,
        probe: Arc<dyn GpuProbe>,
    ) -> Result<Self, SchedulerError> {
        let present = probe.device_indices()?;
        if let Some(missing) = ids.iter().find(|id| !present.contains(*id)) {
            return Err(SchedulerError::Config(format!(
                "GPU {missing} not found (present: {present:?})"
            )));
        }
        let devices = ElementPool::new(
            name,
            ids.iter()
                .map(|id| GpuElement::new(*id, min_free_percent, Arc::clone(&probe))),
        );
        Ok(Self { devices, probe })
    }
}

#[async_trait]
impl Pool for GpuPool {
    type Element = GpuElement;

    fn name(&self) -> &str {
        self.devices.name()
    }

    fn elements(&self) -> &[Arc<GpuElement>] {
        self.devices.elements()
    }

    async fn refresh(&self) {
        let probe = Arc::clone(&self.probe);
        match tokio::task::spawn_blocking(move || probe.refresh()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("GPU telemetry refresh for {} failed: {e}", self.name()),
            Err(e) => tracing::warn!("GPU telemetry task failed: {e}"),
        }
    }
}

impl fmt::Debug for GpuPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.devices, f)
    }
}

impl ResourceSet<GpuElement> {
    /// Device indices held by this set.
    pub fn device_indices(&self) -> Vec<u32> {
        self.iter().map(|gpu| gpu.index()).collect()
    }

    /// Value for `CUDA_VISIBLE_DEVICES`.
    pub fn cuda_visible_devices(&self) -> String {
        self.device_indices()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::allocator::{AcquireOptions, Allocator, SlotAllocator};
    use crate::core::pool::Pool;

    struct FakeProbe {
        free: Mutex<HashMap<u32, f64>>,
    }

    impl FakeProbe {
        fn new(free: &[(u32, f64)]) -> Arc<Self> {
            Arc::new(Self {
                free: Mutex::new(free.iter().copied().collect()),
            })
        }
    }

    impl GpuProbe for FakeProbe {
        fn device_indices(&self) -> Result<Vec<u32>, SchedulerError> {
            Ok(self.free.lock().keys().copied().collect())
        }

        fn free_memory_percent(&self, index: u32) -> Option<f64> {
            self.free.lock().get(&index).copied()
        }
    }

    /// Reports only what the last refresh captured from `live`.
    struct SnapshotProbe {
        live: Mutex<HashMap<u32, f64>>,
        snapshot: Mutex<HashMap<u32, f64>>,
        refreshed_on: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl GpuProbe for SnapshotProbe {
        fn device_indices(&self) -> Result<Vec<u32>, SchedulerError> {
            Ok(self.live.lock().keys().copied().collect())
        }

        fn free_memory_percent(&self, index: u32) -> Option<f64> {
            self.snapshot.lock().get(&index).copied()
        }

        fn refresh(&self) -> Result<(), SchedulerError> {
            self.refreshed_on.lock().push(std::thread::current().id());
            *self.snapshot.lock() = self.live.lock().clone();
            Ok(())
        }
    }

    #[test]
    fn nvidia_smi_reads_come_from_the_cache() {
        let probe = NvidiaSmiProbe::new(Duration::from_secs(60));
        assert_eq!(probe.free_memory_percent(0), None);
        probe.store(parse_nvidia_smi("0, 4096, 16384\n"));
        assert_eq!(probe.free_memory_percent(0), Some(75.0));
        assert!(probe.refresh().is_ok(), "a fresh snapshot is reused");
    }

    #[tokio::test]
    async fn telemetry_refresh_runs_off_the_scheduler_thread() {
        let probe = Arc::new(SnapshotProbe {
            live: Mutex::new(HashMap::from([(0, 5.0), (1, 90.0)])),
            snapshot: Mutex::new(HashMap::new()),
            refreshed_on: Mutex::new(Vec::new()),
        });
        let pool = Arc::new(GpuPool::gpus("gpu", &[0, 1], 20.0, probe.clone()).unwrap());
        assert_eq!(pool.unavailable_size(), 0, "no snapshot yet");

        let alloc = SlotAllocator::new(Arc::clone(&pool))
            .with_poll_interval(Duration::from_millis(5));
        let set = alloc.acquire(&1, &AcquireOptions::default()).await.unwrap();
        assert_eq!(set.device_indices(), vec![1]);
        assert_eq!(pool.unavailable_size(), 2);

        let scheduler = std::thread::current().id();
        let threads = probe.refreshed_on.lock().clone();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|t| *t != scheduler));
    }

    #[test]
    fn parses_query_output() {
        let parsed = parse_nvidia_smi("0, 1024, 16384\n1, 16000, 16384\ngarbage\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].index, 1);
        assert!(parsed[0].free_percent().unwrap() > 90.0);
    }

    #[test]
    fn unknown_device_is_a_config_error() {
        let probe = FakeProbe::new(&[(0, 100.0)]);
        let err = GpuPool::gpus("gpu", &[0, 3], 20.0, probe).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[tokio::test]
    async fn busy_devices_are_skipped() {
        let probe = FakeProbe::new(&[(0, 5.0), (1, 80.0)]);
        let pool = Arc::new(GpuPool::gpus("gpu", &[0, 1], 20.0, probe.clone()).unwrap());
        assert_eq!(pool.unavailable_size(), 1);

        let alloc = SlotAllocator::new(Arc::clone(&pool))
            .with_poll_interval(Duration::from_millis(5));
        let set = alloc.acquire(&1, &AcquireOptions::default()).await.unwrap();
        assert_eq!(set.cuda_visible_devices(), "1");

        probe.free.lock().insert(0, 90.0);
        let second = alloc.acquire(&1, &AcquireOptions::default()).await.unwrap();
        assert_eq!(second.device_indices(), vec![0]);

        set.cleanup().await;
        second.cleanup().await;
        assert_eq!(pool.unavailable_size(), 0);
    }
}
