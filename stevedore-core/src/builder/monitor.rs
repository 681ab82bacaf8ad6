//! Host resource monitoring for admission control.
//!
//! A background task samples CPU, memory and disk utilization on a fixed
//! interval and stores the latest [`ResourceSample`]. Admission checks read
//! that snapshot and never wait. Any failed measurement counts as zero load
//! so a broken sampler cannot stall the build queue.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default sampling interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Admission predicate consulted before a build starts.
pub trait AdmissionGate: Send + Sync {
    /// Snapshot check; must not block.
    fn can_schedule(&self) -> bool;
}

/// Utilization limits, in percent. A resource must be strictly below its
/// limit for work to be admitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self { cpu_percent: 80.0, memory_percent: 85.0, disk_percent: 90.0 }
    }
}

/// One utilization measurement, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Latest usage together with the limits it is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub usage: ResourceUsage,
    pub thresholds: ResourceThresholds,
}

impl ResourceSample {
    pub fn within_thresholds(&self) -> bool {
        self.usage.cpu_percent < self.thresholds.cpu_percent
            && self.usage.memory_percent < self.thresholds.memory_percent
            && self.usage.disk_percent < self.thresholds.disk_percent
    }
}

/// Platform source of utilization figures.
pub trait ResourceSampler: Send + 'static {
    fn cpu_percent(&mut self) -> io::Result<f64>;
    fn memory_percent(&mut self) -> io::Result<f64>;
    fn disk_percent(&mut self) -> io::Result<f64>;
}

/// Samples CPU and memory through `sysinfo` and disk usage through `statvfs`
/// for one mount point.
pub struct HostSampler {
    system: System,
    disk_path: PathBuf,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu();
        Self { system, disk_path: disk_path.into() }
    }
}

impl ResourceSampler for HostSampler {
    fn cpu_percent(&mut self) -> io::Result<f64> {
        ensure_supported()?;
        self.system.refresh_cpu();
        let usage = f64::from(self.system.global_cpu_info().cpu_usage());
        Ok(if usage.is_finite() { usage } else { 0.0 })
    }

    fn memory_percent(&mut self) -> io::Result<f64> {
        ensure_supported()?;
        self.system.refresh_memory();
        Ok(percent(self.system.used_memory(), self.system.total_memory()))
    }

    fn disk_percent(&mut self) -> io::Result<f64> {
        let (used, total) = disk_usage(&self.disk_path)?;
        Ok(percent(used, total))
    }
}

fn ensure_supported() -> io::Result<()> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no CPU or memory statistics on this platform",
        ))
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// `(used, total)` bytes of the filesystem holding `path`, as `df` reports.
#[cfg(unix)]
fn disk_usage(path: &Path) -> io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };

    let block = stat.f_frsize as u64;
    let used = (stat.f_blocks as u64).saturating_sub(stat.f_bfree as u64) * block;
    let available = stat.f_bavail as u64 * block;
    Ok((used, used + available))
}

#[cfg(not(unix))]
fn disk_usage(_path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "disk usage requires statvfs"))
}

/// One-line description of the host, logged at startup.
pub fn system_info() -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let mut system = System::new();
    system.refresh_memory();
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let (mem_used, mem_total) = (system.used_memory(), system.total_memory());
    let (disk_used, disk_total) = disk_usage(Path::new("/")).unwrap_or((0, 0));

    format!(
        "System: {} CPUs, Memory={:.1}GB/{:.1}GB ({:.1}% used), Disk={:.1}GB/{:.1}GB ({:.1}% used)",
        cpus,
        mem_used as f64 / GIB,
        mem_total as f64 / GIB,
        percent(mem_used, mem_total),
        disk_used as f64 / GIB,
        disk_total as f64 / GIB,
        percent(disk_used, disk_total),
    )
}

/// Take one measurement, replacing failed readings with zero.
fn measure(sampler: &mut dyn ResourceSampler) -> ResourceUsage {
    let read = |name: &str, result: io::Result<f64>| {
        result.unwrap_or_else(|e| {
            warn!(resource = name, error = %e, "Failed to sample resource usage, assuming idle");
            0.0
        })
    };

    ResourceUsage {
        cpu_percent: read("cpu", sampler.cpu_percent()),
        memory_percent: read("memory", sampler.memory_percent()),
        disk_percent: read("disk", sampler.disk_percent()),
    }
}

/// Periodic sampler with a non-blocking admission check.
pub struct ResourceMonitor {
    interval: Duration,
    sample: Arc<Mutex<ResourceSample>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(thresholds: ResourceThresholds, interval: Duration) -> Self {
        let sample = ResourceSample { usage: ResourceUsage::default(), thresholds };
        Self {
            interval,
            sample: Arc::new(Mutex::new(sample)),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start sampling the local host.
    pub fn start(&self) {
        self.start_with(HostSampler::default());
    }

    /// Start sampling with a custom sampler. Does nothing if already running.
    pub fn start_with<S: ResourceSampler>(&self, mut sampler: S) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let sample = Arc::clone(&self.sample);
        let interval = self.interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let usage = measure(&mut sampler);
                        debug!(
                            cpu = usage.cpu_percent,
                            memory = usage.memory_percent,
                            disk = usage.disk_percent,
                            "Resource sample"
                        );
                        sample.lock().unwrap_or_else(PoisonError::into_inner).usage = usage;
                    }
                    _ = &mut stop_rx => break,
                }
            }
        }));
        *self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        info!(interval_ms = interval.as_millis() as u64, "Resource monitor started");
    }

    /// Stop sampling and wait for the sampler task to exit.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Resource monitor task ended abnormally");
            }
            info!("Resource monitor stopped");
        }
    }

    /// Overwrite the current usage figures.
    pub fn record(&self, usage: ResourceUsage) {
        self.sample.lock().unwrap_or_else(PoisonError::into_inner).usage = usage;
    }

    pub fn current(&self) -> ResourceSample {
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AdmissionGate for ResourceMonitor {
    fn can_schedule(&self) -> bool {
        self.current().within_thresholds()
    }
}
