//! Host resource sampling.
//!
//! CPU utilization comes from `sysinfo`; accelerator utilization and memory come
//! from NVML when built with `gpu-nvidia`. Every reading is best-effort: a probe
//! that fails yields `None` for its metric and is reported once as
//! `SENSOR_UNAVAILABLE`. Nothing here ever fails the run.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::FaultKind;

/// Utilization above this percentage is flagged as saturated.
pub const GPU_SATURATION_PERCENT: f32 = 80.0;

/// Minimum time between two real probe reads.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GpuReading {
    pub utilization_percent: f32,
    pub mem_used_mb: Option<u64>,
}

impl GpuReading {
    pub fn is_saturated(&self) -> bool {
        self.utilization_percent > GPU_SATURATION_PERCENT
    }
}

/// One sample of host sensors. `None` means the metric is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ResourceReading {
    pub cpu_percent: Option<f32>,
    pub gpu: Option<GpuReading>,
}

impl ResourceReading {
    pub fn gpu_saturated(&self) -> bool {
        self.gpu.map(|g| g.is_saturated()).unwrap_or(false)
    }
}

// -------------------- Probes --------------------

pub trait CpuProbe: Send {
    /// Global CPU utilization in percent.
    fn cpu_percent(&mut self) -> Result<f32>;
}

pub trait GpuProbe: Send {
    fn gpu(&mut self) -> Result<GpuReading>;
}

/// CPU probe backed by `sysinfo`.
pub struct SysinfoCpuProbe {
    sys: System,
}

impl SysinfoCpuProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // First refresh only establishes the baseline for the next delta.
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for SysinfoCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoCpuProbe {
    fn cpu_percent(&mut self) -> Result<f32> {
        self.sys.refresh_cpu_usage();
        if self.sys.cpus().is_empty() {
            return Err(anyhow!("no CPUs reported by the host"));
        }
        let usage = self.sys.global_cpu_usage();
        if !usage.is_finite() {
            return Err(anyhow!("CPU usage is not a finite number"));
        }
        Ok(usage)
    }
}

#[cfg(feature = "gpu-nvidia")]
pub struct NvmlGpuProbe {
    nvml: nvml_wrapper::Nvml,
    device_index: u32,
}

#[cfg(feature = "gpu-nvidia")]
impl NvmlGpuProbe {
    pub fn new(device_index: u32) -> Result<Self> {
        let nvml = nvml_wrapper::Nvml::init().map_err(|e| anyhow!("NVML init failed: {}", e))?;
        Ok(Self { nvml, device_index })
    }
}

#[cfg(feature = "gpu-nvidia")]
impl GpuProbe for NvmlGpuProbe {
    fn gpu(&mut self) -> Result<GpuReading> {
        let device = self
            .nvml
            .device_by_index(self.device_index)
            .map_err(|e| anyhow!("NVML device {}: {}", self.device_index, e))?;
        let rates = device
            .utilization_rates()
            .map_err(|e| anyhow!("NVML utilization: {}", e))?;
        let mem_used_mb = device.memory_info().ok().map(|mem| mem.used / (1024 * 1024));
        Ok(GpuReading {
            utilization_percent: rates.gpu as f32,
            mem_used_mb,
        })
    }
}

// -------------------- Monitor --------------------

struct Sensor<P: ?Sized> {
    name: &'static str,
    probe: Box<P>,
    reported: bool,
}

impl<P: ?Sized> Sensor<P> {
    fn new(name: &'static str, probe: Box<P>) -> Self {
        Self {
            name,
            probe,
            reported: false,
        }
    }

    fn degrade<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                if !self.reported {
                    self.reported = true;
                    log::warn!(
                        "{}: {} sensor unavailable, reporting no value: {:#}",
                        FaultKind::SensorUnavailable.code(),
                        self.name,
                        err
                    );
                }
                None
            }
        }
    }
}

/// Throttled, best-effort sampler over a CPU probe and an optional GPU probe.
pub struct ResourceMonitor {
    cpu: Option<Sensor<dyn CpuProbe>>,
    gpu: Option<Sensor<dyn GpuProbe>>,
    refresh_interval: Duration,
    last: Option<(Instant, ResourceReading)>,
}

impl ResourceMonitor {
    /// Probes for the current host: `sysinfo` CPU, plus NVML when compiled in.
    pub fn system() -> Self {
        let cpu: Box<dyn CpuProbe> = Box::new(SysinfoCpuProbe::new());
        Self::with_probes(Some(cpu), platform_gpu_probe())
    }

    pub fn with_probes(cpu: Option<Box<dyn CpuProbe>>, gpu: Option<Box<dyn GpuProbe>>) -> Self {
        Self {
            cpu: cpu.map(|p| Sensor::new("cpu", p)),
            gpu: gpu.map(|p| Sensor::new("gpu", p)),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            last: None,
        }
    }

    /// Monitor with no sensors. Every reading is empty.
    pub fn disabled() -> Self {
        Self::with_probes(None, None)
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Current reading. Probes are only hit once per refresh interval; in
    /// between, the previous reading is returned.
    pub fn sample(&mut self, now: Instant) -> ResourceReading {
        if let Some((at, reading)) = self.last {
            let fresh = now
                .checked_duration_since(at)
                .map(|age| age < self.refresh_interval)
                .unwrap_or(true);
            if fresh {
                return reading;
            }
        }
        let cpu_percent = self.cpu.as_mut().and_then(|s| {
            let result = s.probe.cpu_percent();
            s.degrade(result)
        });
        let gpu = self.gpu.as_mut().and_then(|s| {
            let result = s.probe.gpu();
            s.degrade(result)
        });
        let reading = ResourceReading { cpu_percent, gpu };
        self.last = Some((now, reading));
        reading
    }

    /// Names of sensors that have failed at least once.
    pub fn unavailable_sensors(&self) -> Vec<&'static str> {
        let cpu = self.cpu.as_ref().filter(|s| s.reported).map(|s| s.name);
        let gpu = self.gpu.as_ref().filter(|s| s.reported).map(|s| s.name);
        cpu.into_iter().chain(gpu).collect()
    }
}

#[cfg(feature = "gpu-nvidia")]
fn platform_gpu_probe() -> Option<Box<dyn GpuProbe>> {
    match NvmlGpuProbe::new(0) {
        Ok(probe) => Some(Box::new(probe)),
        Err(err) => {
            log::warn!(
                "{}: gpu sensor unavailable, reporting no value: {:#}",
                FaultKind::SensorUnavailable.code(),
                err
            );
            None
        }
    }
}

#[cfg(not(feature = "gpu-nvidia"))]
fn platform_gpu_probe() -> Option<Box<dyn GpuProbe>> {
    None
}
