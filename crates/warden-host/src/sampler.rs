//! Raw host readings.

use sysinfo::{Pid, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory figures in megabytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub total_mb: f64,
    pub used_mb: f64,
    pub free_mb: f64,
}

/// CPU utilisation since the previous reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuReading {
    /// Busy share of all cores, 0-100.
    pub system_percent: f64,
    /// Share of the whole machine used by the watched process, when known.
    pub process_percent: Option<f64>,
}

/// Source of host memory and CPU readings.
pub trait SystemSampler: Send {
    fn memory(&mut self) -> MemoryReading;

    fn cpu(&mut self) -> CpuReading;

    /// Measure this process from now on. `None` stops per-process sampling.
    fn watch_process(&mut self, _pid: Option<u32>) {}
}

/// [`SystemSampler`] backed by `sysinfo`.
///
/// CPU figures are deltas between consecutive refreshes, so the first
/// reading covers the time since construction.
pub struct SysinfoSampler {
    system: System,
    watched: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            watched: None,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSampler {
    fn memory(&mut self) -> MemoryReading {
        self.system.refresh_memory();
        let total = self.system.total_memory() as f64;
        // "Available" includes reclaimable page cache, which is what a new
        // allocation can actually get.
        let free = self.system.available_memory() as f64;
        MemoryReading {
            total_mb: total / BYTES_PER_MB,
            used_mb: (total - free).max(0.0) / BYTES_PER_MB,
            free_mb: free / BYTES_PER_MB,
        }
    }

    fn cpu(&mut self) -> CpuReading {
        self.system.refresh_cpu();
        let system_percent = f64::from(self.system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);

        let process_percent = self.watched.and_then(|pid| {
            if !self.system.refresh_process(pid) {
                return None;
            }
            let cores = self.system.cpus().len().max(1) as f64;
            self.system
                .process(pid)
                .map(|process| (f64::from(process.cpu_usage()) / cores).clamp(0.0, 100.0))
        });

        CpuReading {
            system_percent,
            process_percent,
        }
    }

    fn watch_process(&mut self, pid: Option<u32>) {
        self.watched = pid.map(Pid::from_u32);
    }
}
