//! Memory/CPU sampling and pressure classification.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ResourceThresholds;
use crate::events::{now_ms, Component, StatusBus};
use crate::sampler::{MemoryReading, SystemSampler};

/// Share of system CPU attributed to the process when the sampler cannot
/// measure it. A coarse estimate, not an accounting figure.
pub const ESTIMATED_PROCESS_CPU_SHARE: f64 = 0.6;

/// Severity of resource pressure, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceLevel::Normal => "normal",
            ResourceLevel::Warning => "warning",
            ResourceLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub level: ResourceLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub free_memory_mb: f64,
    pub percent_used: f64,
    pub taken_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuSnapshot {
    pub system_cpu_percent: f64,
    pub process_cpu_percent: f64,
    /// `process_cpu_percent` is [`ESTIMATED_PROCESS_CPU_SHARE`] of the
    /// system figure rather than a measurement.
    pub process_cpu_estimated: bool,
    pub taken_at_ms: u64,
}

/// Combined reading. Recomputed on every call, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub free_memory_mb: f64,
    pub percent_used: f64,
    pub system_cpu_percent: f64,
    pub process_cpu_percent: f64,
    pub process_cpu_estimated: bool,
    pub taken_at_ms: u64,
}

struct Timer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    sampler: Mutex<Box<dyn SystemSampler>>,
    thresholds: ResourceThresholds,
    statuses: broadcast::Sender<ResourceStatus>,
    events: StatusBus,
}

/// Samples host resources and classifies pressure.
pub struct ResourceMonitor {
    shared: Arc<Shared>,
    timer: Mutex<Option<Timer>>,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Box<dyn SystemSampler>,
        thresholds: ResourceThresholds,
        events: StatusBus,
    ) -> Self {
        let (statuses, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                sampler: Mutex::new(sampler),
                thresholds,
                statuses,
                events,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        self.shared.thresholds
    }

    pub fn memory_snapshot(&self) -> MemorySnapshot {
        self.shared.memory_snapshot()
    }

    pub fn cpu_snapshot(&self) -> CpuSnapshot {
        self.shared.cpu_snapshot()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let memory = self.memory_snapshot();
        let cpu = self.cpu_snapshot();
        ResourceSnapshot {
            total_memory_mb: memory.total_memory_mb,
            used_memory_mb: memory.used_memory_mb,
            free_memory_mb: memory.free_memory_mb,
            percent_used: memory.percent_used,
            system_cpu_percent: cpu.system_cpu_percent,
            process_cpu_percent: cpu.process_cpu_percent,
            process_cpu_estimated: cpu.process_cpu_estimated,
            taken_at_ms: cpu.taken_at_ms,
        }
    }

    pub fn check_memory_status(&self) -> ResourceStatus {
        memory_status(&self.memory_snapshot(), &self.shared.thresholds)
    }

    pub fn check_cpu_status(&self) -> ResourceStatus {
        cpu_status(&self.cpu_snapshot(), &self.shared.thresholds)
    }

    /// The more severe of the memory and CPU statuses.
    pub fn check_resource_status(&self) -> ResourceStatus {
        self.shared.check_resource_status()
    }

    /// Measure this PID's CPU usage instead of estimating it.
    pub fn watch_process(&self, pid: Option<u32>) {
        self.shared.lock_sampler().watch_process(pid);
    }

    /// Receive every status produced by the periodic monitor.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceStatus> {
        self.shared.statuses.subscribe()
    }

    /// Run `check_resource_status` every `interval`, replacing any
    /// previously started timer.
    pub fn start_monitoring(&self, interval: Duration) {
        let mut timer = self.lock_timer();
        if let Some(previous) = timer.take() {
            previous.cancel.cancel();
            previous.task.abort();
        }

        let period = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => shared.periodic_check(),
                }
            }
        });

        debug!("Resource monitoring every {:?}", period);
        *timer = Some(Timer { cancel, task });
    }

    pub fn stop_monitoring(&self) {
        if let Some(timer) = self.lock_timer().take() {
            timer.cancel.cancel();
            timer.task.abort();
            debug!("Resource monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_timer()
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<Timer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl Shared {
    fn lock_sampler(&self) -> MutexGuard<'_, Box<dyn SystemSampler>> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory_snapshot(&self) -> MemorySnapshot {
        let reading = self.lock_sampler().memory();
        memory_snapshot_from(reading)
    }

    fn cpu_snapshot(&self) -> CpuSnapshot {
        let reading = self.lock_sampler().cpu();
        let system = reading.system_percent.clamp(0.0, 100.0);
        let (process, estimated) = match reading.process_percent {
            Some(measured) => (measured, false),
            None => (system * ESTIMATED_PROCESS_CPU_SHARE, true),
        };
        CpuSnapshot {
            system_cpu_percent: system,
            process_cpu_percent: process,
            process_cpu_estimated: estimated,
            taken_at_ms: now_ms(),
        }
    }

    fn check_resource_status(&self) -> ResourceStatus {
        let memory = memory_status(&self.memory_snapshot(), &self.thresholds);
        let cpu = cpu_status(&self.cpu_snapshot(), &self.thresholds);
        combine(memory, cpu)
    }

    fn periodic_check(&self) {
        let status = self.check_resource_status();
        if status.level != ResourceLevel::Normal {
            warn!("Resource pressure {}: {}", status.level, status.message);
            self.events
                .emit(Component::ResourceMonitor, status.level, status.message.clone());
        }
        let _ = self.statuses.send(status);
    }
}

fn memory_snapshot_from(reading: MemoryReading) -> MemorySnapshot {
    let percent_used = if reading.total_mb > 0.0 {
        reading.used_mb / reading.total_mb * 100.0
    } else {
        0.0
    };
    MemorySnapshot {
        total_memory_mb: reading.total_mb,
        used_memory_mb: reading.used_mb,
        free_memory_mb: reading.free_mb,
        percent_used,
        taken_at_ms: now_ms(),
    }
}

fn classify(value: f64, warning: f64, critical: f64) -> ResourceLevel {
    if value >= critical {
        ResourceLevel::Critical
    } else if value >= warning {
        ResourceLevel::Warning
    } else {
        ResourceLevel::Normal
    }
}

pub(crate) fn memory_status(
    snapshot: &MemorySnapshot,
    thresholds: &ResourceThresholds,
) -> ResourceStatus {
    let level = classify(
        snapshot.percent_used,
        thresholds.memory_warning,
        thresholds.memory_critical,
    );
    let message = match level {
        ResourceLevel::Normal => format!("Memory usage normal: {:.1}%", snapshot.percent_used),
        ResourceLevel::Warning => format!(
            "Memory usage high: {:.1}% ({:.0} MB free)",
            snapshot.percent_used, snapshot.free_memory_mb
        ),
        ResourceLevel::Critical => format!(
            "Memory usage critical: {:.1}% ({:.0} MB free)",
            snapshot.percent_used, snapshot.free_memory_mb
        ),
    };
    ResourceStatus { level, message }
}

pub(crate) fn cpu_status(snapshot: &CpuSnapshot, thresholds: &ResourceThresholds) -> ResourceStatus {
    let level = classify(
        snapshot.system_cpu_percent,
        thresholds.cpu_warning,
        thresholds.cpu_critical,
    );
    let message = match level {
        ResourceLevel::Normal => format!("CPU usage normal: {:.1}%", snapshot.system_cpu_percent),
        ResourceLevel::Warning => format!("CPU usage high: {:.1}%", snapshot.system_cpu_percent),
        ResourceLevel::Critical => {
            format!("CPU usage critical: {:.1}%", snapshot.system_cpu_percent)
        }
    };
    ResourceStatus { level, message }
}

fn combine(memory: ResourceStatus, cpu: ResourceStatus) -> ResourceStatus {
    ResourceStatus {
        level: memory.level.max(cpu.level),
        message: format!("{}; {}", memory.message, cpu.message),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::sampler::CpuReading;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sampler returning fixed figures, with settable values and a read
    /// counter shared with the test.
    #[derive(Clone)]
    pub(crate) struct FixedSampler {
        pub(crate) values: Arc<Mutex<(MemoryReading, CpuReading)>>,
        pub(crate) memory_reads: Arc<AtomicU32>,
    }

    impl FixedSampler {
        pub(crate) fn new(total_mb: f64, free_mb: f64, system_cpu: f64) -> Self {
            Self {
                values: Arc::new(Mutex::new((
                    MemoryReading {
                        total_mb,
                        used_mb: total_mb - free_mb,
                        free_mb,
                    },
                    CpuReading {
                        system_percent: system_cpu,
                        process_percent: None,
                    },
                ))),
                memory_reads: Arc::new(AtomicU32::new(0)),
            }
        }

        pub(crate) fn set_free(&self, free_mb: f64) {
            let mut values = self.values.lock().unwrap();
            values.0.free_mb = free_mb;
            values.0.used_mb = values.0.total_mb - free_mb;
        }

        pub(crate) fn reads(&self) -> u32 {
            self.memory_reads.load(Ordering::SeqCst)
        }
    }

    impl SystemSampler for FixedSampler {
        fn memory(&mut self) -> MemoryReading {
            self.memory_reads.fetch_add(1, Ordering::SeqCst);
            self.values.lock().unwrap().0
        }

        fn cpu(&mut self) -> CpuReading {
            self.values.lock().unwrap().1
        }
    }
}
