//! Admission control for resource-intensive work.
//!
//! Decisions read one instantaneous snapshot and take no locks; they are
//! advisory at the moment they are made. Denials are ordinary results, not
//! errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EvictionConfig;
use crate::error::WardenError;
use crate::eviction::{evict_stale_records, EvictionReport, RecordStore};
use crate::resources::{cpu_status, memory_status, ResourceLevel, ResourceMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{other}' (expected low, normal or high)")),
        }
    }
}

/// Estimated footprint of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub estimated_memory_mb: f64,
    pub estimated_cpu_percent: f64,
    #[serde(default)]
    pub priority: Priority,
}

impl AdmissionRequest {
    pub fn new(estimated_memory_mb: f64, estimated_cpu_percent: f64, priority: Priority) -> Self {
        Self {
            estimated_memory_mb,
            estimated_cpu_percent,
            priority,
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionDenial {
    /// An estimate is negative or not a finite number.
    InvalidRequest { memory_mb: f64, cpu_percent: f64 },
    /// The host is under critical pressure and the request is not high priority.
    ResourcePressure { memory_percent: f64, cpu_percent: f64 },
    InsufficientMemory { requested_mb: f64, available_mb: f64 },
    InsufficientCpu { requested_percent: f64, available_percent: f64 },
}

impl fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDenial::InvalidRequest {
                memory_mb,
                cpu_percent,
            } => write!(
                f,
                "Invalid request: estimates must be finite and non-negative (memory {} MB, CPU {}%)",
                memory_mb, cpu_percent
            ),
            AdmissionDenial::ResourcePressure {
                memory_percent,
                cpu_percent,
            } => write!(
                f,
                "System under critical resource pressure (memory {:.1}%, CPU {:.1}%)",
                memory_percent, cpu_percent
            ),
            AdmissionDenial::InsufficientMemory {
                requested_mb,
                available_mb,
            } => write!(
                f,
                "Insufficient memory: requested {:.0} MB, {:.0} MB available",
                requested_mb, available_mb
            ),
            AdmissionDenial::InsufficientCpu {
                requested_percent,
                available_percent,
            } => write!(
                f,
                "Insufficient CPU: requested {:.1}%, {:.1}% available",
                requested_percent, available_percent
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionResult {
    pub allocated: bool,
    pub denial: Option<AdmissionDenial>,
    pub available_memory_mb: f64,
    pub available_cpu_percent: f64,
}

impl AdmissionResult {
    pub fn reason(&self) -> Option<String> {
        self.denial.map(|denial| denial.to_string())
    }
}

/// Result of [`AdmissionController::optimize_memory_usage`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryOptimization {
    pub optimized: bool,
    /// Drop in host memory use across the pass, clamped at zero. Other
    /// processes move this figure too, so it is advisory.
    pub freed_memory_mb: f64,
    pub report: EvictionReport,
}

pub struct AdmissionController {
    monitor: Arc<ResourceMonitor>,
    store: Arc<dyn RecordStore>,
    eviction: EvictionConfig,
}

impl AdmissionController {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        store: Arc<dyn RecordStore>,
        eviction: EvictionConfig,
    ) -> Self {
        Self {
            monitor,
            store,
            eviction,
        }
    }

    /// Decide whether `request` may run now.
    ///
    /// High priority skips only the pressure check; requests that do not
    /// fit in free memory or remaining CPU are always denied, as are
    /// negative or non-finite estimates.
    pub fn allocate_resources_for_operation(&self, request: &AdmissionRequest) -> AdmissionResult {
        let thresholds = self.monitor.thresholds();
        let memory = self.monitor.memory_snapshot();
        let cpu = self.monitor.cpu_snapshot();

        let available_memory_mb = memory.free_memory_mb.max(0.0);
        let available_cpu_percent = (100.0 - cpu.system_cpu_percent).max(0.0);

        let critical = memory_status(&memory, &thresholds).level == ResourceLevel::Critical
            || cpu_status(&cpu, &thresholds).level == ResourceLevel::Critical;

        let denial = if !is_valid_estimate(request.estimated_memory_mb)
            || !is_valid_estimate(request.estimated_cpu_percent)
        {
            Some(AdmissionDenial::InvalidRequest {
                memory_mb: request.estimated_memory_mb,
                cpu_percent: request.estimated_cpu_percent,
            })
        } else if critical && request.priority != Priority::High {
            Some(AdmissionDenial::ResourcePressure {
                memory_percent: memory.percent_used,
                cpu_percent: cpu.system_cpu_percent,
            })
        } else if request.estimated_memory_mb > available_memory_mb {
            Some(AdmissionDenial::InsufficientMemory {
                requested_mb: request.estimated_memory_mb,
                available_mb: available_memory_mb,
            })
        } else if request.estimated_cpu_percent + cpu.system_cpu_percent > 100.0 {
            Some(AdmissionDenial::InsufficientCpu {
                requested_percent: request.estimated_cpu_percent,
                available_percent: available_cpu_percent,
            })
        } else {
            None
        };

        match &denial {
            Some(denial) => debug!("Denied {} priority operation: {}", request.priority, denial),
            None => debug!(
                "Admitted {} priority operation ({:.0} MB, {:.1}% CPU)",
                request.priority, request.estimated_memory_mb, request.estimated_cpu_percent
            ),
        }

        AdmissionResult {
            allocated: denial.is_none(),
            denial,
            available_memory_mb,
            available_cpu_percent,
        }
    }

    /// Evict stale records and report how much host memory use dropped.
    pub async fn optimize_memory_usage(&self) -> Result<MemoryOptimization, WardenError> {
        let before = self.monitor.memory_snapshot().used_memory_mb;

        let report = evict_stale_records(self.store.as_ref(), self.eviction.retain).await?;
        if self.eviction.release_memory_hint {
            release_freed_memory();
        }

        let after = self.monitor.memory_snapshot().used_memory_mb;
        let freed_memory_mb = (before - after).max(0.0);

        info!(
            "Evicted {} records ({} failed), freed ~{:.0} MB",
            report.deleted.len(),
            report.failed.len(),
            freed_memory_mb
        );

        Ok(MemoryOptimization {
            optimized: true,
            freed_memory_mb,
            report,
        })
    }
}

fn is_valid_estimate(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Return freed heap pages to the OS where the allocator supports it.
fn release_freed_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator-internal state.
        unsafe {
            libc::malloc_trim(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceThresholds;
    use crate::eviction::testing::MemoryStore;
    use crate::eviction::EvictionCandidate;
    use crate::events::StatusBus;
    use crate::resources::testing::FixedSampler;
    use async_trait::async_trait;

    fn controller(sampler: &FixedSampler, store: Arc<dyn RecordStore>) -> AdmissionController {
        let monitor = Arc::new(ResourceMonitor::new(
            Box::new(sampler.clone()),
            ResourceThresholds::default(),
            StatusBus::new(),
        ));
        AdmissionController::new(monitor, store, EvictionConfig::default())
    }

    fn request(memory_mb: f64, cpu: f64, priority: Priority) -> AdmissionRequest {
        AdmissionRequest::new(memory_mb, cpu, priority)
    }

    #[test]
    fn test_critical_memory_denies_normal_priority() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        let result =
            controller.allocate_resources_for_operation(&request(500.0, 10.0, Priority::Normal));
        assert!(!result.allocated);
        assert!(matches!(
            result.denial,
            Some(AdmissionDenial::ResourcePressure { .. })
        ));
        assert!(result.reason().unwrap().contains("critical resource pressure"));
        assert_eq!(result.available_memory_mb, 1000.0);

        let result =
            controller.allocate_resources_for_operation(&request(500.0, 10.0, Priority::Low));
        assert!(!result.allocated);
    }

    #[test]
    fn test_high_priority_bypasses_pressure() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        let result =
            controller.allocate_resources_for_operation(&request(500.0, 10.0, Priority::High));
        assert!(result.allocated);
        assert!(result.denial.is_none());
        assert_eq!(result.available_cpu_percent, 90.0);
    }

    #[test]
    fn test_critical_cpu_denies_normal_priority() {
        let sampler = FixedSampler::new(16000.0, 8000.0, 90.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        let result =
            controller.allocate_resources_for_operation(&request(1.0, 1.0, Priority::Normal));
        assert!(matches!(
            result.denial,
            Some(AdmissionDenial::ResourcePressure { .. })
        ));
    }

    #[test]
    fn test_memory_beyond_free_denied_for_every_priority() {
        let sampler = FixedSampler::new(16000.0, 8000.0, 10.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        for priority in [Priority::Low, Priority::Normal, Priority::High] {
            let result =
                controller.allocate_resources_for_operation(&request(8001.0, 5.0, priority));
            assert!(!result.allocated);
            assert!(matches!(
                result.denial,
                Some(AdmissionDenial::InsufficientMemory { .. })
            ));
        }

        // Under pressure, high priority still hits the capacity check.
        sampler.set_free(1000.0);
        let result =
            controller.allocate_resources_for_operation(&request(1500.0, 5.0, Priority::High));
        assert!(matches!(
            result.denial,
            Some(AdmissionDenial::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn test_cpu_headroom() {
        let sampler = FixedSampler::new(16000.0, 8000.0, 60.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        let result =
            controller.allocate_resources_for_operation(&request(100.0, 50.0, Priority::High));
        assert!(matches!(
            result.denial,
            Some(AdmissionDenial::InsufficientCpu { .. })
        ));

        let result =
            controller.allocate_resources_for_operation(&request(100.0, 40.0, Priority::Normal));
        assert!(result.allocated);
    }

    #[test]
    fn test_rejects_non_finite_and_negative_estimates() {
        let sampler = FixedSampler::new(16000.0, 8000.0, 10.0);
        let controller = controller(&sampler, Arc::new(MemoryStore::default()));

        for (memory_mb, cpu) in [
            (f64::NAN, f64::NAN),
            (f64::NAN, 5.0),
            (100.0, f64::NAN),
            (-1e9, -500.0),
            (-1.0, 5.0),
            (100.0, -0.5),
            (f64::INFINITY, 5.0),
            (100.0, f64::NEG_INFINITY),
        ] {
            for priority in [Priority::Normal, Priority::High] {
                let result =
                    controller.allocate_resources_for_operation(&request(memory_mb, cpu, priority));
                assert!(!result.allocated, "{memory_mb} MB / {cpu}% admitted");
                assert!(matches!(
                    result.denial,
                    Some(AdmissionDenial::InvalidRequest { .. })
                ));
            }
        }

        // Zero is a valid estimate.
        let result =
            controller.allocate_resources_for_operation(&request(0.0, 0.0, Priority::Normal));
        assert!(result.allocated);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[tokio::test]
    async fn test_optimize_deletes_five_oldest_of_fifteen() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let store = Arc::new(MemoryStore::with_records(15));
        let controller = controller(&sampler, store.clone());

        let result = controller.optimize_memory_usage().await.unwrap();
        assert!(result.optimized);
        assert_eq!(result.freed_memory_mb, 0.0);

        let mut deleted = result.report.deleted;
        deleted.sort();
        assert_eq!(deleted, vec!["r0", "r1", "r2", "r3", "r4"]);
        assert_eq!(store.ids().len(), 10);
        assert!(!store.ids().contains(&"r4".to_string()));
        assert!(store.ids().contains(&"r5".to_string()));
    }

    /// Store whose deletions free memory on the sampled host.
    struct ReclaimingStore {
        inner: MemoryStore,
        sampler: FixedSampler,
        per_record_mb: f64,
    }

    #[async_trait]
    impl RecordStore for ReclaimingStore {
        async fn list_all(&self) -> Result<Vec<EvictionCandidate>, WardenError> {
            self.inner.list_all().await
        }

        async fn delete(&self, id: &str) -> Result<(), WardenError> {
            self.inner.delete(id).await?;
            let free = self.sampler.values.lock().unwrap().0.free_mb;
            self.sampler.set_free(free + self.per_record_mb);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_optimize_reports_freed_memory() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let store = Arc::new(ReclaimingStore {
            inner: MemoryStore::with_records(13),
            sampler: sampler.clone(),
            per_record_mb: 100.0,
        });
        let controller = controller(&sampler, store);

        let result = controller.optimize_memory_usage().await.unwrap();
        assert_eq!(result.report.deleted.len(), 3);
        assert_eq!(result.freed_memory_mb, 300.0);
    }

    #[tokio::test]
    async fn test_optimize_clamps_growth_to_zero() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let store = Arc::new(ReclaimingStore {
            inner: MemoryStore::with_records(12),
            sampler: sampler.clone(),
            per_record_mb: -250.0,
        });
        let controller = controller(&sampler, store);

        let result = controller.optimize_memory_usage().await.unwrap();
        assert_eq!(result.freed_memory_mb, 0.0);
    }

    #[tokio::test]
    async fn test_optimize_fails_when_store_unreadable() {
        let sampler = FixedSampler::new(16000.0, 1000.0, 10.0);
        let store = Arc::new(MemoryStore {
            unavailable: true,
            ..MemoryStore::default()
        });
        let controller = controller(&sampler, store);
        assert!(controller.optimize_memory_usage().await.is_err());
    }
}
