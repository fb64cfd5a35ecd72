//! Wires the components together around one worker.

use std::sync::Arc;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config::WardenConfig;
use crate::connection::{ConnectionManager, SupervisedWorker};
use crate::error::WardenError;
use crate::events::StatusBus;
use crate::eviction::RecordStore;
use crate::probe::HealthProbe;
use crate::resources::ResourceMonitor;
use crate::sampler::{SysinfoSampler, SystemSampler};
use crate::supervisor::ProcessSupervisor;

/// Owns one supervisor, connection manager, resource monitor and
/// admission controller sharing a single status bus.
pub struct Warden {
    config: WardenConfig,
    events: StatusBus,
    supervisor: Arc<ProcessSupervisor>,
    connection: ConnectionManager,
    monitor: Arc<ResourceMonitor>,
    admission: AdmissionController,
}

impl Warden {
    pub fn new(
        config: WardenConfig,
        probe: Arc<dyn HealthProbe>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self::with_sampler(config, probe, store, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(
        config: WardenConfig,
        probe: Arc<dyn HealthProbe>,
        store: Arc<dyn RecordStore>,
        sampler: Box<dyn SystemSampler>,
    ) -> Self {
        let events = StatusBus::new();
        let supervisor = Arc::new(ProcessSupervisor::new(events.clone()));
        let worker = Arc::new(SupervisedWorker::new(
            Arc::clone(&supervisor),
            config.host.clone(),
        ));
        let connection = ConnectionManager::new(worker, probe, config.retry, events.clone());
        let monitor = Arc::new(ResourceMonitor::new(
            sampler,
            config.thresholds,
            events.clone(),
        ));
        let admission = AdmissionController::new(Arc::clone(&monitor), store, config.eviction);

        Self {
            config,
            events,
            supervisor,
            connection,
            monitor,
            admission,
        }
    }

    /// Connect to the worker, starting it if needed, and measure its CPU
    /// use from then on.
    pub async fn connect(&self) -> Result<(), WardenError> {
        self.connection.ensure_connected().await?;
        self.monitor.watch_process(self.supervisor.pid());
        Ok(())
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn events(&self) -> &StatusBus {
        &self.events
    }

    /// Stop monitoring, drop the connection and stop the worker.
    pub async fn shutdown(&self) {
        self.monitor.stop_monitoring();
        self.monitor.watch_process(None);
        self.connection.disconnect();
        self.supervisor.stop_host().await;
        info!("Warden shut down");
    }
}
