//! CLI commands.

pub mod admit;
pub mod info;
pub mod optimize;
pub mod probe;
pub mod serve;
pub mod status;

use std::sync::Arc;
use std::time::Duration;
use warden_host::{ResourceMonitor, ResourceThresholds, StatusBus, SysinfoSampler};

/// A monitor whose first CPU reading covers a short sampling window.
pub(crate) async fn sampled_monitor() -> Arc<ResourceMonitor> {
    let monitor = ResourceMonitor::new(
        Box::new(SysinfoSampler::new()),
        ResourceThresholds::default(),
        StatusBus::new(),
    );
    // CPU usage is a delta between refreshes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    Arc::new(monitor)
}
