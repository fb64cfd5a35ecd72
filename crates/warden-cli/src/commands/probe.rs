//! Probe command - check the worker's health endpoint once.

use std::time::Duration;
use warden_host::{HealthProbe, HttpHealthProbe};

pub(crate) async fn run(port: u16, timeout: Duration) -> miette::Result<()> {
    let probe = HttpHealthProbe::with_port(port).with_timeout(timeout);
    probe
        .probe()
        .await
        .map_err(|e| miette::miette!("Worker unhealthy: {}", e))?;

    println!("Worker at {} is healthy", probe.base_url());
    Ok(())
}
