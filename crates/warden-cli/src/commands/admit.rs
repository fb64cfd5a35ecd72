//! Admit command - run one admission decision against the live host.

use std::sync::Arc;
use warden_host::{AdmissionController, AdmissionRequest, EvictionConfig, Priority};

use crate::paths;
use crate::store::DirectoryStore;

pub(crate) async fn run(
    memory_mb: f64,
    cpu: f64,
    priority: Priority,
    json: bool,
) -> miette::Result<()> {
    let monitor = super::sampled_monitor().await;
    let controller = AdmissionController::new(
        monitor,
        Arc::new(DirectoryStore::new(paths::records_dir())),
        EvictionConfig::default(),
    );

    let request = AdmissionRequest::new(memory_mb, cpu, priority);
    let result = controller.allocate_resources_for_operation(&request);

    if json {
        let out = serde_json::to_string_pretty(&result)
            .map_err(|e| miette::miette!("Failed to serialize result: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    match result.reason() {
        None => println!("Admitted ({} priority)", priority),
        Some(reason) => println!("Denied: {}", reason),
    }
    println!(
        "  available: {:.0} MB memory, {:.1}% CPU",
        result.available_memory_mb, result.available_cpu_percent
    );

    Ok(())
}
