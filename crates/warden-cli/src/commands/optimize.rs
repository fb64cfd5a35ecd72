//! Optimize command - evict stale records from a directory.

use std::path::Path;
use std::sync::Arc;
use warden_host::{AdmissionController, EvictionConfig};

use crate::store::DirectoryStore;

pub(crate) async fn run(dir: &Path, retain: usize) -> miette::Result<()> {
    let monitor = super::sampled_monitor().await;
    let controller = AdmissionController::new(
        monitor,
        Arc::new(DirectoryStore::new(dir)),
        EvictionConfig {
            retain,
            ..EvictionConfig::default()
        },
    );

    let result = controller
        .optimize_memory_usage()
        .await
        .map_err(|e| miette::miette!("Eviction failed: {}", e))?;

    println!(
        "Kept {} records, deleted {}",
        result.report.retained,
        result.report.deleted.len()
    );
    for id in &result.report.deleted {
        println!("  - {}", id);
    }
    for (id, reason) in &result.report.failed {
        println!("  ! {} ({})", id, reason);
    }
    println!("Freed ~{:.0} MB", result.freed_memory_mb);

    Ok(())
}
