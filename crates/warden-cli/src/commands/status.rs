//! Status command - show one resource snapshot.

use serde::Serialize;
use warden_host::{ResourceSnapshot, ResourceStatus};

#[derive(Serialize)]
struct StatusReport {
    snapshot: ResourceSnapshot,
    status: ResourceStatus,
}

pub(crate) async fn run(json: bool) -> miette::Result<()> {
    let monitor = super::sampled_monitor().await;
    let snapshot = monitor.snapshot();
    let status = monitor.check_resource_status();

    if json {
        let report = StatusReport { snapshot, status };
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| miette::miette!("Failed to serialize status: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    println!("Resources: {}", status.level);
    println!("  {}", status.message);
    println!();
    println!(
        "Memory: {:.0} / {:.0} MB used ({:.1}%), {:.0} MB free",
        snapshot.used_memory_mb,
        snapshot.total_memory_mb,
        snapshot.percent_used,
        snapshot.free_memory_mb
    );
    println!("CPU:    {:.1}% system", snapshot.system_cpu_percent);
    let note = if snapshot.process_cpu_estimated {
        " (estimated)"
    } else {
        ""
    };
    println!("        {:.1}% worker{}", snapshot.process_cpu_percent, note);

    Ok(())
}
