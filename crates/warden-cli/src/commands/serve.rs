//! Serve command - keep the worker up until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use warden_host::{
    Component, HostProcessState, HttpHealthProbe, ResourceLevel, StatusEvent, Warden,
};

use crate::paths;
use crate::settings::Settings;
use crate::store::DirectoryStore;

pub(crate) async fn run(
    settings: Settings,
    monitor_ms: u64,
    records_dir: Option<PathBuf>,
) -> miette::Result<()> {
    let config = settings.warden_config()?;
    let records_dir = records_dir.unwrap_or_else(paths::records_dir);
    std::fs::create_dir_all(&records_dir)
        .map_err(|e| miette::miette!("Failed to create {}: {}", records_dir.display(), e))?;

    let warden = Warden::new(
        config,
        Arc::new(HttpHealthProbe::with_port(settings.port)),
        Arc::new(DirectoryStore::new(records_dir)),
    );
    let mut events = warden.events().subscribe();
    let mut statuses = warden.monitor().subscribe();

    println!("Starting worker {}", settings.server_bin.display());
    connect(&warden).await?;
    warden
        .monitor()
        .start_monitoring(Duration::from_millis(monitor_ms));
    println!("Press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if is_worker_failure(&event) {
                        warden.connection().report_failure(event.message.clone());
                        warden.connection().disconnect();
                        println!("Restarting worker");
                        if let Err(e) = connect(&warden).await {
                            break Err(e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} status events", skipped),
                Err(RecvError::Closed) => break Ok(()),
            },
            status = statuses.recv() => {
                if let Ok(status) = status {
                    if status.level == ResourceLevel::Critical {
                        evict(&warden).await;
                    }
                }
            }
        }
    };

    println!("Shutting down");
    warden.shutdown().await;
    outcome
}

async fn connect(warden: &Warden) -> miette::Result<()> {
    if let Err(e) = warden.connect().await {
        let tail = warden.supervisor().stderr_tail();
        if !tail.is_empty() {
            eprintln!("Last worker output:");
            for line in tail.iter().rev().take(10).rev() {
                eprintln!("  {}", line);
            }
        }
        return Err(miette::miette!("Failed to connect to worker: {}", e));
    }
    println!("Worker ready (PID: {:?})", warden.supervisor().pid());
    Ok(())
}

async fn evict(warden: &Warden) {
    match warden.admission().optimize_memory_usage().await {
        Ok(result) => println!(
            "Evicted {} records under memory pressure (~{:.0} MB freed)",
            result.report.deleted.len(),
            result.freed_memory_mb
        ),
        Err(e) => warn!("Eviction failed: {}", e),
    }
}

/// Shutdown happens after the event loop, so any stop seen inside it means
/// the worker went away on its own, whatever its exit code.
fn is_worker_failure(event: &StatusEvent) -> bool {
    event.component == Component::ProcessSupervisor
        && (event.state == HostProcessState::Error.to_string()
            || event.state == HostProcessState::Stopped.to_string())
}

fn print_event(event: &StatusEvent) {
    println!("[{}] {}: {}", event.component, event.state, event.message);
}
