//! Info command - show effective configuration.

use crate::paths;
use crate::settings::Settings;

pub(crate) fn run(settings: &Settings, json: bool) -> miette::Result<()> {
    if json {
        let output = serde_json::to_string_pretty(settings)
            .map_err(|e| miette::miette!("Failed to serialize settings: {}", e))?;
        println!("{}", output);
        return Ok(());
    }

    println!("Warden");
    println!("======");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Worker:");
    println!("  Binary: {}", status_of(&settings.server_bin));
    println!("  Model:  {}", status_of(&settings.model));
    println!("  Port:   {}", settings.port);
    println!();

    println!("Connection:");
    println!("  Max attempts: {}", settings.max_attempts);
    println!("  Retry delay:  {} ms", settings.retry_delay_ms);
    println!();

    println!("Eviction:");
    println!("  Retain:  {} records", settings.retain);
    println!("  Records: {}", paths::records_dir().display());
    println!();

    println!("Data directory: {}", paths::warden_data_dir().display());

    Ok(())
}

fn status_of(path: &std::path::Path) -> String {
    let marker = if path.exists() { "" } else { " (missing)" };
    format!("{}{}", path.display(), marker)
}
