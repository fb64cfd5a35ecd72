//! Warden CLI - supervise and inspect a local llama-server worker.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use warden_host::Priority;

mod commands;
mod paths;
mod settings;
mod store;

use settings::{Settings, WorkerArgs};

/// Warden - control plane for a local LLM worker
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker and keep it supervised until Ctrl-C
    Serve {
        #[command(flatten)]
        worker: WorkerArgs,
        /// Resource check interval in milliseconds
        #[arg(long, default_value_t = 5000)]
        monitor_ms: u64,
        /// Directory of records to evict from under memory pressure
        #[arg(long)]
        records_dir: Option<PathBuf>,
    },

    /// Show current memory and CPU usage
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ask whether an operation of the given size may run now
    Admit {
        /// Estimated memory in MB
        #[arg(long)]
        memory_mb: f64,
        /// Estimated CPU in percent of the machine
        #[arg(long)]
        cpu: f64,
        /// Operation priority (low, normal, high)
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evict all but the most recently modified files in a directory
    Optimize {
        /// Record directory
        #[arg(long)]
        dir: PathBuf,
        /// Number of records to keep (default: WARDEN_RETAIN or 10)
        #[arg(long)]
        retain: Option<usize>,
    },

    /// Probe the worker's health endpoint once
    Probe {
        /// Port llama-server listens on
        #[arg(long)]
        port: Option<u16>,
        /// Request timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Show effective configuration and paths
    Info {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = if cli.verbose { "debug" } else { "warn" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let settings = Settings::from_env()?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?;

    match cli.command {
        Commands::Serve {
            worker,
            monitor_ms,
            records_dir,
        } => runtime.block_on(commands::serve::run(
            settings.with_args(&worker),
            monitor_ms,
            records_dir,
        )),
        Commands::Status { json } => runtime.block_on(commands::status::run(json)),
        Commands::Admit {
            memory_mb,
            cpu,
            priority,
            json,
        } => runtime.block_on(commands::admit::run(memory_mb, cpu, priority, json)),
        Commands::Optimize { dir, retain } => runtime.block_on(commands::optimize::run(
            &dir,
            retain.unwrap_or(settings.retain),
        )),
        Commands::Probe { port, timeout_ms } => runtime.block_on(commands::probe::run(
            port.unwrap_or(settings.port),
            Duration::from_millis(timeout_ms),
        )),
        Commands::Info { json } => commands::info::run(&settings, json),
    }
}
