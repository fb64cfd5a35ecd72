//! Effective CLI settings: defaults, then environment, then flags.

use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use warden_host::{HostConfig, WardenConfig, DEFAULT_PORT};

use crate::paths;

pub const ENV_SERVER_BIN: &str = "WARDEN_SERVER_BIN";
pub const ENV_MODEL: &str = "WARDEN_MODEL";
pub const ENV_PORT: &str = "WARDEN_PORT";
pub const ENV_MAX_ATTEMPTS: &str = "WARDEN_MAX_ATTEMPTS";
pub const ENV_RETRY_DELAY_MS: &str = "WARDEN_RETRY_DELAY_MS";
pub const ENV_RETAIN: &str = "WARDEN_RETAIN";

/// Worker flags shared by the commands that talk to llama-server.
#[derive(Args, Debug, Default, Clone)]
pub struct WorkerArgs {
    /// Path to the llama-server binary
    #[arg(long)]
    pub server_bin: Option<PathBuf>,
    /// Path to the model file
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Port llama-server listens on
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub server_bin: PathBuf,
    pub model: PathBuf,
    pub port: u16,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retain: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let config = WardenConfig::default();
        Self {
            server_bin: paths::llama_server_path(),
            model: paths::default_model_path(),
            port: DEFAULT_PORT,
            max_attempts: config.retry.max_attempts,
            retry_delay_ms: config.retry.retry_delay.as_millis() as u64,
            retain: config.eviction.retain,
        }
    }
}

impl Settings {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> miette::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> miette::Result<Self> {
        let mut settings = Self::default();
        if let Some(path) = lookup(ENV_SERVER_BIN) {
            settings.server_bin = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_MODEL) {
            settings.model = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_PORT) {
            settings.port = parse(ENV_PORT, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            settings.max_attempts = parse(ENV_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_DELAY_MS) {
            settings.retry_delay_ms = parse(ENV_RETRY_DELAY_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETAIN) {
            settings.retain = parse(ENV_RETAIN, &value)?;
        }
        Ok(settings)
    }

    /// Apply command-line flags on top.
    pub fn with_args(mut self, args: &WorkerArgs) -> Self {
        if let Some(path) = &args.server_bin {
            self.server_bin = path.clone();
        }
        if let Some(path) = &args.model {
            self.model = path.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        self
    }

    /// Library configuration for these settings; llama-server is bound to
    /// localhost on the configured port.
    pub fn warden_config(&self) -> miette::Result<WardenConfig> {
        let host = HostConfig::new(&self.server_bin, &self.model)
            .with_arg("--host")
            .with_arg("127.0.0.1")
            .with_arg("--port")
            .with_arg(self.port.to_string());

        WardenConfig::builder()
            .host(host)
            .max_attempts(self.max_attempts)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .retain(self.retain)
            .build()
            .map_err(|e| miette::miette!("Invalid configuration: {}", e))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> miette::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| miette::miette!("Invalid {} '{}': {}", key, value, e))
}
