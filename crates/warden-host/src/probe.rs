//! Health probing of the worker's HTTP endpoint.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::WardenError;

/// Default port for the local llama-server instance.
pub const DEFAULT_PORT: u16 = 11435;

/// A single reachability check. The connection manager treats it as a
/// black box and only cares whether it succeeded.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), WardenError>;
}

/// Probe that issues `GET {base_url}/health`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a probe with default URL (localhost:11435).
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    /// Create a probe with a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Create a probe with a custom port on localhost.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", port))
    }

    /// Per-request timeout; a slower answer counts as unreachable.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<(), WardenError> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    WardenError::ServerNotReachable(self.base_url.clone())
                } else {
                    WardenError::Http(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(WardenError::ServerNotReachable(format!(
                "{} ({})",
                self.base_url,
                response.status()
            )))
        }
    }
}
