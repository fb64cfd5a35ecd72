//! Construction-time configuration for the warden components.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::WardenError;

/// Marker llama-server prints once its HTTP listener is up.
pub const DEFAULT_READY_MARKER: &str = "server is listening";

/// How to launch the worker process.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Path to the worker executable.
    pub exec_path: PathBuf,
    /// Path to the model file handed to the worker.
    pub model_path: PathBuf,
    /// Flag preceding the model path on the command line.
    pub model_flag: String,
    /// Additional arguments appended after the model path.
    pub extra_args: Vec<String>,
    /// Substring on stdout that signals readiness.
    pub ready_marker: String,
    /// How long to wait after SIGTERM before killing.
    pub stop_grace: Duration,
    /// Number of stderr lines retained for diagnostics.
    pub stderr_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            exec_path: PathBuf::new(),
            model_path: PathBuf::new(),
            model_flag: "--model".to_string(),
            extra_args: Vec::new(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            stop_grace: Duration::from_millis(500),
            stderr_capacity: 200,
        }
    }
}

impl HostConfig {
    pub fn new(exec_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Append an argument passed to the worker after the model path.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }
}

/// Bounded-attempt, fixed-delay retry policy for connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Pause between consecutive failed probes.
    pub retry_delay: Duration,
    /// Pause between worker readiness and the first probe.
    pub settle_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(1000),
        }
    }
}

/// Percent-used thresholds for classifying resource pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 80.0,
            memory_critical: 90.0,
            cpu_warning: 70.0,
            cpu_critical: 85.0,
        }
    }
}

impl ResourceThresholds {
    /// Reject thresholds outside `0..=100` or with warning above critical.
    pub fn validate(self) -> Result<Self, WardenError> {
        let pairs = [
            ("memory", self.memory_warning, self.memory_critical),
            ("cpu", self.cpu_warning, self.cpu_critical),
        ];
        for (name, warning, critical) in pairs {
            for value in [warning, critical] {
                if !(0.0..=100.0).contains(&value) {
                    return Err(WardenError::Configuration(format!(
                        "{name} threshold {value} is outside 0..=100"
                    )));
                }
            }
            if warning >= critical {
                return Err(WardenError::Configuration(format!(
                    "{name} warning threshold ({warning}) must be below critical ({critical})"
                )));
            }
        }
        Ok(self)
    }
}

/// Eviction policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Number of most recently active records kept.
    pub retain: usize,
    /// Ask the allocator to return freed pages to the OS after evicting.
    pub release_memory_hint: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            retain: 10,
            release_memory_hint: true,
        }
    }
}

/// Configuration for every component, supplied once at startup.
#[derive(Debug, Clone, Default)]
pub struct WardenConfig {
    pub host: HostConfig,
    pub retry: RetryConfig,
    pub thresholds: ResourceThresholds,
    pub eviction: EvictionConfig,
}

impl WardenConfig {
    /// Create a builder for configuration.
    pub fn builder() -> WardenConfigBuilder {
        WardenConfigBuilder::default()
    }
}

/// Builder for [`WardenConfig`].
#[derive(Debug, Default)]
pub struct WardenConfigBuilder {
    config: WardenConfig,
}

impl WardenConfigBuilder {
    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.host.exec_path = path.into();
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.host.model_path = path.into();
        self
    }

    pub fn host(mut self, host: HostConfig) -> Self {
        self.config.host = host;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.retry_delay = delay;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.retry.settle_delay = delay;
        self
    }

    pub fn thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn retain(mut self, retain: usize) -> Self {
        self.config.eviction.retain = retain;
        self
    }

    pub fn release_memory_hint(mut self, enabled: bool) -> Self {
        self.config.eviction.release_memory_hint = enabled;
        self
    }

    /// Finish the builder, validating thresholds and retry bounds.
    pub fn build(self) -> Result<WardenConfig, WardenError> {
        if self.config.retry.max_attempts == 0 {
            return Err(WardenError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        self.config.thresholds.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.retry_delay, Duration::from_millis(2000));
        assert_eq!(config.thresholds.memory_critical, 90.0);
        assert_eq!(config.thresholds.cpu_warning, 70.0);
        assert_eq!(config.eviction.retain, 10);
        assert_eq!(config.host.model_flag, "--model");
    }

    #[test]
    fn test_builder() {
        let config = WardenConfig::builder()
            .exec_path("/opt/llama-server")
            .model_path("/models/coder.gguf")
            .max_attempts(3)
            .retain(4)
            .build()
            .unwrap();
        assert_eq!(config.host.exec_path, PathBuf::from("/opt/llama-server"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.eviction.retain, 4);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = WardenConfig::builder().max_attempts(0).build();
        assert!(matches!(result, Err(WardenError::Configuration(_))));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let thresholds = ResourceThresholds {
            memory_warning: 95.0,
            ..ResourceThresholds::default()
        };
        assert!(thresholds.validate().is_err());

        let thresholds = ResourceThresholds {
            cpu_critical: 120.0,
            ..ResourceThresholds::default()
        };
        assert!(thresholds.validate().is_err());
    }
}
