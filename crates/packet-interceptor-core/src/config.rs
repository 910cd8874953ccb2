//! Configuration types for the packet interceptor.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section is optional; omitted values fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the interceptor.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterceptorConfig {
    /// Asynchronous pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// What happens when a bounded internal queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Report the overflow and drop the packet from async processing.
    #[default]
    Drop,
    /// Wait for room. Lossless, but a slow listener stalls its producers.
    Block,
}

/// Asynchronous pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum number of async listener callbacks executing at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of each async listener's processing queue.
    #[serde(default = "default_listener_queue_capacity")]
    pub listener_queue_capacity: usize,

    /// Maximum packets in flight per connection and direction.
    #[serde(default = "default_sending_queue_capacity")]
    pub sending_queue_capacity: usize,

    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,

    /// How long a packet may stay in the async pipeline before it is
    /// dropped, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Period of the expiry sweeper, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics are exported.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_max_concurrency() -> usize {
    5
}

fn default_listener_queue_capacity() -> usize {
    1024
}

fn default_sending_queue_capacity() -> usize {
    61_440
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    50
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            listener_queue_capacity: default_listener_queue_capacity(),
            sending_queue_capacity: default_sending_queue_capacity(),
            queue_full_policy: QueueFullPolicy::default(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl InterceptorConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.pipeline.validate()
    }
}

impl PipelineConfig {
    /// Validate the pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_concurrency` is zero
    /// - either queue capacity is zero
    /// - `max_concurrency` or a queue capacity exceeds the semaphore permit limit
    /// - `timeout_ms` or `sweep_interval_ms` is zero
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrency));
        }

        if self.listener_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity {
                queue: "listener",
                capacity: self.listener_queue_capacity,
            });
        }

        if self.sending_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity {
                queue: "sending",
                capacity: self.sending_queue_capacity,
            });
        }

        for (field, value) in [
            ("max_concurrency", self.max_concurrency),
            ("listener_queue_capacity", self.listener_queue_capacity),
            ("sending_queue_capacity", self.sending_queue_capacity),
        ] {
            if value > Semaphore::MAX_PERMITS {
                return Err(ConfigError::PermitLimitExceeded {
                    field,
                    value,
                    max: Semaphore::MAX_PERMITS,
                });
            }
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
