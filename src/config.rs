//! Client configuration.
//!
//! The host's own config loader is expected to deserialize a [`ClientConfig`] (any serde format)
//! and hand it over; every field has a default so partial documents work.
//!
//! ```rust
//! use courier::ClientConfig;
//!
//! let raw = r#"{"url": "http://localhost:8080/events", "max_retries": 5}"#;
//! let config: ClientConfig = serde_json::from_str(raw).unwrap();
//! assert_eq!(config.max_retries, 5);
//! assert_eq!(config.retry_delay_ms, 1000);
//! config.validate().unwrap();
//! ```

use crate::error::ConfigError;
use crate::jitter::Jitter;
use crate::scheduler::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Single-event endpoint; the batch and health endpoints hang off it.
    pub url: String,
    /// Per-request transport timeout.
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: Option<u64>,
    pub reset_timeout_s: u64,
    pub failure_threshold: usize,
    pub max_buffer_size: usize,
    /// Stamped into events that do not carry their own source.
    pub source: String,
    pub event_version: u32,
    pub batch_path: String,
    pub health_path: String,
    pub jitter: Jitter,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/api/v1/events".to_string(),
            timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: None,
            reset_timeout_s: 60,
            failure_threshold: 3,
            max_buffer_size: 1000,
            source: "courier".to_string(),
            event_version: 1,
            batch_path: "/batch".to_string(),
            health_path: "/health".to_string(),
            jitter: Jitter::None,
        }
    }
}

impl ClientConfig {
    /// Default config pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(0));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(0));
        }
        if self.reset_timeout_s == 0 {
            return Err(ConfigError::InvalidResetTimeout);
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(0));
        }
        if let Some(max) = self.max_retry_delay_ms {
            if max == 0 || max < self.retry_delay_ms {
                return Err(ConfigError::InvalidMaxRetryDelay { base: self.retry_delay_ms, max });
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retry-related subset for the scheduler.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retry_delay: self.max_retry_delay_ms.map(Duration::from_millis),
            reset_timeout: Duration::from_secs(self.reset_timeout_s),
            failure_threshold: self.failure_threshold,
            jitter: self.jitter,
        }
    }

    pub fn event_url(&self) -> String {
        self.url.trim_end_matches('/').to_string()
    }

    pub fn batch_url(&self) -> String {
        join_path(&self.url, &self.batch_path)
    }

    pub fn health_url(&self) -> String {
        join_path(&self.url, &self.health_path)
    }
}

fn join_path(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
