//! Error types for delivery, transport and configuration.
//!
//! None of these reach callers of `send_event`/`send_batch`: they are logged with context and
//! folded into either "buffered because the breaker is open" or "buffered after retries were
//! exhausted". They surface directly only from constructors, `check_health`, and task callbacks.
use std::time::Duration;

use crate::scheduler::SchedulerError;
use crate::wire::truncate_body;

/// Failure reported by a [`Transport`](crate::transport::Transport) before any HTTP status exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The remote host could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Any other request-level failure (DNS, TLS, body read).
    #[error("request failed: {0}")]
    Request(String),
    /// The transport was shut down while the request was in flight.
    #[error("transport closed")]
    Closed,
}

/// Unified error type for the delivery path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// The transport capability could not be initialized.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The initial connectivity probe failed.
    #[error("connection probe failed: {0}")]
    ConnectionFailure(String),
    /// The endpoint answered with a non-2xx status. `body` holds at most 200 characters.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// The transport failed before a response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Every attempt failed.
    #[error("retries exhausted after {attempts} attempts; last error: {last}")]
    RetriesExhausted { attempts: usize, last: Box<DeliveryError> },
    /// The breaker refused the attempt before any transport call was made.
    #[error("circuit breaker open ({failure_count} failures, open for {open_for:?})")]
    CircuitOpen { failure_count: usize, open_for: Duration },
    /// The event or batch could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// The client configuration was rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl DeliveryError {
    /// Build an `Http` error, keeping only the first 200 characters of the body.
    pub fn http(status: u16, body: &str) -> Self {
        DeliveryError::Http { status, body: truncate_body(body).to_string() }
    }

    pub fn retries_exhausted(attempts: usize, last: DeliveryError) -> Self {
        DeliveryError::RetriesExhausted { attempts, last: Box::new(last) }
    }

    /// Check if this error is due to the circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// HTTP status carried by this error, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Encode(err.to_string())
    }
}

/// Errors produced when validating [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("url must start with http:// or https:// (got {0:?})")]
    InvalidUrl(String),
    #[error("max_retries must be > 0 (got {0})")]
    InvalidMaxRetries(usize),
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("reset_timeout_s must be > 0")]
    InvalidResetTimeout,
    #[error("max_buffer_size must be > 0 (got {0})")]
    InvalidBufferSize(usize),
    #[error("max_retry_delay_ms ({max}) must be >= retry_delay_ms ({base}) and > 0")]
    InvalidMaxRetryDelay { base: u64, max: u64 },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
