//! Convenient re-exports for hosts embedding courier.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    client::{ClientStatus, DeliveryClient, EventAggregator, HealthCheck, FLUSH_CHUNK_SIZE},
    config::ClientConfig,
    error::{ConfigError, DeliveryError, TransportError},
    event::{Batch, Event},
    jitter::Jitter,
    scheduler::{RetryConfig, RetryScheduler, TaskContext},
    transport::{Transport, TransportRequest, TransportResponse},
};
