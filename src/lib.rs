#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # courier
//!
//! Resilient, tick-driven event delivery for hosts that own their main loop (game servers,
//! simulations, embedded agents).
//!
//! ## Features
//!
//! - **Non-blocking sends**: `send_event`/`send_batch` return at once; work runs on a cooperative
//!   executor that only moves when the host calls `update(dt)`
//! - **Retries** with exponential backoff measured in host ticks, optionally capped and jittered
//! - **Circuit breaker** with lazy half-open probing
//! - **Drop-oldest buffering** of anything undeliverable, flushed in batches once traffic is
//!   allowed again
//! - **Pluggable transport**: `reqwest` over HTTP (feature `http`) or a scripted mock
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use courier::{ClientConfig, DeliveryClient, Event, MockTransport};
//!
//! let client =
//!     DeliveryClient::new(ClientConfig::new("http://localhost:8080/events"), MockTransport::new())
//!         .unwrap();
//!
//! client.send_event(Event::new("match_started").with_field("map", "dust"));
//!
//! // Somewhere in the host's frame loop:
//! client.update(Duration::from_millis(16));
//! ```

pub mod backoff;
pub mod buffer;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
#[cfg(feature = "http")]
pub mod http;
pub mod jitter;
pub mod prelude;
pub mod scheduler;
pub mod timer;
pub mod transport;
pub mod wire;

// Re-exports
pub use backoff::{Backoff, DelayTable};
pub use buffer::BoundedBuffer;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ClientBuilder, ClientStatus, DeliveryClient, EventAggregator, HealthCheck};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ClientConfig;
pub use error::{ConfigError, DeliveryError, TransportError};
pub use event::{Batch, Event};
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use jitter::Jitter;
pub use scheduler::{
    RetryConfig, RetryScheduler, SchedulerStatus, TaskContext, TaskHandle, TaskOutcome,
};
pub use timer::TickTimer;
pub use transport::{MockTransport, Transport, TransportRequest, TransportResponse};
