//! `reqwest`-backed transport.
//!
//! Requests run on a Tokio runtime, never on the host thread. The future handed back to the
//! scheduler only awaits the spawned task's `JoinHandle`; when the response lands, the runtime
//! wakes the local task and the next `update(dt)` picks up the result.

use crate::error::{DeliveryError, TransportError};
use crate::transport::{Method, Transport, TransportFuture, TransportRequest, TransportResponse};
use futures::future::FutureExt;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// HTTP transport with its own (or a borrowed) Tokio runtime.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    handle: Handle,
    // Kept alive for the transport's lifetime when we built it ourselves.
    _runtime: Option<Runtime>,
}

impl HttpTransport {
    /// Build a transport with a dedicated single-worker runtime.
    ///
    /// The runtime shuts down when the transport is dropped, which Tokio forbids from inside
    /// another runtime's async context; use [`with_handle`](Self::with_handle) there instead.
    pub fn new() -> Result<Self, DeliveryError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("courier-http")
            .enable_all()
            .build()
            .map_err(|e| DeliveryError::TransportUnavailable(e.to_string()))?;
        let handle = runtime.handle().clone();
        Ok(Self { client: build_client()?, handle, _runtime: Some(runtime) })
    }

    /// Build a transport that spawns requests onto an existing runtime.
    pub fn with_handle(handle: Handle) -> Result<Self, DeliveryError> {
        Ok(Self { client: build_client()?, handle, _runtime: None })
    }
}

fn build_client() -> Result<reqwest::Client, DeliveryError> {
    reqwest::Client::builder()
        .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| DeliveryError::TransportUnavailable(e.to_string()))
}

fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let client = self.client.clone();
        let task = self.handle.spawn(async move {
            let TransportRequest { method, url, headers, body, timeout } = request;
            let method = match method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
            };
            let mut builder = client.request(method, url.as_str()).timeout(timeout).body(body);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.send().await.map_err(|e| map_error(e, timeout))?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| map_error(e, timeout))?;
            Ok(TransportResponse { status, body })
        });
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => Err(TransportError::Closed),
                Err(err) => Err(TransportError::Request(err.to_string())),
            }
        }
        .boxed_local()
    }
}
