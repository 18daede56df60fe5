//! Resilient delivery client.
//!
//! [`DeliveryClient`] turns `send_event`/`send_batch` calls into tasks on a [`RetryScheduler`].
//! A `true` return means "accepted for processing", not "delivered": the request goes out on a
//! later [`update`](DeliveryClient::update), and anything that cannot be delivered ends up in a
//! bounded drop-oldest buffer that is flushed once the breaker allows traffic again.
//!
//! ```rust
//! use std::time::Duration;
//! use courier::{ClientConfig, DeliveryClient, Event, MockTransport};
//!
//! let transport = MockTransport::new();
//! let client =
//!     DeliveryClient::new(ClientConfig::new("http://ingest.test/events"), transport.clone())
//!         .unwrap();
//!
//! assert!(client.send_event(Event::new("player_joined").with_field("id", 7)));
//! assert_eq!(transport.request_count(), 0); // nothing leaves before the host ticks
//!
//! client.update(Duration::ZERO);
//! assert_eq!(transport.requests_to("/events").len(), 1);
//! assert!(client.status().connected);
//! ```

use crate::buffer::BoundedBuffer;
use crate::circuit_breaker::CircuitState;
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::DeliveryError;
use crate::event::{now_millis, Batch, Event};
use crate::scheduler::{RetryScheduler, SchedulerStatus, TaskContext, TaskHandle};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use crate::wire;
use futures::future::{FutureExt, LocalBoxFuture};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

/// Most events drained from the buffer or the queue into one batch.
pub const FLUSH_CHUNK_SIZE: usize = 10;

/// Optional sink that takes over `send_event` (e.g. to coalesce high-frequency events).
pub trait EventAggregator {
    /// Take `event`; the return value is handed back to the `send_event` caller.
    fn add_event(&mut self, event: Event) -> bool;
}

impl<F> EventAggregator for F
where
    F: FnMut(Event) -> bool,
{
    fn add_event(&mut self, event: Event) -> bool {
        self(event)
    }
}

/// Result of [`DeliveryClient::check_health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub healthy: bool,
    pub detail: String,
}

impl HealthCheck {
    fn healthy(detail: impl Into<String>) -> Self {
        Self { healthy: true, detail: detail.into() }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self { healthy: false, detail: detail.into() }
    }
}

/// Snapshot for monitoring dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub connected: bool,
    pub queue_len: usize,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    /// Events dropped from the buffer to make room.
    pub evicted: u64,
    pub breaker: SchedulerStatus,
    pub url: String,
}

struct Endpoints {
    event: String,
    batch: String,
    health: String,
}

struct ClientState {
    connected: bool,
    /// Set by the first delivered event or batch; a late failed probe cannot undo it.
    delivered: bool,
    probed: bool,
    buffer: BoundedBuffer<Event>,
    queue: BoundedBuffer<Event>,
    flushing: bool,
    queue_sending: bool,
}

struct ClientInner {
    config: ClientConfig,
    endpoints: Endpoints,
    scheduler: RetryScheduler,
    transport: Rc<dyn Transport>,
    aggregator: RefCell<Option<Box<dyn EventAggregator>>>,
    state: RefCell<ClientState>,
}

type Settled = Box<dyn FnOnce(&DeliveryClient)>;

/// Handle to a delivery client. Clones share the same state; not `Send`.
#[derive(Clone)]
pub struct DeliveryClient {
    inner: Rc<ClientInner>,
}

#[derive(Clone)]
struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    fn upgrade(&self) -> Option<DeliveryClient> {
        self.0.upgrade().map(|inner| DeliveryClient { inner })
    }
}

impl fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("url", &self.inner.config.url)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DeliveryClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Rc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    aggregator: Option<Box<dyn EventAggregator>>,
}

impl ClientBuilder {
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Rc::new(transport));
        self
    }

    /// Clock for the breaker's reset timeout.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn aggregator<A: EventAggregator + 'static>(mut self, aggregator: A) -> Self {
        self.aggregator = Some(Box::new(aggregator));
        self
    }

    /// Validate the config and assemble the client. Performs no network activity.
    pub fn build(self) -> Result<DeliveryClient, DeliveryError> {
        let ClientBuilder { config, transport, clock, aggregator } = self;
        config.validate()?;
        let transport = match transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let mut scheduler = RetryScheduler::new(config.retry_config())
            .map_err(|e| DeliveryError::Config(e.into()))?;
        if let Some(clock) = clock {
            scheduler = scheduler.with_clock(clock);
        }
        let endpoints = Endpoints {
            event: config.event_url(),
            batch: config.batch_url(),
            health: config.health_url(),
        };
        let state = ClientState {
            connected: false,
            delivered: false,
            probed: false,
            buffer: BoundedBuffer::new(config.max_buffer_size),
            queue: BoundedBuffer::new(config.max_buffer_size),
            flushing: false,
            queue_sending: false,
        };
        tracing::debug!(url = %endpoints.event, batch = %endpoints.batch, "delivery client ready");
        Ok(DeliveryClient {
            inner: Rc::new(ClientInner {
                config,
                endpoints,
                scheduler,
                transport,
                aggregator: RefCell::new(aggregator),
                state: RefCell::new(state),
            }),
        })
    }
}

#[cfg(feature = "http")]
fn default_transport() -> Result<Rc<dyn Transport>, DeliveryError> {
    Ok(Rc::new(crate::http::HttpTransport::new()?))
}

#[cfg(not(feature = "http"))]
fn default_transport() -> Result<Rc<dyn Transport>, DeliveryError> {
    Err(DeliveryError::TransportUnavailable(
        "no transport supplied and the `http` feature is disabled".to_string(),
    ))
}

impl DeliveryClient {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder { config, transport: None, clock: None, aggregator: None }
    }

    pub fn new<T: Transport + 'static>(
        config: ClientConfig,
        transport: T,
    ) -> Result<Self, DeliveryError> {
        Self::builder(config).transport(transport).build()
    }

    /// Client over the built-in HTTP transport.
    #[cfg(feature = "http")]
    pub fn with_http(config: ClientConfig) -> Result<Self, DeliveryError> {
        Self::builder(config).transport(crate::http::HttpTransport::new()?).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.inner.scheduler
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    /// Route subsequent `send_event` calls through `aggregator`.
    pub fn set_aggregator<A: EventAggregator + 'static>(&self, aggregator: A) {
        match self.inner.aggregator.try_borrow_mut() {
            Ok(mut slot) => *slot = Some(Box::new(aggregator)),
            Err(_) => tracing::warn!("aggregator busy; registration ignored"),
        }
    }

    pub fn clear_aggregator(&self) {
        match self.inner.aggregator.try_borrow_mut() {
            Ok(mut slot) => *slot = None,
            Err(_) => tracing::warn!("aggregator busy; clear ignored"),
        }
    }

    /// Accept `event` for delivery.
    ///
    /// Returns `false` only when the breaker refused the attempt (the event is buffered) or an
    /// aggregator rejected it. Never blocks and never surfaces an error.
    pub fn send_event(&self, event: Event) -> bool {
        let event = match self.delegate(event) {
            Ok(accepted) => return accepted,
            Err(event) => event,
        };
        self.ensure_probed();
        if !self.inner.scheduler.can_attempt() {
            tracing::debug!(event_type = %event.event_type, "circuit open; buffering event");
            self.buffer_event(event);
            return false;
        }
        self.submit_event(event);
        true
    }

    /// Accept `events` for delivery as one batch. An empty list is a no-op.
    pub fn send_batch(&self, events: Vec<Event>) -> bool {
        if events.is_empty() {
            return true;
        }
        self.ensure_probed();
        if !self.inner.scheduler.can_attempt() {
            tracing::debug!(events = events.len(), "circuit open; buffering batch");
            for event in events {
                self.buffer_event(event);
            }
            return false;
        }
        self.submit_batch(events, None);
        true
    }

    /// Hold `event` for a later flush, evicting the oldest entry when full.
    pub fn buffer_event(&self, event: Event) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(dropped) = state.buffer.push(event) {
            tracing::warn!(
                dropped_type = %dropped.event_type,
                dropped_id = ?dropped.event_id,
                capacity = state.buffer.capacity(),
                "buffer full; dropped oldest event"
            );
        }
    }

    /// Copy of the buffered events, oldest first.
    pub fn buffered_events(&self) -> Vec<Event> {
        self.inner.state.borrow().buffer.iter().cloned().collect()
    }

    /// Submit buffered events in batches of up to [`FLUSH_CHUNK_SIZE`] while the breaker allows.
    ///
    /// Returns how many events were submitted; a nested call while a flush is running returns 0.
    pub fn flush_buffer(&self) -> usize {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.flushing || state.buffer.is_empty() {
                if state.flushing {
                    tracing::debug!("flush already in progress");
                }
                return 0;
            }
            state.flushing = true;
        }
        let mut submitted = 0;
        loop {
            if self.inner.state.borrow().buffer.is_empty() {
                break;
            }
            if !self.inner.scheduler.can_attempt() {
                tracing::debug!(
                    remaining = self.inner.state.borrow().buffer.len(),
                    "circuit open; flush halted"
                );
                break;
            }
            let chunk = self.inner.state.borrow_mut().buffer.drain_front(FLUSH_CHUNK_SIZE);
            submitted += chunk.len();
            self.submit_batch(chunk, None);
        }
        self.inner.state.borrow_mut().flushing = false;
        if submitted > 0 {
            tracing::debug!(submitted, "flushed buffered events");
        }
        submitted
    }

    /// Add `event` to the legacy send queue.
    pub fn enqueue(&self, event: Event) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(dropped) = state.queue.push(event) {
            tracing::warn!(dropped_type = %dropped.event_type, "queue full; dropped oldest event");
        }
    }

    /// Send the next chunk of the legacy queue. Returns whether a batch was submitted.
    ///
    /// Only one queue batch is in flight at a time; failed events move to the buffer.
    pub fn process_queue(&self) -> bool {
        {
            let state = self.inner.state.borrow();
            if state.queue_sending || state.queue.is_empty() {
                return false;
            }
        }
        if !self.inner.scheduler.can_attempt() {
            tracing::debug!("circuit open; queue processing deferred");
            return false;
        }
        let chunk = {
            let mut state = self.inner.state.borrow_mut();
            state.queue_sending = true;
            state.queue.drain_front(FLUSH_CHUNK_SIZE)
        };
        self.submit_batch(
            chunk,
            Some(Box::new(|client: &DeliveryClient| {
                client.inner.state.borrow_mut().queue_sending = false;
            })),
        );
        true
    }

    /// Drive the client: advance retry timers by `dt`, run ready tasks, then flush any backlog.
    pub fn update(&self, dt: Duration) {
        self.inner.scheduler.update(dt);
        let backlog = !self.inner.state.borrow().buffer.is_empty();
        if backlog {
            self.flush_buffer();
        }
    }

    /// Probe the health endpoint once, bypassing retries but not the breaker.
    pub async fn check_health(&self) -> HealthCheck {
        let scheduler = &self.inner.scheduler;
        if !scheduler.can_attempt() {
            let snap = scheduler.breaker().snapshot();
            let err = DeliveryError::CircuitOpen {
                failure_count: snap.failure_count,
                open_for: snap.open_for.unwrap_or_default(),
            };
            return HealthCheck::unhealthy(err.to_string());
        }
        // An abandoned half-open probe counts as a failure, reopening the breaker.
        struct ProbeSlot<'a> {
            scheduler: &'a RetryScheduler,
            held: bool,
        }
        impl Drop for ProbeSlot<'_> {
            fn drop(&mut self) {
                if self.held {
                    tracing::warn!("health check dropped while holding the half-open probe");
                    self.scheduler.record_failure();
                }
            }
        }
        let mut slot = ProbeSlot {
            scheduler,
            held: scheduler.breaker().state() == CircuitState::HalfOpen,
        };

        let request = self.health_request();
        let outcome = self.inner.transport.send(request).await;
        slot.held = false;
        match outcome {
            Ok(response) if response.is_success() => {
                scheduler.record_success();
                self.set_connected(true);
                HealthCheck::healthy(format!("HTTP {}", response.status))
            }
            Ok(response) => {
                scheduler.record_failure();
                self.set_connected(false);
                HealthCheck::unhealthy(
                    DeliveryError::http(response.status, &response.body).to_string(),
                )
            }
            Err(err) => {
                scheduler.record_failure();
                self.set_connected(false);
                HealthCheck::unhealthy(DeliveryError::from(err).to_string())
            }
        }
    }

    pub fn status(&self) -> ClientStatus {
        let state = self.inner.state.borrow();
        ClientStatus {
            connected: state.connected,
            queue_len: state.queue.len(),
            buffer_len: state.buffer.len(),
            buffer_capacity: state.buffer.capacity(),
            evicted: state.buffer.evicted(),
            breaker: self.inner.scheduler.status(),
            url: self.inner.config.url.clone(),
        }
    }

    fn downgrade(&self) -> WeakClient {
        WeakClient(Rc::downgrade(&self.inner))
    }

    fn set_connected(&self, connected: bool) {
        self.inner.state.borrow_mut().connected = connected;
    }

    fn mark_delivered(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.connected = true;
        state.delivered = true;
    }

    /// `Err` hands the event back when there is no aggregator, or it is busy (re-entrant send).
    fn delegate(&self, event: Event) -> Result<bool, Event> {
        let Ok(mut slot) = self.inner.aggregator.try_borrow_mut() else {
            return Err(event);
        };
        match slot.as_mut() {
            Some(aggregator) => Ok(aggregator.add_event(event)),
            None => Err(event),
        }
    }

    fn health_request(&self) -> TransportRequest {
        let body = serde_json::json!({
            "source": self.inner.config.source,
            "timestamp": now_millis(),
        });
        TransportRequest::post_json(
            self.inner.endpoints.health.clone(),
            body.to_string(),
            self.inner.config.timeout(),
        )
    }

    /// One-shot connectivity probe on first use. Failure marks the client disconnected unless
    /// something has already been delivered.
    fn ensure_probed(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.probed {
                return;
            }
            state.probed = true;
        }
        let request = self.health_request();
        let url = request.url.clone();
        let transport = Rc::clone(&self.inner.transport);
        let client = self.downgrade();
        self.inner.scheduler.spawn(TaskContext::new("probe").with("url", &url), async move {
            let outcome = transport.send(request).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            let failure = match outcome {
                Ok(response) if response.is_success() => None,
                Ok(response) => Some(DeliveryError::http(response.status, &response.body)),
                Err(err) => Some(err.into()),
            };
            match failure {
                None => {
                    client.set_connected(true);
                    tracing::info!(url = %url, "connected to ingestion endpoint");
                }
                Some(err) => {
                    {
                        let mut state = client.inner.state.borrow_mut();
                        if !state.delivered {
                            state.connected = false;
                        }
                    }
                    let err = DeliveryError::ConnectionFailure(err.to_string());
                    tracing::warn!(url = %url, error = %err, "connectivity probe failed");
                }
            }
        });
    }

    /// Operation for the scheduler: POST `body` to `url`, mapping non-2xx to `Http`.
    fn post(
        &self,
        url: String,
        body: String,
    ) -> impl FnMut() -> LocalBoxFuture<'static, Result<TransportResponse, DeliveryError>> + 'static
    {
        let transport = Rc::clone(&self.inner.transport);
        let timeout = self.inner.config.timeout();
        move || {
            let request = TransportRequest::post_json(url.clone(), body.clone(), timeout);
            let pending = transport.send(request);
            async move {
                let response = pending.await?;
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(DeliveryError::http(response.status, &response.body))
                }
            }
            .boxed_local()
        }
    }

    fn submit_event(&self, mut event: Event) -> Option<TaskHandle> {
        let config = &self.inner.config;
        event.stamp(&config.source, config.event_version);
        let body = match wire::encode_event(&event) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    event_type = %event.event_type,
                    "dropping unencodable event"
                );
                return None;
            }
        };
        let event_id = event.event_id.map(|id| id.to_string()).unwrap_or_default();
        let context = TaskContext::new("send_event")
            .with("event_id", &event_id)
            .with("type", &event.event_type);
        let attempts = self.inner.scheduler.config().max_retries;

        let on_success = {
            let client = self.downgrade();
            move |_: TransportResponse| {
                if let Some(client) = client.upgrade() {
                    client.mark_delivered();
                }
            }
        };
        let on_failure = {
            let client = self.downgrade();
            move |err: DeliveryError| {
                let Some(client) = client.upgrade() else {
                    return;
                };
                let err = DeliveryError::retries_exhausted(attempts, err);
                tracing::warn!(
                    event_id = %event_id,
                    error = %err,
                    "event not delivered; buffering"
                );
                client.set_connected(false);
                client.buffer_event(event);
            }
        };
        let operation = self.post(self.inner.endpoints.event.clone(), body);
        Some(self.inner.scheduler.execute_with_retry(operation, context, on_success, on_failure))
    }

    /// Submit `events` as one batch without re-checking the breaker; callers have already asked.
    /// `on_settled` runs once when the batch succeeds or is given up on.
    fn submit_batch(
        &self,
        mut events: Vec<Event>,
        on_settled: Option<Settled>,
    ) -> Option<TaskHandle> {
        let config = &self.inner.config;
        for event in &mut events {
            event.stamp(&config.source, config.event_version);
        }
        let batch = Batch::new(events, config.source.clone());
        let body = match wire::encode_batch(&batch) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    batch_id = %batch.batch_id,
                    "dropping unencodable batch"
                );
                if let Some(done) = on_settled {
                    done(self);
                }
                return None;
            }
        };
        let Batch { batch_id, events, .. } = batch;
        let count = events.len();
        let context =
            TaskContext::new("send_batch").with("batch_id", batch_id).with("events", count);
        let attempts = self.inner.scheduler.config().max_retries;
        let settled = Rc::new(Cell::new(on_settled));

        let on_success = {
            let client = self.downgrade();
            let settled = Rc::clone(&settled);
            move |_: TransportResponse| {
                let Some(client) = client.upgrade() else {
                    return;
                };
                tracing::debug!(batch_id = %batch_id, events = count, "batch delivered");
                client.mark_delivered();
                if let Some(done) = settled.take() {
                    done(&client);
                }
                client.flush_buffer();
            }
        };
        let on_failure = {
            let client = self.downgrade();
            move |err: DeliveryError| {
                let Some(client) = client.upgrade() else {
                    return;
                };
                let err = DeliveryError::retries_exhausted(attempts, err);
                tracing::warn!(
                    batch_id = %batch_id,
                    events = count,
                    error = %err,
                    "batch not delivered; buffering events"
                );
                client.set_connected(false);
                for event in events {
                    client.buffer_event(event);
                }
                if let Some(done) = settled.take() {
                    done(&client);
                }
            }
        };
        let operation = self.post(self.inner.endpoints.batch.clone(), body);
        Some(self.inner.scheduler.execute_with_retry(operation, context, on_success, on_failure))
    }
}
