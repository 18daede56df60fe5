#![allow(dead_code)]

use courier::{
    ClientConfig, DeliveryClient, ManualClock, MockTransport, TransportError, TransportResponse,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub const URL: &str = "http://ingest.test/events";

/// Three attempts, 100ms base delay, defaults otherwise.
pub fn fast_config() -> ClientConfig {
    ClientConfig { max_retries: 3, retry_delay_ms: 100, ..ClientConfig::new(URL) }
}

pub fn refused() -> Result<TransportResponse, TransportError> {
    Err(TransportError::Connect("connection refused".into()))
}

pub fn respond(status: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse::new(status, ""))
}

pub fn client_with_clock(
    config: ClientConfig,
    transport: &MockTransport,
    clock: &ManualClock,
) -> DeliveryClient {
    DeliveryClient::builder(config)
        .transport(transport.clone())
        .clock(clock.clone())
        .build()
        .expect("valid client config")
}

/// Call `update(dt)` `times` times.
pub fn tick(client: &DeliveryClient, times: usize, dt: Duration) {
    for _ in 0..times {
        client.update(dt);
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures formatted `tracing` output on the current thread while alive.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .without_time()
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}
