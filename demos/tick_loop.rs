//! Host frame loop driving a delivery client over HTTP.
//!
//! Point `COURIER_URL` at an ingestion endpoint (defaults to `http://localhost:8080/api/v1/events`)
//! and watch the breaker and buffer react when it goes away.
use courier::prelude::*;
use std::time::{Duration, Instant};

const FRAME: Duration = Duration::from_millis(16);

fn main() -> Result<(), DeliveryError> {
    tracing_subscriber::fmt().with_target(false).init();

    let mut config = ClientConfig::default();
    if let Ok(url) = std::env::var("COURIER_URL") {
        config.url = url;
    }
    config.source = "tick-loop-demo".to_string();
    let client = DeliveryClient::with_http(config)?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    for frame in 0u64..600 {
        if frame % 30 == 0 {
            client.send_event(Event::new("heartbeat").with_field("frame", frame));
        }
        if frame % 120 == 0 {
            let burst = (0..12).map(|i| Event::new("position").with_field("seq", i)).collect();
            client.send_batch(burst);
        }

        client.update(FRAME);

        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = client.status();
            println!(
                "t={:>4.1}s connected={} breaker={:?} buffered={} evicted={} in_flight={}",
                started.elapsed().as_secs_f32(),
                status.connected,
                status.breaker.state,
                status.buffer_len,
                status.evicted,
                status.breaker.active_tasks,
            );
            last_report = Instant::now();
        }
        std::thread::sleep(FRAME);
    }

    let status = client.status();
    println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
    Ok(())
}
