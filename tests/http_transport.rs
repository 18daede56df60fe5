#![cfg(feature = "http")]

use courier::{
    ClientConfig, DeliveryClient, Event, HttpTransport, Transport, TransportError,
    TransportRequest,
};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Handle;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, config: ClientConfig) -> DeliveryClient {
    let config = ClientConfig { url: format!("{}/events", server.uri()), ..config };
    let transport = HttpTransport::with_handle(Handle::current()).expect("transport");
    DeliveryClient::new(config, transport).expect("client")
}

/// Tick the client like a host frame loop, yielding to the runtime between frames.
async fn drive_until(client: &DeliveryClient, done: impl Fn(&DeliveryClient) -> bool) {
    for _ in 0..300 {
        client.update(Duration::from_millis(10));
        if done(client) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client did not settle: {:?}", client.status());
}

async fn mount_health(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/events/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivers_event_as_json_post() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({"type": "boot", "payload": {"build": "1.2.3"}})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, ClientConfig::default());
    assert!(client.send_event(Event::new("boot").with_field("build", "1.2.3")));
    drive_until(&client, |c| c.scheduler().active_tasks() == 0).await;

    assert!(client.is_connected());
    assert_eq!(client.status().buffer_len, 0);
    server.verify().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_trip_breaker_and_buffer() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(2)
        .mount(&server)
        .await;

    let config = ClientConfig {
        max_retries: 2,
        retry_delay_ms: 20,
        failure_threshold: 1,
        ..ClientConfig::default()
    };
    let client = client_for(&server, config);
    client.send_event(Event::new("lost"));
    drive_until(&client, |c| c.status().breaker.is_open).await;

    assert_eq!(client.status().buffer_len, 1);
    assert!(!client.send_event(Event::new("held")));
    assert_eq!(client.status().buffer_len, 2);
    server.verify().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_go_to_the_batch_endpoint() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/events/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, ClientConfig::default());
    assert!(client.send_batch(vec![Event::new("a"), Event::new("b")]));
    drive_until(&client, |c| c.scheduler().active_tasks() == 0).await;

    let requests = server.received_requests().await.unwrap_or_default();
    let batch = requests.iter().find(|r| r.url.path() == "/events/batch").expect("batch sent");
    let body: serde_json::Value = serde_json::from_slice(&batch.body).unwrap();
    assert_eq!(body["events"].as_array().map(Vec::len), Some(2));
    assert!(body["batch_id"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_health_hits_health_endpoint() {
    let server = MockServer::start().await;
    mount_health(&server).await;

    let client = client_for(&server, ClientConfig::default());
    let health = client.check_health().await;
    assert!(health.healthy, "{health:?}");
    assert_eq!(health.detail, "HTTP 200");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let transport = HttpTransport::with_handle(Handle::current()).unwrap();
    let request = TransportRequest::post_json(server.uri(), "{}", Duration::from_millis(50));
    let err = transport.send(request).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_host_is_a_transport_error() {
    let transport = HttpTransport::with_handle(Handle::current()).unwrap();
    let request =
        TransportRequest::post_json("http://127.0.0.1:1/events", "{}", Duration::from_secs(2));
    let err = transport.send(request).await.unwrap_err();
    assert!(matches!(err, TransportError::Connect(_) | TransportError::Request(_)), "{err:?}");
}
