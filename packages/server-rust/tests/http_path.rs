//! End-to-end tests over real loopback listeners: wrapper HTTP intake and
//! the HTTP gateway in front of it.

use std::sync::Arc;
use std::time::Duration;

use courier_server::config::{GatewayConfig, Transport};
use courier_server::gateway::server as front_door;
use courier_server::gateway::GatewayService;
use courier_server::intake::{HttpIntake, HttpIntakeConfig, IntakeManager};
use courier_server::network::{HttpConfig, HttpServer};
use courier_server::service::domain::GuessCounter;
use courier_server::service::{Dispatcher, ServiceHost};
use futures_util::future::join_all;
use serde_json::Value;

struct Wrapper {
    host: ServiceHost,
    counter: GuessCounter,
    socket: String,
}

async fn spawn_wrapper(api_key: &str) -> Wrapper {
    let dispatcher = Arc::new(Dispatcher::new());
    let intake = Arc::new(HttpIntake::new(
        HttpIntakeConfig {
            http: HttpConfig::loopback(),
            api_key: api_key.to_string(),
        },
        Arc::clone(&dispatcher),
    ));
    let host = ServiceHost::new(dispatcher, IntakeManager::new().with(intake.clone())).unwrap();
    let counter = GuessCounter::default();
    host.run(Arc::new(counter.clone())).unwrap();
    host.start().await.unwrap();
    let socket = intake.local_addr().unwrap().to_string();
    Wrapper {
        host,
        counter,
        socket,
    }
}

async fn get(url: &str) -> (u16, String) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn hundred_concurrent_increments_are_all_counted() {
    let wrapper = spawn_wrapper("").await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/guess-counter/increment-count", wrapper.socket);

    let calls = (0..100).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move { client.post(&url).send().await.unwrap().status().as_u16() }
    });
    let statuses = join_all(calls).await;
    assert!(statuses.iter().all(|s| *s == 200));

    let (status, body) = get(&format!("http://{}/guess-counter/get-count", wrapper.socket)).await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"count":100}"#);

    wrapper.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrapper_answers_discovery_probe() {
    let wrapper = spawn_wrapper("").await;
    let (status, body) = get(&format!("http://{}/service-wrapper/get-ids", wrapper.socket)).await;
    assert_eq!(status, 200);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["version"], 1);
    assert_eq!(value["ids"], serde_json::json!(["guess-counter"]));
    wrapper.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn stopped_service_becomes_unknown() {
    let wrapper = spawn_wrapper("").await;
    let url = format!("http://{}/guess-counter/get-count", wrapper.socket);
    assert_eq!(get(&url).await.0, 200);

    assert!(wrapper.host.stop("guess-counter").await.unwrap());
    assert_eq!(get(&url).await.0, 503);
    wrapper.host.shutdown().await.unwrap();
}

fn gateway_config(sockets: Vec<String>, api_key: &str) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        transport: Transport::Http,
        api_key: api_key.to_string(),
        http_sockets: sockets,
        allowed_cors_origins: vec!["*".to_string()],
        request_timeout_ms: 2_000,
        ..GatewayConfig::default()
    }
}

/// Polls until the gateway can reach `path`, i.e. discovery has run.
async fn wait_for_route(service: &GatewayService, path: &str) {
    let gateway = service.gateway();
    for _ in 0..100 {
        if gateway.execute(path, Default::default()).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway never discovered {path}");
}

#[tokio::test]
async fn gateway_forwards_with_api_key() {
    let wrapper = spawn_wrapper("s3cret").await;
    let config = gateway_config(vec![wrapper.socket.clone()], "s3cret");
    let service = GatewayService::start(&config, None).await.unwrap();
    wait_for_route(&service, "/guess-counter/get-count").await;

    let mut server = HttpServer::new(front_door::http_config(&config));
    let addr = server.start().await.unwrap();
    let router = front_door::router(service.gateway(), server.shutdown_controller());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve(router, async move {
        let _ = stop_rx.await;
    }));

    let (status, _) = get(&format!("http://{addr}/guess-counter/increment-count")).await;
    assert_eq!(status, 200);
    let (status, body) = get(&format!("http://{addr}/guess-counter/get-count")).await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"count":1}"#);

    let (status, _) = get(&format!("http://{addr}/guess-counter/reset")).await;
    assert_eq!(status, 404);
    let (status, _) = get(&format!("http://{addr}/bible-reader/random-verse")).await;
    assert_eq!(status, 503);

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();
    service.stop().await;
    wrapper.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn gateway_with_wrong_key_discovers_nothing() {
    let wrapper = spawn_wrapper("right").await;
    let config = gateway_config(vec![wrapper.socket.clone()], "wrong");
    let service = GatewayService::start(&config, None).await.unwrap();

    // The probe itself is rejected, so nothing is ever discovered.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = service
        .gateway()
        .execute("/guess-counter/get-count", Default::default())
        .await;
    assert_eq!(
        result,
        Err(courier_server::ExecuteError::Status(
            courier_core::StatusCode::UnknownService
        ))
    );
    service.stop().await;
    wrapper.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn gateway_rotates_across_wrappers() {
    let wrappers = vec![
        spawn_wrapper("").await,
        spawn_wrapper("").await,
        spawn_wrapper("").await,
    ];
    let sockets = wrappers.iter().map(|w| w.socket.clone()).collect();
    let service = GatewayService::start(&gateway_config(sockets, ""), None)
        .await
        .unwrap();
    wait_for_route(&service, "/guess-counter/get-count").await;

    let gateway = service.gateway();
    for _ in 0..6 {
        gateway
            .execute("/guess-counter/increment-count", Default::default())
            .await
            .unwrap();
    }

    // Strict least-recently-contacted rotation spreads the calls evenly.
    let counts: Vec<u64> = wrappers.iter().map(|w| w.counter.count()).collect();
    assert_eq!(counts.iter().sum::<u64>(), 6);
    assert!(counts.iter().all(|c| *c == 2), "{counts:?}");

    service.stop().await;
    for wrapper in wrappers {
        wrapper.host.shutdown().await.unwrap();
    }
}
