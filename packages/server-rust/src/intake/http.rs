//! HTTP intake: `GET|POST /{serviceID}/{operationPath}?k=v...`.
//!
//! Success is `200` with the JSON reply; failure is the Status Code's HTTP
//! status with an empty body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode as HttpStatus, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use courier_core::StatusCode;
use subtle::ConstantTimeEq;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{receive, Intake};
use crate::config::WrapperConfig;
use crate::network::{HttpConfig, HttpServer, ShutdownController};
use crate::service::Dispatcher;

/// Query parameter carrying the API key. Never passed on to binding.
pub const API_KEY_PARAM: &str = "apiKey";

/// Settings for the HTTP intake.
#[derive(Debug, Clone)]
pub struct HttpIntakeConfig {
    pub http: HttpConfig,
    /// Blank disables the check.
    pub api_key: String,
}

impl From<&WrapperConfig> for HttpIntakeConfig {
    fn from(config: &WrapperConfig) -> Self {
        Self {
            http: HttpConfig {
                host: config.http_host.clone(),
                port: config.http_port,
                cors_origins: config.allowed_cors_origins.clone(),
                drain_timeout: config.drain_timeout(),
                ..HttpConfig::default()
            },
            api_key: config.api_key.clone(),
        }
    }
}

/// Maps a Status Code to the HTTP response carrying it.
#[must_use]
pub fn status_response(status: StatusCode) -> Response {
    HttpStatus::from_u16(status.code())
        .unwrap_or(HttpStatus::INTERNAL_SERVER_ERROR)
        .into_response()
}

/// Compares the supplied key in constant time. A blank configured key
/// accepts everything.
fn api_key_matches(expected: &str, given: Option<&str>) -> bool {
    if expected.trim().is_empty() {
        return true;
    }
    given.is_some_and(|given| bool::from(given.as_bytes().ct_eq(expected.as_bytes())))
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct IntakeState {
    dispatcher: Arc<Dispatcher>,
    api_key: Arc<str>,
    shutdown: Arc<ShutdownController>,
}

async fn handle_request(
    State(state): State<IntakeState>,
    method: Method,
    uri: Uri,
    Query(mut params): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return HttpStatus::METHOD_NOT_ALLOWED.into_response();
    }
    if !state.shutdown.is_accepting() {
        return HttpStatus::SERVICE_UNAVAILABLE.into_response();
    }
    let _guard = state.shutdown.in_flight_guard();

    if !api_key_matches(&state.api_key, params.get(API_KEY_PARAM).map(String::as_str)) {
        debug!(path = uri.path(), "rejected request with bad API key");
        return status_response(StatusCode::Unauthorized);
    }
    params.remove(API_KEY_PARAM);

    match receive(&state.dispatcher, uri.path(), params).await {
        Ok(response) => (
            [(header::CONTENT_TYPE, "application/json")],
            response.to_json_string(),
        )
            .into_response(),
        Err(status) => status_response(status),
    }
}

fn router(state: IntakeState) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

// ---------------------------------------------------------------------------
// HttpIntake
// ---------------------------------------------------------------------------

struct Running {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Serves the dispatcher over HTTP.
pub struct HttpIntake {
    config: HttpIntakeConfig,
    dispatcher: Arc<Dispatcher>,
    running: Mutex<Option<Running>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl HttpIntake {
    #[must_use]
    pub fn new(config: HttpIntakeConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            running: Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// The bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl Intake for HttpIntake {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let mut server = HttpServer::new(self.config.http.clone());
        let addr = server.start().await?;
        let state = IntakeState {
            dispatcher: Arc::clone(&self.dispatcher),
            api_key: Arc::from(self.config.api_key.as_str()),
            shutdown: server.shutdown_controller(),
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(router(state), async move {
            let _ = stop_rx.await;
        }));

        *self.local_addr.lock() = Some(addr);
        *running = Some(Running { stop_tx, handle });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(());
        match running.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HTTP intake stopped with error"),
            Err(e) => warn!(error = %e, "HTTP intake task failed"),
        }
        self.local_addr.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::service::{domain::GuessCounter, Microservice};

    fn state(api_key: &str) -> IntakeState {
        let dispatcher = Arc::new(Dispatcher::new());
        let counter = GuessCounter::with_initial(7);
        dispatcher
            .register_service(counter.id(), counter.operations())
            .unwrap();
        IntakeState {
            dispatcher,
            api_key: Arc::from(api_key),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    async fn call(state: IntakeState, method: Method, uri: &str) -> (HttpStatus, String) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn api_key_rules() {
        assert!(api_key_matches("", None));
        assert!(api_key_matches("", Some("anything")));
        assert!(api_key_matches("k", Some("k")));
        assert!(!api_key_matches("k", None));
        assert!(!api_key_matches("k", Some("K")));
        assert!(!api_key_matches("k", Some("kk")));
    }

    #[tokio::test]
    async fn whitespace_key_is_not_enforced() {
        assert!(api_key_matches("   ", None));
        assert!(api_key_matches("\t", Some("other")));
        let (status, _) = call(state("  "), Method::GET, "/guess-counter/get-count").await;
        assert_eq!(status, HttpStatus::OK);
    }

    #[tokio::test]
    async fn success_is_json_body() {
        let (status, body) = call(state(""), Method::GET, "/guess-counter/get-count").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(body, r#"{"count":7}"#);
    }

    #[tokio::test]
    async fn post_is_accepted() {
        let (status, _) = call(state(""), Method::POST, "/guess-counter/increment-count").await;
        assert_eq!(status, HttpStatus::OK);
    }

    #[tokio::test]
    async fn correlation_id_is_echoed() {
        let (_, body) = call(state(""), Method::GET, "/guess-counter/get-count?uuid=abc").await;
        assert_eq!(body, r#"{"count":7,"uuid":"abc"}"#);
    }

    #[tokio::test]
    async fn failures_are_bare_statuses() {
        for (uri, expected) in [
            ("/guess-counter/nope", HttpStatus::NOT_FOUND),
            ("/missing/get-count", HttpStatus::SERVICE_UNAVAILABLE),
            ("/too/many/segments", HttpStatus::MISDIRECTED_REQUEST),
        ] {
            let (status, body) = call(state(""), Method::GET, uri).await;
            assert_eq!(status, expected, "{uri}");
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn api_key_enforced_and_stripped() {
        let (status, _) = call(state("secret"), Method::GET, "/guess-counter/get-count").await;
        assert_eq!(status, HttpStatus::UNAUTHORIZED);

        let (status, _) = call(
            state("secret"),
            Method::GET,
            "/guess-counter/get-count?apiKey=wrong",
        )
        .await;
        assert_eq!(status, HttpStatus::UNAUTHORIZED);

        let (status, body) = call(
            state("secret"),
            Method::GET,
            "/guess-counter/get-count?apiKey=secret",
        )
        .await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(body, r#"{"count":7}"#);
    }

    #[tokio::test]
    async fn other_methods_rejected() {
        let (status, _) = call(state(""), Method::DELETE, "/guess-counter/get-count").await;
        assert_eq!(status, HttpStatus::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn draining_intake_refuses_new_work() {
        let state = state("");
        state.shutdown.trigger_shutdown();
        let (status, _) = call(state, Method::GET, "/guess-counter/get-count").await;
        assert_eq!(status, HttpStatus::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_unbinds() {
        let config = HttpIntakeConfig {
            http: HttpConfig::loopback(),
            api_key: String::new(),
        };
        let intake = HttpIntake::new(config, state("").dispatcher);
        intake.start().await.unwrap();
        let addr = intake.local_addr().unwrap();
        intake.start().await.unwrap();
        assert_eq!(intake.local_addr(), Some(addr));

        let body = reqwest::get(format!("http://{addr}/guess-counter/get-count"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, r#"{"count":7}"#);

        intake.stop().await;
        assert!(intake.local_addr().is_none());
    }
}
