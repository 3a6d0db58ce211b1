//! The gateway's public HTTP surface: `GET|POST /{serviceID}/{operationPath}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode as HttpStatus, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

use super::{ExecuteError, Gateway};
use crate::config::GatewayConfig;
use crate::intake::http::status_response;
use crate::network::{HttpConfig, ShutdownController};

/// Headroom between the gateway's own timeouts and the listener's request
/// timeout, so callers see 504 from the gateway rather than 408 from the
/// listener.
const LAYER_TIMEOUT_HEADROOM: Duration = Duration::from_secs(1);

/// Listener settings for the front door.
#[must_use]
pub fn http_config(config: &GatewayConfig) -> HttpConfig {
    let longest = config
        .request_timeout()
        .max(config.single_response_timeout());
    HttpConfig {
        host: config.host.clone(),
        port: config.port,
        cors_origins: config.allowed_cors_origins.clone(),
        request_timeout: longest + LAYER_TIMEOUT_HEADROOM,
        ..HttpConfig::default()
    }
}

#[derive(Clone)]
struct FrontDoorState {
    gateway: Arc<Gateway>,
    shutdown: Arc<ShutdownController>,
}

fn error_response(error: ExecuteError) -> Response {
    match error {
        ExecuteError::Status(status) => status_response(status),
        ExecuteError::Timeout { .. } => HttpStatus::GATEWAY_TIMEOUT.into_response(),
    }
}

async fn forward(
    State(state): State<FrontDoorState>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return HttpStatus::METHOD_NOT_ALLOWED.into_response();
    }
    if !state.shutdown.is_accepting() {
        return HttpStatus::SERVICE_UNAVAILABLE.into_response();
    }
    let _guard = state.shutdown.in_flight_guard();

    match state.gateway.execute(uri.path(), params).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => error_response(e),
    }
}

/// Builds the front-door router. `shutdown` should be the controller of the
/// `HttpServer` serving it.
pub fn router(gateway: Arc<Gateway>, shutdown: Arc<ShutdownController>) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(FrontDoorState { gateway, shutdown })
}
