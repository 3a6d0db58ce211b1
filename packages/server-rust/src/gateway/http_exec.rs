//! HTTP executor: calls the least-recently-contacted backend directly.

use std::sync::Arc;
use std::time::Duration;

use courier_core::manifest::probe_operation;
use courier_core::{OperationId, Params, ServiceManifest, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::backends::BackendPool;
use super::ExecuteError;
use crate::intake::http::API_KEY_PARAM;

/// Issues backend calls over HTTP.
pub struct HttpExecutor {
    client: reqwest::Client,
    pool: Arc<BackendPool>,
    /// Attached as `apiKey` when not blank.
    api_key: String,
    timeout: Duration,
}

impl HttpExecutor {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(pool: Arc<BackendPool>, api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            pool,
            api_key: api_key.into(),
            timeout,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    fn query<'a>(&'a self, params: &'a Params) -> Vec<(&'a str, &'a str)> {
        let mut query: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if !self.api_key.trim().is_empty() {
            query.push((API_KEY_PARAM, self.api_key.as_str()));
        }
        query
    }

    async fn call(&self, socket: &str, operation: &OperationId, params: &Params) -> Result<String, ExecuteError> {
        let url = format!("http://{socket}{}", operation.to_path());
        let response = self
            .client
            .get(&url)
            .query(&self.query(params))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecuteError::timeout(self.timeout)
                } else {
                    warn!(%socket, %operation, error = %e, "backend unreachable");
                    ExecuteError::Status(StatusCode::UnknownService)
                }
            })?;

        let code = response.status().as_u16();
        if code != StatusCode::Ok.code() {
            let status = StatusCode::classify(code);
            debug!(%socket, %operation, code, %status, "backend reported failure");
            return Err(ExecuteError::Status(status));
        }
        response.text().await.map_err(|e| {
            warn!(%socket, %operation, error = %e, "failed to read backend body");
            ExecuteError::Status(StatusCode::InternalError)
        })
    }

    /// Calls `operation` on the least-recently-contacted backend hosting its
    /// service. The chosen backend counts as contacted whatever the outcome.
    ///
    /// # Errors
    ///
    /// `UnknownService` when no backend hosts the service or the chosen one
    /// is unreachable, otherwise the backend's classified status.
    pub async fn execute(&self, operation: &OperationId, params: &Params) -> Result<String, ExecuteError> {
        let Some(socket) = self.pool.select(operation.service_id()) else {
            debug!(%operation, "no backend hosts service");
            return Err(ExecuteError::Status(StatusCode::UnknownService));
        };
        self.call(&socket, operation, params).await
    }

    /// Asks one backend which services it hosts.
    ///
    /// # Errors
    ///
    /// Whatever the probe call reports, or `InternalError` for an unreadable
    /// manifest.
    pub async fn fetch_manifest(&self, socket: &str) -> Result<ServiceManifest, ExecuteError> {
        let body = self.call(socket, &probe_operation(), &Params::new()).await?;
        serde_json::from_str::<Map<String, Value>>(&body)
            .ok()
            .as_ref()
            .and_then(ServiceManifest::from_content)
            .ok_or(ExecuteError::Status(StatusCode::InternalError))
    }
}
