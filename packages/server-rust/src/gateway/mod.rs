//! Front-line gateway: forwards end-user calls to backend microservices over
//! HTTP or through the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{OperationId, Params, StatusCode};
use tracing::{debug, info};

use crate::broker::Broker;
use crate::config::{GatewayConfig, Transport};
use crate::intake::http::API_KEY_PARAM;
use crate::service::BackgroundWorker;

pub mod backends;
pub mod broker_exec;
pub mod discovery;
pub mod http_exec;
pub mod pending;
pub mod server;

pub use backends::{BackendDescriptor, BackendPool, KnownServices};
pub use broker_exec::{BrokerExecutor, BrokerExecutorConfig};
pub use discovery::{Discovery, DiscoveryTask};
pub use http_exec::HttpExecutor;
pub use pending::PendingWaits;

/// Why a gateway call produced no content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    /// The backend (or the gateway itself) reported a Status Code.
    #[error("backend reported {0}")]
    Status(StatusCode),
    /// Nothing answered in time. May succeed on another instance.
    #[error("no reply within {ms}ms")]
    Timeout { ms: u64 },
}

impl ExecuteError {
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            ExecuteError::Status(status) => status.as_str(),
            ExecuteError::Timeout { .. } => "timeout",
        }
    }
}

/// The executor a gateway forwards through.
pub enum Executor {
    Http(Arc<HttpExecutor>),
    Broker {
        executor: Arc<BrokerExecutor>,
        known: Arc<KnownServices>,
    },
}

impl Executor {
    fn transport(&self) -> &'static str {
        match self {
            Executor::Http(_) => "http",
            Executor::Broker { .. } => "broker",
        }
    }
}

/// Routes one end-user call to a backend.
pub struct Gateway {
    executor: Executor,
}

impl Gateway {
    #[must_use]
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    #[must_use]
    pub fn transport(&self) -> &'static str {
        self.executor.transport()
    }

    /// Forwards `GET /{serviceID}/{operationPath}` with `params` and returns
    /// the backend's JSON reply text.
    ///
    /// Client-supplied `apiKey` and `uuid` are not forwarded; the gateway
    /// sets its own.
    ///
    /// # Errors
    ///
    /// `Status(BadUpstreamUrl)` for malformed paths, `Status(UnknownService)`
    /// when no backend is known for the service, `Timeout` when a broker
    /// reply does not arrive in time, otherwise the backend's status.
    pub async fn execute(&self, path: &str, mut params: HashMap<String, String>) -> Result<String, ExecuteError> {
        params.remove(API_KEY_PARAM);
        params.remove(courier_core::CORRELATION_FIELD);

        let result = match OperationId::from_path(path) {
            Ok(operation) => self.forward(&operation, &Params::from(params)).await,
            Err(status) => Err(ExecuteError::Status(status)),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        metrics::counter!(
            "courier_gateway_requests_total",
            "transport" => self.transport(),
            "outcome" => outcome
        )
        .increment(1);
        if let Err(e) = &result {
            debug!(path, error = %e, "gateway call failed");
        }
        result
    }

    async fn forward(&self, operation: &OperationId, params: &Params) -> Result<String, ExecuteError> {
        match &self.executor {
            Executor::Http(executor) => executor.execute(operation, params).await,
            Executor::Broker { executor, known } => {
                if !known.may_host(operation.service_id()) {
                    return Err(ExecuteError::Status(StatusCode::UnknownService));
                }
                let reply = executor.request(operation, params).await?;
                Ok(reply.into_value().to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayService
// ---------------------------------------------------------------------------

/// A running gateway: the executor plus its discovery worker.
pub struct GatewayService {
    gateway: Arc<Gateway>,
    discovery: BackgroundWorker<Discovery>,
    broker_executor: Option<Arc<BrokerExecutor>>,
}

impl GatewayService {
    /// Builds the configured executor, starts its reply consumer when on the
    /// broker, and starts discovery with an immediate first round.
    ///
    /// # Errors
    ///
    /// Fails when the broker transport is selected without a broker, or when
    /// the executor cannot be started.
    pub async fn start(config: &GatewayConfig, broker: Option<Arc<dyn Broker>>) -> anyhow::Result<Self> {
        let (executor, discovery, broker_executor) = match config.transport {
            Transport::Http => {
                let pool = Arc::new(BackendPool::new());
                let http = Arc::new(HttpExecutor::new(
                    pool,
                    config.api_key.clone(),
                    config.request_timeout(),
                )?);
                let discovery = Discovery::Http {
                    executor: Arc::clone(&http),
                    sockets: config.http_sockets.clone(),
                };
                (Executor::Http(http), discovery, None)
            }
            Transport::Broker => {
                let Some(broker) = broker else {
                    anyhow::bail!("broker transport selected but no broker connection available");
                };
                let executor = Arc::new(BrokerExecutor::new(BrokerExecutorConfig::from(config), broker));
                executor.start().await?;
                let known = Arc::new(KnownServices::new());
                let discovery = Discovery::Broker {
                    executor: Arc::clone(&executor),
                    known: Arc::clone(&known),
                };
                (
                    Executor::Broker {
                        executor: Arc::clone(&executor),
                        known,
                    },
                    discovery,
                    Some(executor),
                )
            }
        };

        let gateway = Arc::new(Gateway::new(executor));
        let discovery = BackgroundWorker::start(discovery, config.discovery_interval());
        discovery.submit(DiscoveryTask::Refresh).await?;

        info!(transport = gateway.transport(), "gateway started");
        Ok(Self {
            gateway,
            discovery,
            broker_executor,
        })
    }

    #[must_use]
    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::clone(&self.gateway)
    }

    /// Asks for a discovery round outside the regular interval.
    ///
    /// # Errors
    ///
    /// Fails if the discovery worker has stopped.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        self.discovery.submit(DiscoveryTask::Refresh).await
    }

    pub async fn stop(mut self) {
        self.discovery.stop().await;
        if let Some(executor) = self.broker_executor.take() {
            executor.stop();
        }
        info!("gateway stopped");
    }
}
