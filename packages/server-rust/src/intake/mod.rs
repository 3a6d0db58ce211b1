//! Transport intakes feeding the dispatcher.
//!
//! Each intake owns one transport listener or consumer, turns inbound traffic
//! into request envelopes, and maps dispatch outcomes back into its
//! transport's representation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{OperationId, RequestEnvelope, ResponseEnvelope, StatusCode};
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::config::WrapperConfig;
use crate::service::Dispatcher;

pub mod broker;
pub mod http;

pub use broker::{BrokerIntake, BrokerIntakeConfig, Outcome, RequestProcessor};
pub use http::{HttpIntake, HttpIntakeConfig};

/// One transport entry point.
#[async_trait]
pub trait Intake: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts listening or consuming. Calling it on a running intake is a
    /// no-op.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stops accepting work and drains what is in flight.
    async fn stop(&self);
}

/// Resolves a URL-style address and dispatches it.
///
/// # Errors
///
/// `BadUpstreamUrl` for paths that are not `/{serviceID}/{operationPath}`,
/// otherwise whatever the dispatcher reports.
pub async fn receive(
    dispatcher: &Dispatcher,
    path: &str,
    params: HashMap<String, String>,
) -> Result<ResponseEnvelope, StatusCode> {
    let operation = OperationId::from_path(path).inspect_err(|_| {
        debug!(path, "request path is not /{{service}}/{{operation}}");
    })?;
    dispatcher
        .dispatch(RequestEnvelope::new(operation, params))
        .await
}

// ---------------------------------------------------------------------------
// IntakeManager
// ---------------------------------------------------------------------------

/// Owns the intakes of one service host.
#[derive(Default)]
pub struct IntakeManager {
    intakes: Vec<Arc<dyn Intake>>,
}

impl IntakeManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the intakes enabled in `config`.
    ///
    /// The broker intake needs a connected `broker`; if broker hosting is
    /// enabled without one, it is skipped with an error log.
    #[must_use]
    pub fn from_config(
        config: &WrapperConfig,
        dispatcher: &Arc<Dispatcher>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Self {
        let mut manager = Self::new();
        if config.host_with_http {
            manager.add(Arc::new(HttpIntake::new(
                HttpIntakeConfig::from(config),
                Arc::clone(dispatcher),
            )));
        }
        if config.host_with_broker {
            match broker {
                Some(broker) => manager.add(Arc::new(BrokerIntake::new(
                    BrokerIntakeConfig::from(config),
                    broker,
                    Arc::clone(dispatcher),
                ))),
                None => error!("broker hosting enabled but no broker connection available"),
            }
        }
        manager
    }

    pub fn add(&mut self, intake: Arc<dyn Intake>) {
        self.intakes.push(intake);
    }

    #[must_use]
    pub fn with(mut self, intake: Arc<dyn Intake>) -> Self {
        self.add(intake);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.intakes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intakes.is_empty()
    }

    /// Starts every intake. A failing intake is logged and skipped. Returns
    /// how many started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for intake in &self.intakes {
            match intake.start().await {
                Ok(()) => {
                    info!(intake = intake.name(), "intake started");
                    started += 1;
                }
                Err(e) => error!(intake = intake.name(), error = %e, "intake failed to start"),
            }
        }
        started
    }

    /// Stops every intake in reverse start order.
    pub async fn stop_all(&self) {
        for intake in self.intakes.iter().rev() {
            intake.stop().await;
            info!(intake = intake.name(), "intake stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::service::{domain::GuessCounter, Microservice};

    struct FakeIntake {
        name: &'static str,
        fail: bool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl FakeIntake {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Intake for FakeIntake {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cannot start");
            }
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn failing_intake_is_skipped() {
        let good = FakeIntake::new("good", false);
        let bad = FakeIntake::new("bad", true);
        let manager = IntakeManager::new()
            .with(bad.clone())
            .with(good.clone());

        assert_eq!(manager.start_all().await, 1);
        manager.stop_all().await;
        assert_eq!(good.stops.load(Ordering::SeqCst), 1);
        assert_eq!(bad.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_config_builds_enabled_intakes() {
        let dispatcher = Arc::new(Dispatcher::new());
        let config = WrapperConfig {
            host_with_http: true,
            host_with_broker: true,
            ..WrapperConfig::default()
        };
        // Broker hosting without a broker only yields the HTTP intake.
        assert_eq!(IntakeManager::from_config(&config, &dispatcher, None).len(), 1);

        let broker: Arc<dyn Broker> = Arc::new(crate::broker::MemoryBroker::new());
        assert_eq!(
            IntakeManager::from_config(&config, &dispatcher, Some(broker)).len(),
            2
        );
    }

    #[tokio::test]
    async fn receive_classifies_paths() {
        let dispatcher = Dispatcher::new();
        let counter = GuessCounter::default();
        dispatcher
            .register_service(counter.id(), counter.operations())
            .unwrap();

        let ok = receive(&dispatcher, "/guess-counter/get-count", HashMap::new())
            .await
            .unwrap();
        assert_eq!(ok.to_value(), json!({"count": 0}));

        assert_eq!(
            receive(&dispatcher, "/guess-counter", HashMap::new()).await,
            Err(StatusCode::BadUpstreamUrl)
        );
        assert_eq!(
            receive(&dispatcher, "/nobody/get-count", HashMap::new()).await,
            Err(StatusCode::UnknownService)
        );
        assert_eq!(
            receive(&dispatcher, "/guess-counter/reset", HashMap::new()).await,
            Err(StatusCode::UnknownRoute)
        );
    }
}
