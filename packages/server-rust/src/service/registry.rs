use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::dispatcher::{Dispatcher, RegistryError};
use super::operation::OperationTable;
use super::self_service::SelfService;
use crate::intake::IntakeManager;

// ---------------------------------------------------------------------------
// Microservice trait
// ---------------------------------------------------------------------------

/// A deployable unit of backend functionality.
///
/// The operation table is registered as a whole when the service is run,
/// and removed as a whole when it is stopped.
#[async_trait]
pub trait Microservice: Send + Sync + 'static {
    /// Service ID, the first segment of every operation identifier it owns.
    fn id(&self) -> &str;

    /// The operations this service exposes.
    fn operations(&self) -> OperationTable;

    /// Releases resources after the service's operations were unregistered.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServiceHost
// ---------------------------------------------------------------------------

/// Runs microservices behind a set of intakes.
///
/// Services are stopped in reverse registration order. The built-in
/// self-service is run on construction so every host answers the discovery
/// probe.
pub struct ServiceHost {
    dispatcher: Arc<Dispatcher>,
    services: RwLock<Vec<Arc<dyn Microservice>>>,
    intakes: IntakeManager,
}

impl ServiceHost {
    /// Creates a host over `dispatcher` and runs the self-service.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateService` if the dispatcher already
    /// hosts a self-service.
    pub fn new(dispatcher: Arc<Dispatcher>, intakes: IntakeManager) -> Result<Self, RegistryError> {
        let host = Self {
            services: RwLock::new(Vec::new()),
            intakes,
            dispatcher,
        };
        host.run(Arc::new(SelfService::new(&host.dispatcher)))?;
        Ok(host)
    }

    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Starts every configured intake.
    ///
    /// # Errors
    ///
    /// Returns an error if intakes were configured and none of them started.
    pub async fn start(&self) -> anyhow::Result<()> {
        let started = self.intakes.start_all().await;
        if started == 0 && !self.intakes.is_empty() {
            anyhow::bail!("no intake could be started");
        }
        if self.intakes.is_empty() {
            warn!("service host has no intakes; services are unreachable");
        }
        Ok(())
    }

    /// Registers a service's whole operation table.
    ///
    /// # Errors
    ///
    /// Returns a `RegistryError` if the service ID is already running or the
    /// table repeats an operation path. Nothing is registered on error.
    pub fn run(&self, service: Arc<dyn Microservice>) -> Result<(), RegistryError> {
        let mut services = self.services.write();
        let id = service.id().to_string();
        if services.iter().any(|s| s.id() == id) {
            warn!(service = %id, "service already running");
            return Err(RegistryError::DuplicateService(id));
        }
        self.dispatcher
            .register_service(&id, service.operations())?;
        services.push(service);
        info!(service = %id, "service running");
        Ok(())
    }

    /// Returns a running service by ID.
    #[must_use]
    pub fn running(&self, id: &str) -> Option<Arc<dyn Microservice>> {
        self.services.read().iter().find(|s| s.id() == id).cloned()
    }

    /// IDs of running services in registration order.
    #[must_use]
    pub fn running_ids(&self) -> Vec<String> {
        self.services
            .read()
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Unregisters a service and shuts it down. Returns `false` if it was not
    /// running.
    ///
    /// # Errors
    ///
    /// Returns the service's own shutdown error. Its operations are already
    /// unregistered by then.
    pub async fn stop(&self, id: &str) -> anyhow::Result<bool> {
        let service = {
            let mut services = self.services.write();
            let Some(index) = services.iter().position(|s| s.id() == id) else {
                return Ok(false);
            };
            services.remove(index)
        };
        self.dispatcher.unregister(id);
        service.shutdown().await?;
        info!(service = id, "service stopped");
        Ok(true)
    }

    /// Stops every intake, then every service in reverse registration order.
    ///
    /// Every service is stopped even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first service shutdown error.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.intakes.stop_all().await;

        let services: Vec<_> = std::mem::take(&mut *self.services.write());
        let mut first_error = None;
        for service in services.into_iter().rev() {
            self.dispatcher.unregister(service.id());
            if let Err(e) = service.shutdown().await {
                warn!(service = service.id(), error = %e, "service shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        info!("service host shut down");
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
