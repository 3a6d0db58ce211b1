//! Operation registry and dispatcher.
//!
//! The table is an immutable snapshot behind `ArcSwap`. Readers load the
//! current snapshot without locking; writers (service start/stop) build a
//! modified copy under a mutex and swap it in, so a reader never observes a
//! partially-updated table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use courier_core::{OperationId, RequestEnvelope, ResponseEnvelope, StatusCode};
use parking_lot::Mutex;
use tracing::{info, info_span, warn, Instrument};

use super::operation::{Handler, OperationTable};

type ServiceOps = HashMap<&'static str, Arc<dyn Handler>>;
type Table = HashMap<String, ServiceOps>;

/// Registration failures. The table is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("operation {0} is already registered")]
    DuplicateOperation(OperationId),
    #[error("service {0} is already registered")]
    DuplicateService(String),
}

/// Maps operation identifiers to handlers and executes requests against them.
pub struct Dispatcher {
    table: ArcSwap<Table>,
    write_lock: Mutex<()>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Adds one operation to a service.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateOperation` if the identifier is taken;
    /// the existing binding stays active.
    pub fn register(
        &self,
        service_id: &str,
        path: &'static str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        let current = self.table.load();
        if current
            .get(service_id)
            .is_some_and(|ops| ops.contains_key(path))
        {
            let id = OperationId::new(service_id, path);
            warn!(operation = %id, "duplicate operation registration rejected");
            return Err(RegistryError::DuplicateOperation(id));
        }

        let mut next = Table::clone(&current);
        next.entry(service_id.to_string())
            .or_default()
            .insert(path, handler);
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// Adds every operation of a service at once.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateService` if the service already has
    /// operations here, or `DuplicateOperation` if the table itself repeats a
    /// path. Nothing is registered on error.
    pub fn register_service(
        &self,
        service_id: &str,
        operations: OperationTable,
    ) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        let current = self.table.load();
        if current.contains_key(service_id) {
            warn!(service = service_id, "duplicate service registration rejected");
            return Err(RegistryError::DuplicateService(service_id.to_string()));
        }

        let mut ops = ServiceOps::new();
        for (path, handler) in operations.into_entries() {
            if ops.insert(path, handler).is_some() {
                let id = OperationId::new(service_id, path);
                warn!(operation = %id, "duplicate operation registration rejected");
                return Err(RegistryError::DuplicateOperation(id));
            }
        }

        let count = ops.len();
        let mut next = Table::clone(&current);
        next.insert(service_id.to_string(), ops);
        self.table.store(Arc::new(next));
        info!(service = service_id, operations = count, "service registered");
        Ok(())
    }

    /// Removes every operation owned by a service. Returns how many were
    /// removed.
    pub fn unregister(&self, service_id: &str) -> usize {
        let _guard = self.write_lock.lock();
        let current = self.table.load();
        if !current.contains_key(service_id) {
            return 0;
        }
        let mut next = Table::clone(&current);
        let removed = next.remove(service_id).map_or(0, |ops| ops.len());
        self.table.store(Arc::new(next));
        info!(service = service_id, operations = removed, "service unregistered");
        removed
    }

    #[must_use]
    pub fn hosts_service(&self, service_id: &str) -> bool {
        self.table.load().contains_key(service_id)
    }

    /// Sorted IDs of every service with at least one operation.
    #[must_use]
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves an identifier to its handler.
    ///
    /// # Errors
    ///
    /// `UnknownService` if no operation of the service is registered,
    /// `UnknownRoute` if the service is known but the path is not.
    pub fn resolve(&self, id: &OperationId) -> Result<Arc<dyn Handler>, StatusCode> {
        let table = self.table.load();
        let ops = table
            .get(id.service_id())
            .ok_or(StatusCode::UnknownService)?;
        ops.get(id.operation_path())
            .cloned()
            .ok_or(StatusCode::UnknownRoute)
    }

    /// Binds and executes a request.
    ///
    /// The response echoes the request's correlation ID.
    ///
    /// # Errors
    ///
    /// Returns the Status Code classifying the failure: unresolved
    /// identifiers, binding failures (`MalformedRequest`), or handler
    /// failures (`InternalError` unless the handler chose a status).
    pub async fn dispatch(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, StatusCode> {
        let span = info_span!(
            "dispatch",
            service = request.operation.service_id(),
            operation = request.operation.operation_path(),
            correlation_id = request.correlation_id.as_deref().unwrap_or(""),
            duration_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = match self.resolve(&request.operation) {
                Ok(handler) => handler
                    .call(&request.params)
                    .await
                    .map(|content| request.reply(content)),
                Err(status) => Err(status),
            };

            let status = match &result {
                Ok(_) => StatusCode::Ok,
                Err(status) => *status,
            };
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("status", status.as_str());

            metrics::counter!("courier_dispatch_total", "status" => status.as_str()).increment(1);
            #[allow(clippy::cast_precision_loss)]
            let duration = duration_ms as f64;
            metrics::histogram!("courier_dispatch_duration_ms").record(duration);

            result
        }
        .instrument(span)
        .await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.service_ids())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
