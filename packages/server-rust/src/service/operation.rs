//! Operation trait and the type-erased handler table built from it.
//!
//! A microservice declares its operations as values implementing
//! [`Operation`]. Each one is wrapped in an [`OperationHandler`] and stored
//! behind `Arc<dyn Handler>` so the dispatcher can hold heterogeneous
//! operations in one map, keyed by path at registration time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Bind, Params, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// JSON object produced by a successful operation.
pub type Content = Map<String, Value>;

/// Future returned by a type-erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Content, StatusCode>> + Send>>;

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Errors returned by operation handlers.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The handler rejected the request with a specific status, e.g. a
    /// well-formed request naming something that does not exist.
    #[error("rejected with {0}")]
    Rejected(StatusCode),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            OperationError::Rejected(status) => *status,
            OperationError::Internal(_) => StatusCode::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation trait
// ---------------------------------------------------------------------------

/// A named, parameter-bound unit of backend functionality.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Typed request produced by the binding rule.
    type Request: Bind + Send + 'static;

    /// Operation path, unique within the owning service.
    fn path(&self) -> &'static str;

    /// Executes a bound request.
    async fn handle(&self, request: Self::Request) -> Result<Content, OperationError>;
}

// ---------------------------------------------------------------------------
// Handler (type-erased adapter)
// ---------------------------------------------------------------------------

/// Object-safe form of an operation: binds then executes.
pub trait Handler: Send + Sync {
    fn call(&self, params: &Params) -> HandlerFuture;
}

/// Wrapper to type-erase a concrete [`Operation`] into a [`Handler`].
pub struct OperationHandler<O>(Arc<O>);

impl<O: Operation> Handler for OperationHandler<O> {
    fn call(&self, params: &Params) -> HandlerFuture {
        let request = match O::Request::bind(params) {
            Ok(request) => request,
            Err(e) => {
                debug!(operation = self.0.path(), error = %e, "binding failed");
                return Box::pin(std::future::ready(Err(StatusCode::MalformedRequest)));
            }
        };

        let op = Arc::clone(&self.0);
        Box::pin(async move {
            op.handle(request).await.map_err(|e| {
                let status = e.status();
                if status == StatusCode::InternalError {
                    warn!(operation = op.path(), error = %e, "operation failed");
                } else {
                    debug!(operation = op.path(), %status, "operation rejected request");
                }
                status
            })
        })
    }
}

// ---------------------------------------------------------------------------
// OperationTable
// ---------------------------------------------------------------------------

/// The operations one microservice exposes, in declaration order.
#[derive(Default, Clone)]
pub struct OperationTable {
    entries: Vec<(&'static str, Arc<dyn Handler>)>,
}

impl OperationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation, builder style.
    #[must_use]
    pub fn with<O: Operation>(mut self, operation: O) -> Self {
        self.add(operation);
        self
    }

    pub fn add<O: Operation>(&mut self, operation: O) {
        let path = operation.path();
        self.entries
            .push((path, Arc::new(OperationHandler(Arc::new(operation)))));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(path, _)| *path)
    }

    pub(crate) fn into_entries(self) -> Vec<(&'static str, Arc<dyn Handler>)> {
        self.entries
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.paths()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
