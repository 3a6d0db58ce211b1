//! Operation registry, dispatch, and microservice lifecycle.
//!
//! 1. **Operations** (`operation`): typed `Operation` impls erased into handlers
//! 2. **Dispatch** (`dispatcher`): copy-on-write identifier to handler table
//! 3. **Lifecycle** (`registry`): `Microservice` trait and the `ServiceHost`
//! 4. **Self-service** (`self_service`): the `service-wrapper/get-ids` probe
//! 5. **Domain services** (`domain`): hosted example services
//! 6. **Background workers** (`worker`): periodic tasks (discovery)

pub mod dispatcher;
pub mod domain;
pub mod operation;
pub mod registry;
pub mod self_service;
pub mod worker;

pub use dispatcher::{Dispatcher, RegistryError};
pub use operation::{Content, Handler, Operation, OperationError, OperationTable};
pub use registry::{Microservice, ServiceHost};
pub use self_service::SelfService;
pub use worker::{BackgroundRunnable, BackgroundWorker};
