//! Courier Core: status taxonomy, envelopes, parameter binding, and broker
//! wire messages shared by the service host and the gateway.

pub mod bind;
pub mod envelope;
pub mod manifest;
pub mod status;
pub mod wire;

pub use bind::{Bind, BindError, Params};
pub use envelope::{OperationId, RequestEnvelope, ResponseEnvelope, CORRELATION_FIELD, ERROR_FIELD};
pub use manifest::{ServiceManifest, GET_IDS_PATH, SELF_SERVICE_ID};
pub use status::StatusCode;
pub use wire::{BrokerFields, DecodeError, Reply};
