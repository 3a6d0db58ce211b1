//! Request and response envelopes, and the operation identifier they address.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bind::Params;
use crate::status::StatusCode;

/// Reserved field carrying the correlation ID, in both parameters and replies.
pub const CORRELATION_FIELD: &str = "uuid";

/// Field carrying the Status Code integer in a broker error reply.
pub const ERROR_FIELD: &str = "error";

/// Returns the correlation ID if it is present and not blank.
fn non_blank(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

/// Address of an operation: `{serviceID}/{operationPath}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId {
    service_id: String,
    operation_path: String,
}

impl OperationId {
    pub fn new(service_id: impl Into<String>, operation_path: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            operation_path: operation_path.into(),
        }
    }

    /// Parses a URL path of the form `/{serviceID}/{operationPath}`.
    ///
    /// # Errors
    ///
    /// Returns `StatusCode::BadUpstreamUrl` unless the path has exactly two
    /// non-empty segments.
    pub fn from_path(path: &str) -> Result<Self, StatusCode> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut segments = trimmed.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(service), Some(operation), None)
                if !service.is_empty() && !operation.is_empty() =>
            {
                Ok(Self::new(service, operation))
            }
            _ => Err(StatusCode::BadUpstreamUrl),
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    #[must_use]
    pub fn operation_path(&self) -> &str {
        &self.operation_path
    }

    /// Renders the identifier as an absolute URL path.
    #[must_use]
    pub fn to_path(&self) -> String {
        format!("/{}/{}", self.service_id, self.operation_path)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.operation_path)
    }
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// An inbound request after transport decoding and before binding.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub operation: OperationId,
    pub params: Params,
    pub correlation_id: Option<String>,
}

impl RequestEnvelope {
    /// Builds an envelope from a raw parameter map.
    ///
    /// The correlation ID is pulled out of the map under
    /// [`CORRELATION_FIELD`] so that operation binding never sees it.
    #[must_use]
    pub fn new(operation: OperationId, mut params: HashMap<String, String>) -> Self {
        let correlation_id = non_blank(params.remove(CORRELATION_FIELD));
        Self {
            operation,
            params: Params::from(params),
            correlation_id,
        }
    }

    /// Wraps a reply content value so it echoes this request's correlation ID.
    #[must_use]
    pub fn reply(&self, content: Map<String, Value>) -> ResponseEnvelope {
        ResponseEnvelope::new(content, self.correlation_id.clone())
    }
}

// ---------------------------------------------------------------------------
// ResponseEnvelope
// ---------------------------------------------------------------------------

/// A successful reply: JSON content plus the echoed correlation ID.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub content: Map<String, Value>,
    pub correlation_id: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn new(content: Map<String, Value>, correlation_id: Option<String>) -> Self {
        Self {
            content,
            correlation_id: non_blank(correlation_id),
        }
    }

    /// An empty reply object.
    #[must_use]
    pub fn empty(correlation_id: Option<String>) -> Self {
        Self::new(Map::new(), correlation_id)
    }

    /// Serialized form: the content with the correlation ID injected under
    /// [`CORRELATION_FIELD`] unless the content already carries that field.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = self.content.clone();
        if let Some(id) = &self.correlation_id {
            object
                .entry(CORRELATION_FIELD)
                .or_insert_with(|| Value::String(id.clone()));
        }
        Value::Object(object)
    }

    #[must_use]
    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }

    #[must_use]
    pub fn to_json_bytes(&self) -> Vec<u8> {
        self.to_json_string().into_bytes()
    }
}

/// Structured error reply published on the broker: `{"uuid": .., "error": code}`.
#[must_use]
pub fn error_reply(correlation_id: &str, status: StatusCode) -> Value {
    let mut object = Map::new();
    object.insert(
        CORRELATION_FIELD.to_string(),
        Value::String(correlation_id.to_string()),
    );
    object.insert(ERROR_FIELD.to_string(), Value::from(status.code()));
    Value::Object(object)
}
