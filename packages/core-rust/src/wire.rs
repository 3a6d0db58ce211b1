//! Broker message encoding.
//!
//! A request is a flat JSON object: the correlation ID under `uuid`, the
//! routing fields under configurable names, and the operation parameters as
//! the remaining fields. A reply is a flat JSON object carrying `uuid` and
//! either content fields or an integer `error`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bind::Params;
use crate::envelope::{OperationId, RequestEnvelope, CORRELATION_FIELD, ERROR_FIELD};
use crate::status::StatusCode;

/// Names of the routing fields in a broker request.
///
/// Configurable so they cannot collide with operation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerFields {
    pub service_id_field: String,
    pub request_path_field: String,
}

impl Default for BrokerFields {
    fn default() -> Self {
        Self {
            service_id_field: "microservice_id".to_string(),
            request_path_field: "request_path".to_string(),
        }
    }
}

/// Reasons an inbound broker request cannot be turned into an envelope.
///
/// Every variant is terminal: the message is acknowledged and dropped, since
/// no other consumer could do better with it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object")]
    NotJson,
    #[error("payload has no correlation id")]
    MissingCorrelation,
    #[error("payload {correlation_id} lacks service or operation field")]
    MissingRoute { correlation_id: String },
}

/// Builds a broker request payload.
#[must_use]
pub fn encode_request(
    fields: &BrokerFields,
    correlation_id: &str,
    operation: &OperationId,
    params: &Params,
) -> Vec<u8> {
    let mut object = Map::with_capacity(params.len() + 3);
    for (name, value) in params {
        object.insert(name.clone(), Value::String(value.clone()));
    }
    // Routing fields win over any colliding parameter.
    object.insert(
        CORRELATION_FIELD.to_string(),
        Value::String(correlation_id.to_string()),
    );
    object.insert(
        fields.service_id_field.clone(),
        Value::String(operation.service_id().to_string()),
    );
    object.insert(
        fields.request_path_field.clone(),
        Value::String(operation.operation_path().to_string()),
    );
    Value::Object(object).to_string().into_bytes()
}

/// Decodes a broker request payload into a request envelope.
///
/// Scalar non-string parameters are kept as their JSON text; arrays, objects
/// and nulls are dropped.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the payload is not a JSON object, has no
/// non-blank string correlation ID, or lacks either routing field.
pub fn decode_request(fields: &BrokerFields, payload: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(payload) else {
        return Err(DecodeError::NotJson);
    };

    let correlation_id = match object.remove(CORRELATION_FIELD) {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        _ => return Err(DecodeError::MissingCorrelation),
    };

    let service = take_string(&mut object, &fields.service_id_field);
    let path = take_string(&mut object, &fields.request_path_field);
    let (Some(service), Some(path)) = (service, path) else {
        return Err(DecodeError::MissingRoute { correlation_id });
    };

    let mut params: HashMap<String, String> = object
        .into_iter()
        .filter_map(|(name, value)| scalar_text(value).map(|text| (name, text)))
        .collect();
    params.insert(CORRELATION_FIELD.to_string(), correlation_id);

    Ok(RequestEnvelope::new(OperationId::new(service, path), params))
}

fn take_string(object: &mut Map<String, Value>, field: &str) -> Option<String> {
    match object.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A decoded broker reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub correlation_id: String,
    /// The full reply object, `uuid` included.
    pub body: Map<String, Value>,
}

impl Reply {
    /// The failure carried by an error reply, if this is one.
    ///
    /// Only an integer `error` field marks an error reply; anything else under
    /// that name is ordinary content.
    #[must_use]
    pub fn error_status(&self) -> Option<StatusCode> {
        self.body
            .get(ERROR_FIELD)
            .and_then(Value::as_u64)
            .map(|code| u16::try_from(code).map_or(StatusCode::InternalError, StatusCode::classify))
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Decodes a reply from the responses queue. Returns `None` for anything
/// that is not a JSON object with a string `uuid`.
#[must_use]
pub fn decode_reply(payload: &[u8]) -> Option<Reply> {
    let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(payload) else {
        return None;
    };
    let correlation_id = body.get(CORRELATION_FIELD)?.as_str()?.to_string();
    Some(Reply {
        correlation_id,
        body,
    })
}
