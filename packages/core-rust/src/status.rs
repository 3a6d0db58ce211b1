//! Status Code taxonomy shared by the HTTP and broker transports.
//!
//! Every variant maps to exactly one integer. The integer is used both as the
//! HTTP status on the HTTP surface and as the `error` field of a broker error
//! reply, so the two transports speak the same vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome classification for a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    Ok,
    /// Parameters failed the operation's binding rule, or the request lacked
    /// required routing fields.
    MalformedRequest,
    /// The configured API key was missing or wrong.
    Unauthorized,
    /// The service is known but the operation path is not.
    UnknownRoute,
    /// No operation of the named service is registered here.
    UnknownService,
    /// The handler failed, or the upstream replied with something unusable.
    InternalError,
    /// The request path is not of the form `/{serviceID}/{operationPath}`.
    BadUpstreamUrl,
}

impl StatusCode {
    pub const ALL: [StatusCode; 7] = [
        StatusCode::Ok,
        StatusCode::MalformedRequest,
        StatusCode::Unauthorized,
        StatusCode::UnknownRoute,
        StatusCode::UnknownService,
        StatusCode::InternalError,
        StatusCode::BadUpstreamUrl,
    ];

    /// The integer carried on the wire (HTTP status and broker `error` field).
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::MalformedRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::UnknownRoute => 404,
            StatusCode::BadUpstreamUrl => 421,
            StatusCode::InternalError => 500,
            StatusCode::UnknownService => 503,
        }
    }

    /// Reverse of [`code`](Self::code). Returns `None` for integers outside
    /// the taxonomy.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// Classifies an integer, folding anything outside the taxonomy into
    /// `InternalError`.
    #[must_use]
    pub fn classify(code: u16) -> Self {
        Self::from_code(code).unwrap_or(StatusCode::InternalError)
    }

    /// Whether another instance might succeed where this one failed.
    ///
    /// Retriable failures are requeued on the broker; the rest are the
    /// caller's fault and are acknowledged.
    #[must_use]
    pub fn is_retriable(self) -> bool {
        matches!(self, StatusCode::UnknownService | StatusCode::InternalError)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::MalformedRequest => "malformed-request",
            StatusCode::Unauthorized => "unauthorized",
            StatusCode::UnknownRoute => "unknown-route",
            StatusCode::UnknownService => "unknown-service",
            StatusCode::InternalError => "internal-error",
            StatusCode::BadUpstreamUrl => "bad-upstream-url",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
