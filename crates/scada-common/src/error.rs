//! ---
//! scada_section: "01-core-functionality"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared primitives for the SCADA master and RTU runtimes."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Error classification shared by every externally visible failure.
///
/// The kind decides the HTTP status on the REST surface and whether the
/// failure carries side effects (audit entries, security events, counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad credentials or a missing/expired token.
    AuthFailure,
    /// Valid token, insufficient role.
    PermissionDenied,
    /// Malformed input, unknown field, out-of-range value.
    Validation,
    /// State conflict: alarm already cleared, SBO already armed, duplicate operate.
    Conflict,
    /// Target RTU offline or its control channel is down.
    Unavailable,
    /// The RTU did not reply within the command deadline.
    Timeout,
    /// Unexpected internal failure, logged with a correlation id.
    Internal,
}

impl ErrorKind {
    /// HTTP status code mandated for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::AuthFailure => 401,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

/// Error carried from the service layer to the external surfaces.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    /// Classification used for status mapping and side effects.
    pub kind: ErrorKind,
    /// Human readable message surfaced verbatim in the error envelope.
    pub message: String,
    /// Optional structured context included in the envelope.
    pub details: Option<JsonValue>,
}

impl ServiceError {
    /// Construct an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details rendered in the envelope.
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for a `Validation` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Shorthand for a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Shorthand for an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Render the wire envelope `{"error":{"kind","message","details"}}`.
    pub fn envelope(&self) -> JsonValue {
        serde_json::json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
                "details": self.details.clone().unwrap_or(JsonValue::Object(Default::default())),
            }
        })
    }
}
