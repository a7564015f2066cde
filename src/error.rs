use serde::Serialize;
use thiserror::Error;

use crate::http::Response;
use crate::validation::ValidationError;

/// Standard error type for the Felis engine.
///
/// Every variant maps to an HTTP status and a machine-readable code;
/// handlers and middleware can return `Err(Error::...)` and the chain
/// boundary converts it into a compact JSON response.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path matched but the method did not. Carries the `Allow` value.
    #[error("Method not allowed")]
    MethodNotAllowed { allow: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Request header fields too large")]
    HeadersTooLarge,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation failed")]
    Validation(#[from] ValidationError),

    /// The peer stopped sending mid-request; maps to 408.
    #[error("Request read timed out: {0}")]
    RequestTimeout(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A backing service (cache level, task backend) is down.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::MethodNotAllowed { .. } => 405,
            Error::BadRequest(_) => 400,
            Error::PayloadTooLarge(_) => 413,
            Error::HeadersTooLarge => 431,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::Validation(_) => 422,
            Error::RequestTimeout(_) => 408,
            Error::Timeout(_) => 504,
            Error::Internal(_) => 500,
            Error::Unavailable(_) => 503,
            // Client-went-away; the connection is closed after this.
            Error::Cancelled(_) => 499,
            Error::Io(_) => 500,
        }
    }

    /// Machine-readable error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Error::HeadersTooLarge => "HEADERS_TOO_LARGE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::RequestTimeout(_) => "REQUEST_TIMEOUT",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Cancelled(_) => "CANCELLED",
            Error::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert into the default JSON error response.
    ///
    /// Internal details (sources, I/O messages) are never exposed; only
    /// the code and, for client errors, the public detail string.
    pub fn into_response(self) -> Response {
        let detail = match &self {
            Error::Internal(_) | Error::Io(_) => None,
            Error::Validation(_) => None,
            Error::MethodNotAllowed { .. } => None,
            other => Some(other.to_string()),
        };
        let fields = match &self {
            Error::Validation(v) => Some(
                v.errors
                    .iter()
                    .map(|e| FieldDetail {
                        field: e.field.clone(),
                        reason: e.reason.clone(),
                    })
                    .collect(),
            ),
            _ => None,
        };
        let body = ErrorBody {
            error: self.error_code(),
            detail,
            fields,
        };

        let mut resp = Response::json_value(self.status_code(), &body);
        if let Error::MethodNotAllowed { allow } = &self {
            resp = resp.header("allow", allow.clone());
        }
        if matches!(self, Error::Cancelled(_)) {
            // The peer is gone; the connection closes after this.
            resp = resp.header("connection", "close");
        }
        resp
    }
}

/// JSON payload of a default error response: `{"error", "detail"?, "fields"?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldDetail>>,
}

#[derive(Debug, Serialize)]
pub struct FieldDetail {
    pub field: String,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, Error>;
