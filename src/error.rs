//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`ProxyError`]: the failure taxonomy of the relay core (backend link, codec,
//!   capacity, protocol). Each variant maps to a different recovery policy in the
//!   session state machine.
//! - [`AppError`]: failures on the HTTP launcher surface, converted into JSON
//!   error responses through actix's `ResponseError`.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures raised inside the relay core.
///
/// ## Propagation:
/// - `Codec` and `Protocol` are absorbed where they happen (message dropped, logged)
/// - `LinkClosed` and `Connect` drive the session into `Reconnecting` / `Failed`
/// - `Capacity` rejects a single connection or message, never other sessions
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Backend unreachable, handshake rejected, TLS failure or connect timeout.
    #[error("backend connect failed: {0}")]
    Connect(String),

    /// A send was attempted on a backend link that is not connected.
    #[error("backend link is closed")]
    LinkClosed,

    /// The codec rejected a frame (malformed packet, wrong frame size).
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session or message-size limit reached.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Malformed control message from either peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error reported by an encoder or decoder instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),

    #[error("invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors returned by the HTTP launcher handlers.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "index.html not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    NotFound(String),
    /// The local proxy could not be reached from the launcher.
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_codec_error_converts_into_proxy_error() {
        let err: ProxyError = CodecError::InvalidFrameSize { expected: 960, actual: 12 }.into();
        assert!(matches!(err, ProxyError::Codec(_)));
        assert!(err.to_string().contains("960"));
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::NotFound("page".into()).error_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Unavailable("proxy".into()).error_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
