//! Error taxonomy shared by the gateway, the dispatcher and backend services.
//!
//! One enum travels through every layer. It converts to a [`tonic::Status`]
//! at the RPC boundary (and back again on the calling side) and to an HTTP
//! response at the public boundary.

use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};
use tracing::error;

/// Metadata entry that carries the precise error kind next to a status code.
///
/// Several variants share `Code::Unauthenticated`; the kind lets the calling
/// side rebuild the exact variant.
pub const ERROR_KIND_METADATA_KEY: &str = "x-gateway-error";

/// Message returned to public clients for every authentication failure.
pub const NOT_AUTHORIZED: &str = "Not authorized";

/// Why a signed assertion was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFault {
    /// `now` is past the assertion's expiry.
    Expired,
    /// Signature did not verify against the shared secret.
    BadSignature,
    /// Not a well-formed assertion.
    Malformed,
}

impl TokenFault {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad-signature",
            Self::Malformed => "malformed",
        }
    }
}

impl fmt::Display for TokenFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "token has expired"),
            Self::BadSignature => write!(f, "signature does not verify"),
            Self::Malformed => write!(f, "token is malformed"),
        }
    }
}

/// Errors produced by the session core, the dispatcher and the guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Login/password pair was rejected.
    Authentication,
    /// Signed assertion failed validation.
    InvalidToken(TokenFault),
    /// Signed assertion was empty.
    EmptyToken,
    /// Unknown opaque handle or missing record.
    NotFound(String),
    /// Caller lacks the identity or role an operation requires.
    PermissionDenied(String),
    /// No healthy instance, dial failure, rate limit, or exhausted retries.
    Transport(String),
    /// Malformed business input.
    Validation(String),
    /// Assertion could not be signed (configuration problem).
    Signing(String),
    /// The inbound request was cancelled or ran out of time.
    Cancelled(String),
    /// Session store failure.
    Database(String),
    /// Anything else.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "Invalid login or password"),
            Self::InvalidToken(fault) => write!(f, "Invalid token: {}", fault),
            Self::EmptyToken => write!(f, "Empty token"),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Validation(msg) => write!(f, "Validation error: {}", msg),
            Self::Signing(msg) => write!(f, "Signing error: {}", msg),
            Self::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<surrealdb::Error> for GatewayError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl GatewayError {
    /// Only transport-class failures are worth another attempt on a
    /// different instance. Everything else is an answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether the public boundary must answer with a generic 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::InvalidToken(_) | Self::EmptyToken
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::InvalidToken(fault) => fault.as_str(),
            Self::EmptyToken => "empty-token",
            Self::NotFound(_) => "not-found",
            Self::PermissionDenied(_) => "permission-denied",
            Self::Transport(_) => "transport",
            Self::Validation(_) => "validation",
            Self::Signing(_) => "signing",
            Self::Cancelled(_) => "cancelled",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert this error to an RPC status for the wire.
    pub fn to_status(&self) -> Status {
        let mut status = match self {
            Self::Authentication | Self::InvalidToken(_) | Self::EmptyToken => {
                Status::unauthenticated(self.to_string())
            }
            Self::NotFound(what) => Status::not_found(what.clone()),
            Self::PermissionDenied(msg) => Status::permission_denied(msg.clone()),
            Self::Transport(msg) => Status::unavailable(msg.clone()),
            Self::Validation(msg) => Status::invalid_argument(msg.clone()),
            Self::Cancelled(msg) => Status::cancelled(msg.clone()),
            Self::Signing(msg) | Self::Database(msg) | Self::Internal(msg) => {
                Status::internal(msg.clone())
            }
        };
        status
            .metadata_mut()
            .insert(ERROR_KIND_METADATA_KEY, MetadataValue::from_static(self.kind()));
        status
    }

    /// Rebuild an error from a status returned by a backend or by the
    /// transport itself.
    pub fn from_status(status: &Status) -> Self {
        let kind = status
            .metadata()
            .get(ERROR_KIND_METADATA_KEY)
            .and_then(|v| v.to_str().ok());
        let msg = status.message().to_string();

        match status.code() {
            Code::Unauthenticated => match kind {
                Some("authentication") => Self::Authentication,
                Some("empty-token") => Self::EmptyToken,
                Some("expired") => Self::InvalidToken(TokenFault::Expired),
                Some("bad-signature") => Self::InvalidToken(TokenFault::BadSignature),
                _ => Self::InvalidToken(TokenFault::Malformed),
            },
            Code::NotFound => Self::NotFound(msg),
            Code::PermissionDenied => Self::PermissionDenied(msg),
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                Self::Validation(msg)
            }
            Code::Unavailable
            | Code::Unknown
            | Code::ResourceExhausted
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::Cancelled => Self::Transport(format!("{:?}: {}", status.code(), msg)),
            _ => match kind {
                Some("database") => Self::Database(msg),
                Some("signing") => Self::Signing(msg),
                _ => Self::Internal(msg),
            },
        }
    }

    /// HTTP status for the public boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication | Self::InvalidToken(_) | Self::EmptyToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Signing(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self::from_status(&status)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let message = match &self {
            e if e.is_unauthorized() => NOT_AUTHORIZED.to_string(),
            Self::Signing(_) | Self::Database(_) | Self::Internal(_) => {
                error!(error = %self, "Request failed with internal error");
                "Internal error".to_string()
            }
            other => other.to_string(),
        };
        (code, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_variant() {
        let errors = vec![
            GatewayError::Authentication,
            GatewayError::EmptyToken,
            GatewayError::InvalidToken(TokenFault::Expired),
            GatewayError::InvalidToken(TokenFault::BadSignature),
            GatewayError::InvalidToken(TokenFault::Malformed),
            GatewayError::NotFound("ticket 7".to_string()),
            GatewayError::PermissionDenied("requires ADMIN role".to_string()),
            GatewayError::Validation("bad status".to_string()),
            GatewayError::Database("connection reset".to_string()),
        ];

        for err in errors {
            assert_eq!(GatewayError::from_status(&err.to_status()), err);
        }
    }

    #[test]
    fn test_transport_codes_are_retryable() {
        for status in [
            Status::unavailable("connection refused"),
            Status::unknown("h2 protocol error"),
            Status::deadline_exceeded("timeout"),
            Status::resource_exhausted("slow down"),
        ] {
            assert!(GatewayError::from_status(&status).is_retryable());
        }
    }

    #[test]
    fn test_business_errors_are_not_retryable() {
        assert!(!GatewayError::PermissionDenied("no".into()).is_retryable());
        assert!(!GatewayError::NotFound("x".into()).is_retryable());
        assert!(!GatewayError::Validation("x".into()).is_retryable());
        assert!(!GatewayError::Authentication.is_retryable());
        assert!(!GatewayError::Internal("x".into()).is_retryable());
    }

    #[test]
    fn test_status_without_kind_defaults_sensibly() {
        let err = GatewayError::from_status(&Status::unauthenticated("whatever"));
        assert_eq!(err, GatewayError::InvalidToken(TokenFault::Malformed));

        let err = GatewayError::from_status(&Status::internal("boom"));
        assert_eq!(err, GatewayError::Internal("boom".to_string()));
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(GatewayError::Authentication.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::InvalidToken(TokenFault::Expired).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::PermissionDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(GatewayError::Transport("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::Cancelled("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            GatewayError::InvalidToken(TokenFault::Expired).to_string(),
            "Invalid token: token has expired"
        );
        assert_eq!(GatewayError::EmptyToken.to_string(), "Empty token");
    }
}
