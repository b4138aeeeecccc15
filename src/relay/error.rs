//! Relay error types
//!
//! Two tiers: [`RelayError`] is a protocol-level failure reported back to the
//! offending client as an `error` envelope; [`SendError`] is a transport-level
//! failure of a peer's outbound queue and is never retried.

use thiserror::Error;

use super::protocol::{ErrorCode, ServerMessage};

/// Protocol-level errors produced by hub handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed envelope or invalid parameters
    #[error("{0}")]
    BadRequest(String),

    /// Non-auth message from an unauthenticated client
    #[error("Authentication required")]
    AuthRequired,

    /// Token rejected by the validator
    #[error("{0}")]
    AuthFailed(String),

    /// Caller's role or session does not allow the operation
    #[error("{0}")]
    PermissionDenied(String),

    /// Selected provider is not in the directory
    #[error("{0}")]
    ProviderNotFound(String),

    /// Either side changed state between the pairing checks
    #[error("{0}")]
    SessionConflict(String),

    #[error("Provider is currently busy")]
    ProviderBusy,

    #[error("You are already in a session")]
    ReceiverBusy,

    #[error("Cannot select yourself as provider")]
    SelectSelf,

    /// Provider disappeared or changed between the pairing checks
    #[error("{0}")]
    ProviderUnavailable(String),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// Numeric code sent to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::BadRequest(_) => ErrorCode::BadRequest,
            RelayError::AuthRequired => ErrorCode::AuthRequired,
            RelayError::AuthFailed(_) => ErrorCode::AuthFailed,
            RelayError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            RelayError::ProviderNotFound(_) => ErrorCode::ProviderNotFound,
            RelayError::SessionConflict(_) => ErrorCode::SessionConflict,
            RelayError::ProviderBusy => ErrorCode::ProviderBusy,
            RelayError::ReceiverBusy => ErrorCode::ReceiverBusy,
            RelayError::SelectSelf => ErrorCode::SelectSelf,
            RelayError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            RelayError::UnsupportedType(_) => ErrorCode::UnsupportedType,
            RelayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Build the `error` envelope for this failure
    pub fn to_message(&self, session_id: Option<String>) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            session_id,
        }
    }
}

/// Outbound queue failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,

    #[error("message could not be encoded")]
    Encode,
}

/// Result type for hub handlers
pub type RelayResult<T> = Result<T, RelayError>;
