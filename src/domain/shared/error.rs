//! Domain errors

use thiserror::Error;

/// Reason codes surfaced through session listener callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorCode {
    /// No mutually supported codec or MIME type
    UnsupportedMedia,
    /// Remote side answered with a 4xx/6xx decline
    DeclinedByRemote,
    /// Remote side cancelled before answer
    CancelledByRemote,
    /// No SIP response within the transaction bound
    Timeout,
    /// Authentication challenge failed beyond one retry
    AuthenticationFailed,
    /// Media transport (MSRP/RTP) failed mid-session
    TransportFailed,
    /// Anything else
    Internal,
}

impl SessionErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            SessionErrorCode::UnsupportedMedia => "unsupported-media",
            SessionErrorCode::DeclinedByRemote => "declined",
            SessionErrorCode::CancelledByRemote => "cancelled",
            SessionErrorCode::Timeout => "timeout",
            SessionErrorCode::AuthenticationFailed => "authentication-failed",
            SessionErrorCode::TransportFailed => "transport-failed",
            SessionErrorCode::Internal => "internal",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("Declined by remote with status {0}")]
    Declined(u16),

    #[error("Cancelled by remote")]
    Cancelled,

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Map to the reason code reported through listener callbacks
    pub fn code(&self) -> SessionErrorCode {
        match self {
            SessionError::UnsupportedMedia(_) => SessionErrorCode::UnsupportedMedia,
            SessionError::Declined(_) => SessionErrorCode::DeclinedByRemote,
            SessionError::Cancelled => SessionErrorCode::CancelledByRemote,
            SessionError::Timeout(_) => SessionErrorCode::Timeout,
            SessionError::AuthenticationFailed(_) => SessionErrorCode::AuthenticationFailed,
            SessionError::Transport(_) => SessionErrorCode::TransportFailed,
            _ => SessionErrorCode::Internal,
        }
    }
}

/// Standard result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
