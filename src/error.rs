//! Error types for session operations
//!
//! Publish timeouts and send failures are reported as
//! [`PublishOutcome`](crate::session::PublishOutcome) values. Everything else a
//! caller can get wrong, or a broker can refuse, lands here.

use crate::protocol::topics::ValidationError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No CONNACK received within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Connection rejected by broker (code {code}): {reason}")]
    ConnectRejected { code: u8, reason: String },

    #[error("No SUBACK received for '{topic}' within {timeout:?}")]
    SubscribeTimeout { topic: String, timeout: Duration },

    #[error("Subscription to '{topic}' refused by broker")]
    SubscribeRejected { topic: String },

    #[error("Transport failed to send request: {0}")]
    TransportSendFailure(#[source] TransportError),

    #[error("Session is not connected (state: {state})")]
    NotConnected { state: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[source] ValidationError),

    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    #[error("Invalid client id: {0}")]
    InvalidClientId(#[source] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Create not connected error from any displayable state
    pub fn not_connected(state: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            state: state.to_string(),
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectTimeout { .. }
                | SessionError::SubscribeTimeout { .. }
                | SessionError::TransportSendFailure(_)
                | SessionError::NotConnected { .. }
        )
    }
}

impl From<ValidationError> for SessionError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidQos(level) => SessionError::InvalidQos(level),
            other => SessionError::InvalidTopic(other),
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
