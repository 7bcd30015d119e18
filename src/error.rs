//! Error types for rsocket-client.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Main error type for all rsocket-client operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error during transport operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or header parse error (connection-fatal).
    #[error("Frame error: {0}")]
    Frame(String),

    /// Protocol violation (duplicate SETUP, bad flags, exhausted ids, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Setup was rejected or invalid (connection-scoped).
    #[error("Setup error ({code:?}): {message}")]
    Setup { code: ErrorCode, message: String },

    /// Transport broken or peer signalled a connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Business-level failure surfaced on a single stream.
    #[error("Application error: {0}")]
    Application(String),

    /// The peer rejected the request (idempotent-retry candidate).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The request was cancelled, locally or by the peer.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The peer reported the request as invalid.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// The peer used a reserved error code.
    #[error("Reserved error: {0}")]
    Reserved(String),

    /// The request timed out locally; a CANCEL was sent on the wire.
    #[error("Request timed out")]
    Timeout,

    /// The load balancer had zero usable sockets at request time.
    #[error("No available socket in load balancer")]
    EmptyBalancer,

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RSocketError {
    /// Build the stream-scoped error matching a wire error code.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidSetup | ErrorCode::UnsupportedSetup | ErrorCode::RejectedSetup => {
                RSocketError::Setup { code, message }
            }
            ErrorCode::ConnectionError => RSocketError::Connection(message),
            ErrorCode::ApplicationError => RSocketError::Application(message),
            ErrorCode::Rejected => RSocketError::Rejected(message),
            ErrorCode::Canceled => RSocketError::Canceled(message),
            ErrorCode::Invalid => RSocketError::Invalid(message),
            ErrorCode::Reserved => RSocketError::Reserved(message),
        }
    }

    /// Whether the reenqueue filter may retry a request that failed with
    /// this error. Only REJECTED, CANCELED and connection errors qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RSocketError::Rejected(_)
                | RSocketError::Canceled(_)
                | RSocketError::Connection(_)
                | RSocketError::ConnectionClosed
        )
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
