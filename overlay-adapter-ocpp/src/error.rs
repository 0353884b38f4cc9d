//! Adapter error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while setting up transports
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),

    #[error("Adapter is shutting down")]
    ShuttingDown,
}

/// Reasons a WebSocket handshake is refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("No identity in request path")]
    MissingIdentity,

    #[error("Missing Authorization header")]
    MissingCredentials,

    #[error("Malformed Authorization header")]
    MalformedAuthorization,

    #[error("Invalid credentials for {0}")]
    InvalidCredentials(String),
}
