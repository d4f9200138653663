//! Error types for transports.

use crate::packet::ClientId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("A receiver is already registered for client {0}")]
    RegistrationConflict(ClientId),

    #[error("Transport is closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
