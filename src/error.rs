//! Error types for the push client

use thiserror::Error;

/// Errors surfaced by the push client library
#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid push configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,

    #[error("connection manager has shut down")]
    Closed,
}

pub type PushResult<T> = std::result::Result<T, PushError>;
