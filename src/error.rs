//! Error taxonomy for the aggregation layer.
//!
//! Pre-flight validation errors (missing arguments, unparseable parameter
//! buckets, bucket collisions) short-circuit before any I/O. Downstream and
//! transport failures are always recoverable and are normalized into error
//! content at the meta-tool boundary rather than propagated as protocol
//! failures.

use thiserror::Error;

pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("{0} is required")]
    MissingArgument(String),

    #[error("Invalid parameter in '{bucket}': {message}")]
    InvalidParameter { bucket: String, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Action not found: {server}:{action}")]
    ActionNotFound { server: String, action: String },

    #[error("Downstream call failed on {server}:{action}: {message}")]
    Downstream {
        server: String,
        action: String,
        message: String,
    },

    #[error("Invalid intention: {0}")]
    InvalidIntention(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StrataError {
    /// Whether the error may succeed on a later attempt. Used to decide
    /// between transient and permanent failures when dialing remote servers.
    pub fn is_transient(&self) -> bool {
        match self {
            StrataError::ConnectionFailed(msg) => {
                !(msg.contains("connection refused")
                    || msg.contains("invalid URL")
                    || msg.contains("not found"))
            }
            StrataError::Downstream { .. } => true,
            StrataError::Io(_) => true,
            _ => false,
        }
    }
}
