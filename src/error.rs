//! Error types for the token bridge

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the token bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Inbound message or request body failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// No fresh token could be served before the deadline
    #[error("No fresh token available")]
    PoolEmpty,

    /// No extension is connected to fulfil generation requests
    #[error("No extension connected to the bridge")]
    NoClientConnected,

    /// A generation request is already outstanding
    #[error("Generation already in progress")]
    GenerationInProgress,

    /// The bridge could not be reached or answered unexpectedly
    #[error("Bridge unavailable: {0}")]
    Network(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable machine-readable code used in HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Json(_) => "validation_error",
            Self::PoolEmpty => "pool_empty",
            Self::NoClientConnected => "no_client_connected",
            Self::GenerationInProgress => "generation_in_progress",
            Self::Network(_) => "bridge_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Map an error code from an HTTP body back to an error, if it is one
    /// the consumer can act on
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "pool_empty" => Self::PoolEmpty,
            "no_client_connected" => Self::NoClientConnected,
            "generation_in_progress" => Self::GenerationInProgress,
            "validation_error" => Self::Validation(message.to_string()),
            "timeout" => Self::Timeout(message.to_string()),
            _ => Self::Network(format!("{}: {}", code, message)),
        }
    }

    /// HTTP status used when this error crosses the API boundary
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::PoolEmpty | Self::NoClientConnected | Self::Network(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::GenerationInProgress => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
