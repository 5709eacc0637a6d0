//! Error types for the live mentor session

use thiserror::Error;

/// Result type alias for live mentor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a live mentor session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access denied or unavailable
    #[error("permission error: {0}")]
    Permission(String),

    /// Handshake or mid-session transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound audio payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Operation not valid in the current session state
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
