//! Error types for transports and the session controller.

use thiserror::Error;

/// Result alias for transport-layer operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised while binding servers or starting sessions.
#[derive(Error, Debug)]
pub enum NetError {
    /// Bad address, certificate or key material.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failure inside the protocol engine.
    #[error(transparent)]
    Core(#[from] tether_core::CoreError),
}
