//! Error types for the protocol engine.

use thiserror::Error;

use crate::statemachine::SessionState;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by session operations and the dispatcher.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Operation requires the active state.
    #[error("session {session_id:#010x} is not active")]
    NotActive {
        /// Id of the session the operation was attempted on
        session_id: u32,
    },

    /// The state machine refused a transition.
    #[error("invalid state transition: cannot {operation} in state {state:?}")]
    InvalidState {
        /// Current leaf state when the operation was attempted
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The handshake did not complete in time.
    #[error("session start timed out")]
    StartTimeout,

    /// Wire-format violation.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}
