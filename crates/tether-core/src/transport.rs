//! Transport seam consumed by the engine.
//!
//! The engine never touches sockets. A transport delivers inbound bytes
//! into the session's [`crate::RecvBuffer`] and invokes the dispatcher from
//! its read task; outbound frames go through this trait.

use async_trait::async_trait;

use crate::error::Result;

/// A connected stream transport bound to exactly one session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write a whole frame to the peer.
    ///
    /// Implementations must not interleave concurrent sends; frames are
    /// written atomically with respect to each other.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;

    /// Whether this endpoint initiated the connection.
    fn is_client_side(&self) -> bool;
}
