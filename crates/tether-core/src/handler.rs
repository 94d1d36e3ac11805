//! Handler capability installed per protocol context.
//!
//! One [`SessionHandler`] instance receives every callback of every session
//! in a context. Callbacks run on the connection's read task (or, for
//! timeouts, on a timer task) and must not block indefinitely.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tether_proto::ErrorKind;

use crate::session::Session;

/// The five user callbacks of the engine.
///
/// All methods default to no-ops so handlers implement only what they
/// observe.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Fired once per side after the handshake completes.
    ///
    /// `identifier` is the opaque value the client supplied; the
    /// client side sees 0 for its own session.
    async fn session_opened(&self, session: &Arc<Session>, identifier: u64) {
        let _ = (session, identifier);
    }

    /// Fired once when the session leaves the ready state due to close or
    /// disconnect.
    async fn session_closed(&self, session: &Arc<Session>, identifier: u64) {
        let _ = (session, identifier);
    }

    /// Fired for each stream frame. `payload` is only valid for the
    /// duration of the call.
    async fn stream_data(&self, session: &Arc<Session>, payload: &[u8]) {
        let _ = (session, payload);
    }

    /// Fired for each complete standalone message, after reassembly for
    /// multi-block transfers. Ownership of `payload` transfers to the
    /// handler.
    async fn standalone_data(&self, session: &Arc<Session>, outgoing_id: u64, payload: Bytes) {
        let _ = (session, outgoing_id, payload);
    }

    /// Fired on protocol errors, timeouts and refused transfers.
    async fn error(&self, session: &Arc<Session>, kind: ErrorKind, message: &str) {
        let _ = (session, kind, message);
    }
}

/// Handler that ignores every callback.
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl SessionHandler for NoopHandler {}
