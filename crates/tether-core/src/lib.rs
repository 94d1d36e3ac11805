//! Protocol engine for the Tether session protocol.
//!
//! The engine turns a byte-stream transport into logical *sessions*
//! carrying four interaction patterns over one connection: fire-and-forget
//! streams, standalone messages of arbitrary size (transparently
//! fragmented as multi-block transfers), blocking request/response and
//! liveness probes.
//!
//! # Architecture
//!
//! - [`Protocol`] is the per-endpoint context: handler capability, reply
//!   and blocker registries, session table and timer tasks. No globals.
//! - [`Session`] is the per-connection state machine with the send
//!   operations and the multi-block engine.
//! - [`process_frames`] is the dispatcher a transport's read task feeds.
//! - [`Transport`] and [`SessionHandler`] are the two seams the caller
//!   implements; `tether-net` provides TCP, TLS and Unix-domain
//!   transports.
//!
//! Callbacks run on the connection's read task; send paths are async and
//! may be called from any task.

pub mod blocker;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod multiblock;
pub mod protocol;
pub mod reply;
pub mod ring;
pub mod session;
pub mod statemachine;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use blocker::BlockerRegistry;
pub use dispatch::process_frames;
pub use error::CoreError;
pub use handler::{NoopHandler, SessionHandler};
pub use multiblock::MultiblockIo;
pub use protocol::{Config, Protocol};
pub use reply::ReplyRegistry;
pub use ring::RecvBuffer;
pub use session::Session;
pub use statemachine::{SessionEvent, SessionState, Statemachine};
pub use transport::Transport;
