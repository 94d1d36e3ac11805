//! Stream transports and session controller for the Tether protocol.
//!
//! Provides the "outside" of the engine: TCP, TLS-over-TCP and
//! Unix-domain socket transports satisfying `tether-core`'s transport
//! contract, the per-connection read task that feeds the dispatcher, and
//! the [`SessionController`] entry point for binding servers and starting
//! client sessions.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tether_core::{Config, NoopHandler};
//! use tether_net::SessionController;
//!
//! # async fn example() -> Result<(), tether_net::NetError> {
//! let controller = SessionController::new(Config::default(), Arc::new(NoopHandler));
//! let (_, addr) = controller.add_tcp_server("127.0.0.1:0").await?;
//!
//! let session = controller.start_tcp_session(&addr.to_string(), 0x7465_7374).await?;
//! session.send_stream(b"hello", false).await?;
//! # Ok(())
//! # }
//! ```

mod controller;
pub mod error;
pub mod stream;
mod tcp;
mod tls;
mod unix;

pub use controller::SessionController;
pub use error::NetError;
pub use stream::{StreamTransport, spawn_read_loop};
