//! Plain TCP transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tether_core::{Protocol, Session};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::error::{NetError, Result};
use crate::stream::{StreamTransport, spawn_read_loop};

/// Bind a TCP listener and spawn its accept loop.
///
/// Every accepted connection gets a fresh server-side session wired to the
/// dispatcher.
pub(crate) async fn listen(
    protocol: Arc<Protocol>,
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| NetError::Config(format!("failed to bind '{addr}': {error}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|error| NetError::Transport(format!("failed to get local address: {error}")))?;

    tracing::info!("TCP server listening on {}", local_addr);

    let handle = tokio::spawn(accept_loop(listener, protocol));
    Ok((local_addr, handle))
}

async fn accept_loop(listener: TcpListener, protocol: Arc<Protocol>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted TCP connection");
                accept_connection(&protocol, stream);
            }
            Err(error) => {
                tracing::warn!(%error, "TCP accept failed");
            }
        }
    }
}

fn accept_connection(protocol: &Arc<Protocol>, stream: TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!(%error, "set_nodelay failed");
    }

    let (read_half, write_half) = stream.into_split();
    let transport = StreamTransport::new(write_half, false);
    let session = protocol.create_session(transport);

    match session.connect_session(0) {
        Ok(()) => spawn_read_loop(read_half, protocol.clone(), session),
        Err(error) => tracing::warn!(%error, "accepted session refused connect"),
    }
}

/// Open a client connection and register the tentative session.
///
/// The caller still drives the handshake (`init_handshake` + `wait_ready`).
pub(crate) async fn connect(protocol: &Arc<Protocol>, addr: &str) -> Result<Arc<Session>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|error| NetError::Transport(format!("connect to '{addr}' failed: {error}")))?;
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!(%error, "set_nodelay failed");
    }

    let (read_half, write_half) = stream.into_split();
    register_client(protocol, StreamTransport::new(write_half, true), read_half)
}

/// Shared client-side wiring: tentative id, registration, read task.
pub(crate) fn register_client<R>(
    protocol: &Arc<Protocol>,
    transport: Arc<dyn tether_core::Transport>,
    read_half: R,
) -> Result<Arc<Session>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let session = protocol.create_session(transport);
    let tentative_id = u32::from(protocol.next_session_id());

    session.connect_session(tentative_id)?;
    protocol.add_session(tentative_id, session.clone());
    spawn_read_loop(read_half, protocol.clone(), session.clone());

    Ok(session)
}
