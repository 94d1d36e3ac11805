//! Unix-domain stream socket transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tether_core::{Protocol, Session};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::error::{NetError, Result};
use crate::stream::{StreamTransport, spawn_read_loop};
use crate::tcp::register_client;

/// Bind a Unix-domain listener on `path` and spawn its accept loop.
///
/// A stale socket file from an earlier run is removed first.
pub(crate) async fn listen(
    protocol: Arc<Protocol>,
    path: &Path,
) -> Result<(PathBuf, JoinHandle<()>)> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|error| {
            NetError::Config(format!("failed to remove stale socket '{}': {error}", path.display()))
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|error| {
        NetError::Config(format!("failed to bind '{}': {error}", path.display()))
    })?;

    tracing::info!("Unix-domain server listening on {}", path.display());

    let handle = tokio::spawn(accept_loop(listener, protocol));
    Ok((path.to_path_buf(), handle))
}

async fn accept_loop(listener: UnixListener, protocol: Arc<Protocol>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tracing::debug!("accepted Unix-domain connection");
                accept_connection(&protocol, stream);
            }
            Err(error) => {
                tracing::warn!(%error, "Unix-domain accept failed");
            }
        }
    }
}

fn accept_connection(protocol: &Arc<Protocol>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let transport = StreamTransport::new(write_half, false);
    let session = protocol.create_session(transport);

    match session.connect_session(0) {
        Ok(()) => spawn_read_loop(read_half, protocol.clone(), session),
        Err(error) => tracing::warn!(%error, "accepted session refused connect"),
    }
}

/// Open a client connection over a Unix-domain socket.
pub(crate) async fn connect(protocol: &Arc<Protocol>, path: &Path) -> Result<Arc<Session>> {
    let stream = UnixStream::connect(path).await.map_err(|error| {
        NetError::Transport(format!("connect to '{}' failed: {error}", path.display()))
    })?;

    let (read_half, write_half) = stream.into_split();
    register_client(protocol, StreamTransport::new(write_half, true), read_half)
}
