//! Generic stream-socket plumbing shared by the TCP, TLS and Unix
//! transports.
//!
//! A connection is split into halves: the write half becomes a
//! [`StreamTransport`] handed to the engine, the read half feeds a spawned
//! read task that appends bytes to the session's receive buffer and
//! invokes the dispatcher serially.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_core::error::{CoreError, Result as CoreResult};
use tether_core::{Protocol, RecvBuffer, Session, Transport, process_frames};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 8 * 1024;

/// Engine-facing transport over any async write half.
pub struct StreamTransport<W> {
    writer: Mutex<W>,
    client: bool,
    closed: AtomicBool,
}

impl<W> StreamTransport<W> {
    /// Wrap a write half. `client` reports which side initiated the
    /// connection.
    pub fn new(writer: W, client: bool) -> Arc<Self> {
        Arc::new(Self { writer: Mutex::new(writer), client, closed: AtomicBool::new(false) })
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: &[u8]) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("connection closed".to_string()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame)
            .await
            .map_err(|error| CoreError::Transport(format!("write failed: {error}")))
    }

    async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|error| CoreError::Transport(format!("shutdown failed: {error}")))
    }

    fn is_client_side(&self) -> bool {
        self.client
    }
}

/// Spawn the per-connection read task.
///
/// Reads until EOF or error, feeding the dispatcher after every chunk,
/// then drives the session's disconnect handling.
pub fn spawn_read_loop<R>(mut reader: R, protocol: Arc<Protocol>, session: Arc<Session>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = RecvBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    tracing::debug!(session_id = session.session_id(), "connection closed by peer");
                    break;
                }
                Ok(count) => {
                    buf.push(&chunk[..count]);
                    process_frames(&protocol, &session, &mut buf).await;
                }
                Err(error) => {
                    tracing::debug!(session_id = session.session_id(), %error, "read failed");
                    break;
                }
            }
        }

        session.handle_disconnect().await;
    });
}
