//! Session controller: server lifecycle and client session setup.
//!
//! One controller per process side. It owns the protocol context, keeps
//! the table of listening servers and performs the client handshake for
//! new sessions: connect the socket, register the tentative session, send
//! `INIT_START` and block until the server's `INIT_REPLY` makes the
//! session ready.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tether_core::{Config, Protocol, Session, SessionHandler};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::{tcp, tls, unix};

/// How long a client waits for the handshake to complete.
const SESSION_START_TIMEOUT: Duration = Duration::from_secs(10);

struct ServerHandle {
    description: String,
    task: JoinHandle<()>,
}

/// Owns servers and sessions of one endpoint.
pub struct SessionController {
    protocol: Arc<Protocol>,
    servers: Mutex<HashMap<u32, ServerHandle>>,
    server_id_counter: AtomicU32,
}

impl SessionController {
    /// Create a controller with its protocol context and timer tasks.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(config: Config, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            protocol: Protocol::new(config, handler),
            servers: Mutex::new(HashMap::new()),
            server_id_counter: AtomicU32::new(0),
        }
    }

    /// The underlying protocol context.
    #[must_use]
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    // ------------------------------------------------------------------
    // servers
    // ------------------------------------------------------------------

    /// Listen for plain TCP connections.
    ///
    /// Returns the server id and the bound address (useful with port 0).
    pub async fn add_tcp_server(&self, addr: &str) -> Result<(u32, std::net::SocketAddr)> {
        let (local_addr, task) = tcp::listen(self.protocol.clone(), addr).await?;
        let id = self.register_server(format!("tcp://{local_addr}"), task);
        Ok((id, local_addr))
    }

    /// Listen for TLS-wrapped TCP connections.
    ///
    /// Without certificate and key paths a self-signed certificate is
    /// generated (testing only).
    pub async fn add_tls_tcp_server(
        &self,
        addr: &str,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<(u32, std::net::SocketAddr)> {
        let (local_addr, task) =
            tls::listen(self.protocol.clone(), addr, cert_path, key_path).await?;
        let id = self.register_server(format!("tls://{local_addr}"), task);
        Ok((id, local_addr))
    }

    /// Listen on a Unix-domain socket path.
    pub async fn add_unix_server(&self, path: &Path) -> Result<u32> {
        let (path, task) = unix::listen(self.protocol.clone(), path).await?;
        let id = self.register_server(format!("unix://{}", path.display()), task);
        Ok(id)
    }

    /// Stop a listening server. Established sessions stay up.
    pub fn close_server(&self, id: u32) -> bool {
        match self.lock_servers().remove(&id) {
            Some(server) => {
                tracing::info!(server = %server.description, "closing server");
                server.task.abort();
                true
            }
            None => false,
        }
    }

    /// Stop all listening servers.
    pub fn close_all_servers(&self) {
        for (_, server) in self.lock_servers().drain() {
            tracing::info!(server = %server.description, "closing server");
            server.task.abort();
        }
    }

    /// Number of listening servers.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.lock_servers().len()
    }

    // ------------------------------------------------------------------
    // sessions
    // ------------------------------------------------------------------

    /// Open a session over plain TCP and run the handshake.
    ///
    /// `session_identifier` is delivered opaquely to the server's
    /// session-opened callback.
    pub async fn start_tcp_session(
        &self,
        addr: &str,
        session_identifier: u64,
    ) -> Result<Arc<Session>> {
        let session = tcp::connect(&self.protocol, addr).await?;
        self.run_handshake(session, session_identifier).await
    }

    /// Open a session over TLS and run the handshake.
    pub async fn start_tls_tcp_session(
        &self,
        addr: &str,
        session_identifier: u64,
    ) -> Result<Arc<Session>> {
        let session = tls::connect(&self.protocol, addr).await?;
        self.run_handshake(session, session_identifier).await
    }

    /// Open a session over a Unix-domain socket and run the handshake.
    pub async fn start_unix_session(
        &self,
        path: &Path,
        session_identifier: u64,
    ) -> Result<Arc<Session>> {
        let session = unix::connect(&self.protocol, path).await?;
        self.run_handshake(session, session_identifier).await
    }

    /// Look up an established session by id.
    #[must_use]
    pub fn get_session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.protocol.get_session(session_id)
    }

    /// Close every established session.
    pub async fn close_all_sessions(&self) {
        self.protocol.close_all_sessions().await;
    }

    async fn run_handshake(
        &self,
        session: Arc<Session>,
        session_identifier: u64,
    ) -> Result<Arc<Session>> {
        session.init_handshake(session_identifier).await?;
        session.wait_ready(SESSION_START_TIMEOUT).await?;
        Ok(session)
    }

    fn register_server(&self, description: String, task: JoinHandle<()>) -> u32 {
        let id = self.server_id_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.lock_servers().insert(id, ServerHandle { description, task });
        id
    }

    fn lock_servers(&self) -> MutexGuard<'_, HashMap<u32, ServerHandle>> {
        match self.servers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close_all_servers();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("servers", &self.server_count())
            .field("sessions", &self.protocol.session_count())
            .finish_non_exhaustive()
    }
}
