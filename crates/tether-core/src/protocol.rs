//! Protocol context: the shared state one endpoint needs across all of its
//! sessions.
//!
//! Owns the handler capability, the reply and blocker registries, the
//! session table with its 16-bit id counter, and the two timer tasks (one
//! 100 ms tick for reply timeouts and heartbeats, one 1 s tick for blocker
//! deadlines). There are no process-wide globals; everything hangs off
//! this value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::blocker::BlockerRegistry;
use crate::handler::SessionHandler;
use crate::reply::{ReplyRegistry, TICK_MILLIS};
use crate::session::Session;
use crate::statemachine::SessionState;
use crate::transport::Transport;

/// Engine tuneables.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a reply-expecting frame may stay unacknowledged before the
    /// error callback fires `MESSAGE_TIMEOUT`.
    pub reply_timeout: Duration,
    /// Cadence of heartbeat probes to all ready sessions.
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// Shared endpoint state. Create once per client or server process.
pub struct Protocol {
    weak_self: Weak<Protocol>,
    config: Config,
    handler: Arc<dyn SessionHandler>,
    reply: Arc<ReplyRegistry>,
    blockers: Arc<BlockerRegistry>,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    session_id_counter: AtomicU16,
}

impl Protocol {
    /// Create the context and spawn its timer tasks.
    ///
    /// Must be called inside a tokio runtime. The timer tasks hold only
    /// weak references and exit when the context is dropped.
    #[must_use]
    pub fn new(config: Config, handler: Arc<dyn SessionHandler>) -> Arc<Self> {
        let reply = Arc::new(ReplyRegistry::new(config.reply_timeout));
        let blockers = Arc::new(BlockerRegistry::new());

        let protocol = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config,
            handler,
            reply,
            blockers,
            sessions: Mutex::new(HashMap::new()),
            session_id_counter: AtomicU16::new(0),
        });

        spawn_reply_timer(protocol.weak_self.clone(), &protocol.config);
        spawn_blocker_timer(protocol.weak_self.clone());

        protocol
    }

    /// Build a session bound to `transport`, sharing this context's
    /// handler and registries.
    #[must_use]
    pub fn create_session(&self, transport: Arc<dyn Transport>) -> Arc<Session> {
        Session::new(
            transport,
            self.handler.clone(),
            self.reply.clone(),
            self.blockers.clone(),
            self.weak_self.clone(),
        )
    }

    /// Register a session under an id.
    pub fn add_session(&self, session_id: u32, session: Arc<Session>) {
        self.lock_sessions().insert(session_id, session);
    }

    /// Deregister a session. Returns the handle when it was present.
    pub fn remove_session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.lock_sessions().remove(&session_id)
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get_session(&self, session_id: u32) -> Option<Arc<Session>> {
        self.lock_sessions().get(&session_id).cloned()
    }

    /// Whether a session id is registered.
    #[must_use]
    pub fn has_session(&self, session_id: u32) -> bool {
        self.lock_sessions().contains_key(&session_id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Allocate the next 16-bit id half, skipping 0.
    pub fn next_session_id(&self) -> u16 {
        loop {
            let id = self.session_id_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Probe every ready session.
    ///
    /// The table is snapshotted first; sends never run under the registry
    /// lock.
    pub async fn send_heartbeats(&self) {
        let sessions: Vec<Arc<Session>> = self.lock_sessions().values().cloned().collect();

        for session in sessions {
            if session.is_in_state(SessionState::SessionReady) {
                if let Err(error) = session.send_heartbeat().await {
                    tracing::debug!(session_id = session.session_id(), %error, "heartbeat failed");
                }
            }
        }
    }

    /// Close every registered session without waiting for close replies.
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self.lock_sessions().values().cloned().collect();

        for session in sessions {
            if let Err(error) = session.close(false).await {
                tracing::debug!(session_id = session.session_id(), %error, "close failed");
            }
        }
    }

    /// Engine tuneables.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The installed handler capability.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.handler
    }

    /// The reply registry shared by all sessions of this context.
    #[must_use]
    pub fn reply(&self) -> &Arc<ReplyRegistry> {
        &self.reply
    }

    /// The blocker registry shared by all sessions of this context.
    #[must_use]
    pub fn blockers(&self) -> &Arc<BlockerRegistry> {
        &self.blockers
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<u32, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("sessions", &self.session_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The 100 ms tick: ages reply entries, and every N-th tick broadcasts
/// heartbeats.
fn spawn_reply_timer(protocol: Weak<Protocol>, config: &Config) {
    let heartbeat_ticks =
        (config.heartbeat_interval.as_millis() as u64 / TICK_MILLIS).max(1) as u32;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MILLIS));
        let mut counter: u32 = 0;

        loop {
            ticker.tick().await;
            let Some(protocol) = protocol.upgrade() else {
                break;
            };

            protocol.reply.tick().await;

            counter += 1;
            if counter >= heartbeat_ticks {
                counter = 0;
                protocol.send_heartbeats().await;
            }
        }
    });
}

/// The 1 s tick decrementing blocker deadlines.
fn spawn_blocker_timer(protocol: Weak<Protocol>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            ticker.tick().await;
            let Some(protocol) = protocol.upgrade() else {
                break;
            };

            protocol.blockers.tick().await;
        }
    });
}
