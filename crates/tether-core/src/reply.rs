//! Registry of sent frames that still await acknowledgment.
//!
//! Every frame sent with the reply-expected flag is recorded here keyed by
//! `(message_id << 32) | session_id`. A matching reply removes the entry;
//! otherwise the 100 ms timer ages it until the reply timeout fires the
//! session's error callback with `MESSAGE_TIMEOUT`.

use std::sync::{Mutex, Weak};
use std::time::Duration;

use tether_proto::ErrorKind;

use crate::session::Session;

/// Milliseconds per timer tick.
pub(crate) const TICK_MILLIS: u64 = 100;

struct ReplyEntry {
    key: u64,
    msg_type: u8,
    elapsed_ticks: u32,
    ignore_result: bool,
    session: Weak<Session>,
}

/// Tracks reply-expecting frames and raises timeout errors.
pub struct ReplyRegistry {
    entries: Mutex<Vec<ReplyEntry>>,
    timeout_ticks: u32,
}

impl ReplyRegistry {
    /// Create a registry with the given reply timeout.
    #[must_use]
    pub fn new(reply_timeout: Duration) -> Self {
        let timeout_ticks = (reply_timeout.as_millis() as u64 / TICK_MILLIS).max(1) as u32;
        Self { entries: Mutex::new(Vec::new()), timeout_ticks }
    }

    /// Record a freshly sent reply-expecting frame.
    pub fn add(&self, msg_type: u8, session_id: u32, message_id: u32, session: &Weak<Session>) {
        let entry = ReplyEntry {
            key: compose_key(session_id, message_id),
            msg_type,
            elapsed_ticks: 0,
            ignore_result: false,
            session: session.clone(),
        };

        self.lock().push(entry);
    }

    /// Remove the entry matching an arrived reply.
    ///
    /// Returns `false` when no entry matched (already timed out or never
    /// registered).
    pub fn remove(&self, session_id: u32, message_id: u32) -> bool {
        let key = compose_key(session_id, message_id);
        let mut entries = self.lock();
        if let Some(index) = entries.iter().position(|entry| entry.key == key) {
            entries.swap_remove(index);
            true
        } else {
            false
        }
    }

    /// Silence all entries of a session that is being torn down.
    ///
    /// The entries age out normally but no longer raise timeout errors.
    pub fn remove_all_of_session(&self, session_id: u32) {
        for entry in self.lock().iter_mut() {
            if (entry.key & 0xFFFF_FFFF) == u64::from(session_id) {
                entry.ignore_result = true;
            }
        }
    }

    /// Whether an entry exists for the given composite id.
    #[must_use]
    pub fn contains(&self, session_id: u32, message_id: u32) -> bool {
        let key = compose_key(session_id, message_id);
        self.lock().iter().any(|entry| entry.key == key)
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Advance all entries by one tick and fire timeouts.
    ///
    /// Called from the timer task every 100 ms; exposed to tests for
    /// deterministic stepping.
    pub async fn tick(&self) {
        let expired = {
            let mut entries = self.lock();
            let timeout_ticks = self.timeout_ticks;
            let mut expired = Vec::new();
            entries.retain_mut(|entry| {
                entry.elapsed_ticks += 1;
                if entry.elapsed_ticks >= timeout_ticks {
                    expired.push((entry.key, entry.msg_type, entry.ignore_result, entry.session.clone()));
                    false
                } else {
                    true
                }
            });
            expired
        };

        for (key, msg_type, ignore_result, session) in expired {
            if ignore_result {
                continue;
            }
            let Some(session) = session.upgrade() else {
                continue;
            };

            tracing::warn!(key, msg_type, "reply timeout");
            let message = format!("timeout of message: {key} with type: {msg_type}");
            session.dispatch_error(ErrorKind::MessageTimeout, &message).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ReplyEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn compose_key(session_id: u32, message_id: u32) -> u64 {
    (u64::from(message_id) << 32) | u64::from(session_id)
}
