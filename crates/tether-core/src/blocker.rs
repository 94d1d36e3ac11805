//! Registry of callers parked on a correlated response.
//!
//! `send_request` registers a completion here keyed by a random nonzero id
//! and awaits it. The dispatcher completes it when the correlated response
//! arrives; the 1 s deadline timer completes it empty and raises
//! `MESSAGE_TIMEOUT`. Whichever comes first wins.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tether_proto::ErrorKind;
use tokio::sync::oneshot;

use crate::session::Session;

struct BlockerEntry {
    tx: oneshot::Sender<Option<Bytes>>,
    remaining_secs: u64,
    session: Weak<Session>,
}

/// Suspends request callers until release or deadline.
#[derive(Default)]
pub struct BlockerRegistry {
    entries: Mutex<HashMap<u64, BlockerEntry>>,
}

impl BlockerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter under `id` before the request frame is sent, so a
    /// fast response cannot race the registration.
    ///
    /// The caller awaits the returned receiver via [`Self::wait`].
    pub fn register(
        &self,
        id: u64,
        timeout: Duration,
        session: &Weak<Session>,
    ) -> oneshot::Receiver<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let entry = BlockerEntry {
            tx,
            remaining_secs: timeout.as_secs().max(1),
            session: session.clone(),
        };

        self.lock().insert(id, entry);
        rx
    }

    /// Await a registered completion. `None` on timeout or teardown.
    pub async fn wait(&self, id: u64, rx: oneshot::Receiver<Option<Bytes>>) -> Option<Bytes> {
        let result = rx.await.ok().flatten();
        // belt and braces: drop the entry if the sender side never removed it
        self.lock().remove(&id);
        result
    }

    /// Complete the waiter for `id` with a response payload.
    ///
    /// Returns `false` when no waiter is registered under the id.
    pub fn release(&self, id: u64, payload: Bytes) -> bool {
        match self.lock().remove(&id) {
            Some(entry) => entry.tx.send(Some(payload)).is_ok(),
            None => false,
        }
    }

    /// Complete the waiter for `id` empty-handed (refused transfer).
    pub fn release_empty(&self, id: u64) -> bool {
        match self.lock().remove(&id) {
            Some(entry) => entry.tx.send(None).is_ok(),
            None => false,
        }
    }

    /// Drop a registration whose request frame could not be sent.
    pub fn discard(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Wake all waiters of a session that is being torn down, empty-handed.
    pub fn release_all_of_session(&self, session_id: u32) {
        let released: Vec<BlockerEntry> = {
            let mut entries = self.lock();
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.session.upgrade().is_some_and(|s| s.session_id() == session_id)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };

        for entry in released {
            let _ = entry.tx.send(None);
        }
    }

    /// Number of parked waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no waiters are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Advance all deadlines by one second and fire expirations.
    ///
    /// Called from the timer task; exposed to tests for deterministic
    /// stepping.
    pub async fn tick(&self) {
        let expired: Vec<(u64, BlockerEntry)> = {
            let mut entries = self.lock();
            let ids: Vec<u64> = entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    entry.remaining_secs = entry.remaining_secs.saturating_sub(1);
                    (entry.remaining_secs == 0).then_some(*id)
                })
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id).map(|e| (id, e))).collect()
        };

        for (id, entry) in expired {
            tracing::warn!(blocker_id = id, "request timeout");
            let _ = entry.tx.send(None);

            if let Some(session) = entry.session.upgrade() {
                let message = format!("timeout of request: {id}");
                session.dispatch_error(ErrorKind::MessageTimeout, &message).await;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, BlockerEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
