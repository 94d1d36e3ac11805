//! In-memory doubles for engine tests.
//!
//! `MockTransport` collects outbound frames so tests can pump them into
//! the peer's dispatcher by hand; `RecordingHandler` captures every
//! callback for assertions.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tether_proto::ErrorKind;

use crate::error::{CoreError, Result};
use crate::handler::SessionHandler;
use crate::session::Session;
use crate::transport::Transport;

/// Transport that records outbound frames instead of writing a socket.
pub(crate) struct MockTransport {
    client: bool,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn client() -> Arc<Self> {
        Arc::new(Self { client: true, sent: Mutex::new(Vec::new()), closed: AtomicBool::new(false) })
    }

    pub(crate) fn server() -> Arc<Self> {
        Arc::new(Self {
            client: false,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Drain everything sent since the last call.
    pub(crate) fn take_sent(&self) -> Vec<Bytes> {
        match self.sent.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub(crate) fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.was_closed() {
            return Err(CoreError::Transport("transport closed".to_string()));
        }
        match self.sent.lock() {
            Ok(mut guard) => guard.push(Bytes::copy_from_slice(frame)),
            Err(poisoned) => poisoned.into_inner().push(Bytes::copy_from_slice(frame)),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_client_side(&self) -> bool {
        self.client
    }
}

/// One captured callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Opened { session_id: u32, identifier: u64 },
    Closed { session_id: u32, identifier: u64 },
    Stream { payload: Vec<u8> },
    Standalone { outgoing_id: u64, payload: Vec<u8> },
    Error { kind: ErrorKind, message: String },
}

/// Handler that appends every callback to a list.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn count<F: Fn(&Event) -> bool>(&self, predicate: F) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    fn push(&self, event: Event) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn session_opened(&self, session: &Arc<Session>, identifier: u64) {
        self.push(Event::Opened { session_id: session.session_id(), identifier });
    }

    async fn session_closed(&self, session: &Arc<Session>, identifier: u64) {
        self.push(Event::Closed { session_id: session.session_id(), identifier });
    }

    async fn stream_data(&self, _session: &Arc<Session>, payload: &[u8]) {
        self.push(Event::Stream { payload: payload.to_vec() });
    }

    async fn standalone_data(&self, _session: &Arc<Session>, outgoing_id: u64, payload: Bytes) {
        self.push(Event::Standalone { outgoing_id, payload: payload.to_vec() });
    }

    async fn error(&self, _session: &Arc<Session>, kind: ErrorKind, message: &str) {
        self.push(Event::Error { kind, message: message.to_string() });
    }
}
