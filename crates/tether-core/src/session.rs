//! The session: a logical bidirectional message channel bound to one
//! transport connection.
//!
//! A session exposes the four interaction patterns (stream, standalone,
//! request/response, heartbeat), drives the close handshake and owns the
//! per-session pieces: state machine, message-id counter and multi-block
//! engine. Incoming frames are routed to it by the dispatcher.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tether_proto::messages::{
    MultiblockAbortInit, MultiblockAbortReply, MultiblockFinish, MultiblockInit, MultiblockStatic,
    SessionCloseStart, SessionInitStart, StreamStatic, encode_singleblock_dynamic,
    encode_stream_dynamic,
};
use tether_proto::{ErrorKind, FrameHeader, MAX_SINGLE_PAYLOAD};
use tokio::sync::Notify;

use crate::blocker::BlockerRegistry;
use crate::error::{CoreError, Result};
use crate::handler::SessionHandler;
use crate::multiblock::{self, MultiblockIo};
use crate::protocol::Protocol;
use crate::reply::ReplyRegistry;
use crate::statemachine::{SessionEvent, SessionState, Statemachine};
use crate::transport::Transport;

/// A protocol session over one connection.
///
/// Created by [`Protocol::create_session`]; handles are shared between the
/// user, the read task, the timer tasks and the multi-block sender task.
pub struct Session {
    weak_self: Weak<Session>,
    transport: Arc<dyn Transport>,
    statemachine: Mutex<Statemachine>,
    session_id: AtomicU32,
    session_identifier: AtomicU64,
    message_id_counter: AtomicU32,
    multiblock: Arc<MultiblockIo>,
    handler: Mutex<Arc<dyn SessionHandler>>,
    reply: Arc<ReplyRegistry>,
    blockers: Arc<BlockerRegistry>,
    protocol: Weak<Protocol>,
    linked: Mutex<Weak<Session>>,
    ready: Notify,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn SessionHandler>,
        reply: Arc<ReplyRegistry>,
        blockers: Arc<BlockerRegistry>,
        protocol: Weak<Protocol>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            transport,
            statemachine: Mutex::new(Statemachine::new()),
            session_id: AtomicU32::new(0),
            session_identifier: AtomicU64::new(0),
            message_id_counter: AtomicU32::new(0),
            multiblock: Arc::new(MultiblockIo::new()),
            handler: Mutex::new(handler),
            reply,
            blockers,
            protocol,
            linked: Mutex::new(Weak::new()),
            ready: Notify::new(),
        });

        multiblock::spawn_sender(session.weak_self.clone(), session.multiblock.clone());
        session
    }

    // ------------------------------------------------------------------
    // public send operations
    // ------------------------------------------------------------------

    /// Send a fire-and-forget stream payload.
    ///
    /// Payloads larger than the single-frame budget are split into chunks;
    /// all chunks must be written for the call to succeed. With
    /// `reply_expected` each chunk is tracked in the reply registry until
    /// the peer acknowledges it.
    pub async fn send_stream(&self, payload: &[u8], reply_expected: bool) -> Result<()> {
        self.require_active("send_stream")?;

        for chunk in payload.chunks(MAX_SINGLE_PAYLOAD) {
            if chunk.len() == MAX_SINGLE_PAYLOAD {
                let message = StreamStatic::new(
                    self.next_message_id(),
                    self.session_id(),
                    chunk,
                    reply_expected,
                )?;
                self.send_frame(zerocopy_bytes(&message)).await?;
            } else {
                let frame = encode_stream_dynamic(
                    self.next_message_id(),
                    self.session_id(),
                    chunk,
                    reply_expected,
                )?;
                self.send_frame(&frame).await?;
            }
        }

        Ok(())
    }

    /// Send a standalone message of arbitrary size.
    ///
    /// Returns the outgoing id the peer's standalone callback will see: a
    /// random single-block id when the payload fits one frame, the
    /// multi-block transfer id otherwise.
    pub async fn send_standalone(&self, payload: Bytes) -> Result<u64> {
        self.require_active("send_standalone")?;

        if payload.len() <= MAX_SINGLE_PAYLOAD {
            let singleblock_id = multiblock::random_nonzero_u64();
            let frame = encode_singleblock_dynamic(
                self.next_message_id(),
                self.session_id(),
                singleblock_id,
                0,
                &payload,
            )?;
            self.send_frame(&frame).await?;
            Ok(singleblock_id)
        } else {
            self.start_multiblock(payload, false, 0).await
        }
    }

    /// Send a request and await the correlated response.
    ///
    /// The caller is parked in the blocker registry under the outgoing id
    /// until the peer's [`Session::send_response`] releases it or `timeout`
    /// elapses. `None` on timeout or session teardown.
    pub async fn send_request(&self, payload: Bytes, timeout: Duration) -> Result<Option<Bytes>> {
        self.require_active("send_request")?;

        let (id, rx) = if payload.len() <= MAX_SINGLE_PAYLOAD {
            let id = multiblock::random_nonzero_u64();
            let rx = self.blockers.register(id, timeout, &self.weak_self);
            let frame = encode_singleblock_dynamic(
                self.next_message_id(),
                self.session_id(),
                id,
                0,
                &payload,
            )?;
            if let Err(error) = self.send_frame(&frame).await {
                self.blockers.discard(id);
                return Err(error);
            }
            (id, rx)
        } else {
            let id = self.multiblock.enqueue(payload.clone(), 0);
            let rx = self.blockers.register(id, timeout, &self.weak_self);
            if let Err(error) = self.send_multiblock_init(id, payload.len() as u64, true).await {
                self.blockers.discard(id);
                self.multiblock.remove_outgoing(id);
                return Err(error);
            }
            (id, rx)
        };

        Ok(self.blockers.wait(id, rx).await)
    }

    /// Send a response correlated to a received request.
    ///
    /// `blocker_id` is the outgoing id the request arrived under; it
    /// travels in the frame so the peer's blocker registry can release the
    /// matching parked caller.
    pub async fn send_response(&self, payload: Bytes, blocker_id: u64) -> Result<u64> {
        self.require_active("send_response")?;

        if payload.len() <= MAX_SINGLE_PAYLOAD {
            let singleblock_id = multiblock::random_nonzero_u64();
            let frame = encode_singleblock_dynamic(
                self.next_message_id(),
                self.session_id(),
                singleblock_id,
                blocker_id,
                &payload,
            )?;
            self.send_frame(&frame).await?;
            Ok(singleblock_id)
        } else {
            self.start_multiblock(payload, false, blocker_id).await
        }
    }

    /// Cancel an outgoing multi-block transfer.
    ///
    /// A still-queued transfer is deleted locally; one that already started
    /// flowing is flagged so the sender task aborts between parts. An id
    /// unknown locally is treated as an incoming transfer and the peer is
    /// asked to stop it.
    pub async fn abort_messages(&self, multiblock_id: u64) -> Result<()> {
        if self.multiblock.remove_outgoing(multiblock_id) {
            return Ok(());
        }

        let message =
            MultiblockAbortInit::new(self.next_message_id(), self.session_id(), multiblock_id);
        self.send_frame(zerocopy_bytes(&message)).await
    }

    /// Initiate the close handshake.
    ///
    /// Silences this session's reply-registry entries, cancels queued
    /// multi-block transfers and sends `CLOSE_START`. Without
    /// `reply_expected` the local teardown completes immediately;
    /// otherwise it finishes when the `CLOSE_REPLY` arrives.
    pub async fn close(&self, reply_expected: bool) -> Result<()> {
        if !self.is_in_state(SessionState::SessionReady) {
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "close",
            });
        }

        tracing::debug!(session_id = self.session_id(), "closing session");

        self.reply.remove_all_of_session(self.session_id());
        self.multiblock.cancel_all_outgoing();

        let message =
            SessionCloseStart::new(self.next_message_id(), self.session_id(), reply_expected);
        self.send_frame(zerocopy_bytes(&message)).await?;

        if !reply_expected {
            self.end_session().await?;
        }

        Ok(())
    }

    /// Send one liveness probe. Requires a ready session.
    pub async fn send_heartbeat(&self) -> Result<()> {
        if !self.is_in_state(SessionState::SessionReady) {
            return Err(CoreError::NotActive { session_id: self.session_id() });
        }

        let message = tether_proto::messages::HeartbeatStart::new(
            self.next_message_id(),
            self.session_id(),
        );
        self.send_frame(zerocopy_bytes(&message)).await
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    /// Current session id; 0 until the handshake assigned one.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// The opaque identifier the client supplied, 0 on the client side.
    #[must_use]
    pub fn session_identifier(&self) -> u64 {
        self.session_identifier.load(Ordering::SeqCst)
    }

    /// Whether this endpoint initiated the connection.
    #[must_use]
    pub fn is_client_side(&self) -> bool {
        self.transport.is_client_side()
    }

    /// Whether all send operations are currently permitted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_in_state(SessionState::Active)
    }

    /// Ancestor-aware state query.
    #[must_use]
    pub fn is_in_state(&self, state: SessionState) -> bool {
        self.lock_statemachine().is_in_state(state)
    }

    /// Current leaf state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.lock_statemachine().current()
    }

    /// Advance the per-session message-id counter and return the new id.
    pub fn next_message_id(&self) -> u32 {
        self.message_id_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    // ------------------------------------------------------------------
    // linked-session forwarding (proxy mode)
    // ------------------------------------------------------------------

    /// Link a peer session; whole frames arriving here are forwarded to
    /// its transport without invoking any callback.
    pub fn link_session(&self, other: &Arc<Session>) {
        *self.lock_linked() = Arc::downgrade(other);
    }

    /// Remove the forwarding link.
    pub fn unlink_session(&self) {
        *self.lock_linked() = Weak::new();
    }

    /// The linked peer, if any.
    #[must_use]
    pub fn linked_session(&self) -> Option<Arc<Session>> {
        self.lock_linked().upgrade()
    }

    /// Replace this session's handler capability.
    ///
    /// Sessions start with the context-wide handler; installing a
    /// per-session one redirects all five callbacks of this session.
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.lock_handler() = handler;
    }

    // ------------------------------------------------------------------
    // lifecycle (driven by the controller and the dispatcher)
    // ------------------------------------------------------------------

    /// Attach the transport: `NOT_CONNECTED → CONNECTED`.
    ///
    /// `session_id` is the client's tentative id, or 0 on the accepting
    /// side where the handshake assigns it later.
    pub fn connect_session(&self, session_id: u32) -> Result<()> {
        let permitted = self.lock_statemachine().go_to_next_state(SessionEvent::Connect);
        if !permitted {
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "connect_session",
            });
        }

        self.session_id.store(session_id, Ordering::SeqCst);
        Ok(())
    }

    /// Send `INIT_START` with the chosen identifier (client side).
    pub async fn init_handshake(&self, session_identifier: u64) -> Result<()> {
        if !self.is_in_state(SessionState::SessionNotReady) {
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "init_handshake",
            });
        }

        tracing::debug!(client_session_id = self.session_id(), "sending session init start");
        let message =
            SessionInitStart::new(self.next_message_id(), self.session_id(), session_identifier);
        self.send_frame(zerocopy_bytes(&message)).await
    }

    /// Await the handshake completion driven by the dispatcher.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.is_in_state(SessionState::SessionReady) {
                    return;
                }
                self.ready.notified().await;
            }
        })
        .await
        .map_err(|_| CoreError::StartTimeout)
    }

    /// Complete the handshake: `SESSION_NOT_READY → SESSION_READY` under
    /// the final id, then fire the session-opened callback.
    pub(crate) async fn make_ready(&self, session_id: u32, session_identifier: u64) -> Result<()> {
        let permitted = self.lock_statemachine().go_to_next_state(SessionEvent::StartSession);
        if !permitted {
            self.ready.notify_one();
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "make_ready",
            });
        }

        self.session_id.store(session_id, Ordering::SeqCst);
        self.session_identifier.store(session_identifier, Ordering::SeqCst);

        tracing::debug!(session_id, "session ready");

        if let Some(me) = self.weak_self.upgrade() {
            self.handler().session_opened(&me, session_identifier).await;
        }

        self.ready.notify_one();
        Ok(())
    }

    /// Tear down the ready session: fire session-closed, deregister, wake
    /// parked callers and disconnect the transport.
    pub(crate) async fn end_session(&self) -> Result<()> {
        let permitted = self.lock_statemachine().go_to_next_state(SessionEvent::StopSession);
        if !permitted {
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "end_session",
            });
        }

        let session_id = self.session_id();
        tracing::debug!(session_id, "ending session");

        self.reply.remove_all_of_session(session_id);

        if let Some(me) = self.weak_self.upgrade() {
            self.handler().session_closed(&me, self.session_identifier()).await;
        }

        if let Some(protocol) = self.protocol.upgrade() {
            protocol.remove_session(session_id);
        }

        self.blockers.release_all_of_session(session_id);

        self.disconnect_session().await
    }

    /// Drop the transport: `CONNECTED → NOT_CONNECTED`.
    pub(crate) async fn disconnect_session(&self) -> Result<()> {
        let permitted = self.lock_statemachine().go_to_next_state(SessionEvent::Disconnect);
        if !permitted {
            return Err(CoreError::InvalidState {
                state: self.current_state(),
                operation: "disconnect_session",
            });
        }

        tracing::debug!(session_id = self.session_id(), "disconnecting session");

        self.multiblock.stop();
        self.transport.close().await
    }

    /// React to the transport dropping without a close handshake.
    pub async fn handle_disconnect(&self) {
        if self.is_in_state(SessionState::SessionReady) {
            if let Err(error) = self.end_session().await {
                tracing::debug!(%error, "teardown after disconnect failed");
            }
        } else if self.is_in_state(SessionState::Connected) {
            let _ = self.disconnect_session().await;
        }
    }

    // ------------------------------------------------------------------
    // frame output
    // ------------------------------------------------------------------

    /// Write one whole frame to the transport.
    ///
    /// Frames flagged reply-expected are recorded in the reply registry
    /// before the write so the acknowledgment can never race the
    /// registration.
    pub(crate) async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let header = FrameHeader::peek(frame)?;
        if header.flags().reply_expected() {
            self.reply.add(
                header.raw_type(),
                header.session_id(),
                header.message_id(),
                &self.weak_self,
            );
        }

        self.transport.send(frame).await
    }

    /// Forward raw bytes for a linked session, bypassing all registries.
    pub(crate) async fn forward_raw(&self, bytes: &[u8]) -> Result<()> {
        self.transport.send(bytes).await
    }

    pub(crate) async fn send_multiblock_init(
        &self,
        multiblock_id: u64,
        total_size: u64,
        answer_expected: bool,
    ) -> Result<()> {
        let message = MultiblockInit::new(
            self.next_message_id(),
            self.session_id(),
            multiblock_id,
            total_size,
            answer_expected,
        );
        self.send_frame(zerocopy_bytes(&message)).await
    }

    pub(crate) async fn send_multiblock_part(
        &self,
        multiblock_id: u64,
        total_part_number: u32,
        part_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        let message = MultiblockStatic::new(
            self.next_message_id(),
            self.session_id(),
            multiblock_id,
            total_part_number,
            part_id,
            payload,
        )?;
        self.send_frame(zerocopy_bytes(&message)).await
    }

    pub(crate) async fn send_multiblock_finish(
        &self,
        multiblock_id: u64,
        blocker_id: u64,
    ) -> Result<()> {
        let message = MultiblockFinish::new(
            self.next_message_id(),
            self.session_id(),
            multiblock_id,
            blocker_id,
        );
        self.send_frame(zerocopy_bytes(&message)).await
    }

    pub(crate) async fn send_multiblock_abort_reply(&self, multiblock_id: u64) -> Result<()> {
        let message =
            MultiblockAbortReply::new(self.next_message_id(), self.session_id(), multiblock_id);
        self.send_frame(zerocopy_bytes(&message)).await
    }

    // ------------------------------------------------------------------
    // internals shared with the dispatcher
    // ------------------------------------------------------------------

    /// Fire the error callback.
    pub(crate) async fn dispatch_error(&self, kind: ErrorKind, message: &str) {
        if let Some(me) = self.weak_self.upgrade() {
            self.handler().error(&me, kind, message).await;
        }
    }

    pub(crate) fn multiblock(&self) -> &Arc<MultiblockIo> {
        &self.multiblock
    }

    pub(crate) fn handler(&self) -> Arc<dyn SessionHandler> {
        self.lock_handler().clone()
    }

    async fn start_multiblock(
        &self,
        payload: Bytes,
        answer_expected: bool,
        blocker_id: u64,
    ) -> Result<u64> {
        let total_size = payload.len() as u64;
        let multiblock_id = self.multiblock.enqueue(payload, blocker_id);

        if let Err(error) =
            self.send_multiblock_init(multiblock_id, total_size, answer_expected).await
        {
            self.multiblock.remove_outgoing(multiblock_id);
            return Err(error);
        }

        Ok(multiblock_id)
    }

    fn require_active(&self, operation: &'static str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            tracing::debug!(
                session_id = self.session_id(),
                operation,
                "operation refused outside active state"
            );
            Err(CoreError::NotActive { session_id: self.session_id() })
        }
    }

    fn lock_statemachine(&self) -> MutexGuard<'_, Statemachine> {
        match self.statemachine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_linked(&self) -> MutexGuard<'_, Weak<Session>> {
        match self.linked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_handler(&self) -> MutexGuard<'_, Arc<dyn SessionHandler>> {
        match self.handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &format!("{:#010x}", self.session_id()))
            .field("state", &self.current_state())
            .field("client_side", &self.is_client_side())
            .finish_non_exhaustive()
    }
}

/// View a zerocopy message as its wire bytes.
fn zerocopy_bytes<T: zerocopy::IntoBytes + zerocopy::Immutable>(message: &T) -> &[u8] {
    message.as_bytes()
}
