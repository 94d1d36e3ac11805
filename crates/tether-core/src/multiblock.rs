//! Multi-block transfer engine.
//!
//! Each session owns one engine holding the ordered outgoing queue and the
//! incoming reassembly table. A dedicated sender task drains the queue:
//! a message becomes *ready* when the peer accepts its `MULTI_INIT`, is
//! split into fixed-size parts, and finishes with `MULTI_FINISH` — or with
//! `MULTI_ABORT_REPLY` when it was cancelled between parts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tether_proto::MULTI_PART_PAYLOAD;
use tokio::sync::Notify;

use crate::session::Session;

/// Upper bound accepted for an announced transfer.
///
/// A `MULTI_INIT` asking for more than this is refused with a FAIL reply
/// instead of attempting the allocation.
pub const MAX_TRANSFER_SIZE: u64 = 1 << 30;

/// One queued outgoing transfer.
struct OutgoingMessage {
    multiblock_id: u64,
    payload: Bytes,
    ready: bool,
    currently_sending: bool,
    blocker_id: u64,
}

/// Snapshot handed to the sender task; `Bytes` makes the clone cheap.
#[derive(Clone)]
pub(crate) struct OutgoingSnapshot {
    pub multiblock_id: u64,
    pub payload: Bytes,
    pub blocker_id: u64,
}

struct IncomingMessage {
    total_size: u64,
    buffer: BytesMut,
}

/// Per-session multi-block state.
pub struct MultiblockIo {
    outgoing: Mutex<VecDeque<OutgoingMessage>>,
    incoming: Mutex<HashMap<u64, IncomingMessage>>,
    abort_current: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
}

impl MultiblockIo {
    /// A fresh engine with empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outgoing: Mutex::new(VecDeque::new()),
            incoming: Mutex::new(HashMap::new()),
            abort_current: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Queue a payload for transfer and pick its nonzero id.
    ///
    /// The message stays *queued* until the peer's `MULTI_INIT_REPLY{OK}`
    /// marks it ready.
    pub fn enqueue(&self, payload: Bytes, blocker_id: u64) -> u64 {
        let multiblock_id = self.fresh_id();

        self.lock_outgoing().push_back(OutgoingMessage {
            multiblock_id,
            payload,
            ready: false,
            currently_sending: false,
            blocker_id,
        });
        self.wake.notify_one();

        multiblock_id
    }

    /// Mark an outgoing transfer ready and wake the sender task.
    pub fn make_outgoing_ready(&self, multiblock_id: u64) -> bool {
        let found = {
            let mut outgoing = self.lock_outgoing();
            match outgoing.iter_mut().find(|m| m.multiblock_id == multiblock_id) {
                Some(message) => {
                    message.ready = true;
                    true
                }
                None => false,
            }
        };

        if found {
            self.wake.notify_one();
        }
        found
    }

    /// Remove an outgoing transfer.
    ///
    /// Returns `true` only when the message was still unsent and could be
    /// deleted outright. A message the sender task is currently draining is
    /// flagged instead; the task aborts after the part in flight.
    pub fn remove_outgoing(&self, multiblock_id: u64) -> bool {
        let mut outgoing = self.lock_outgoing();
        if let Some(index) = outgoing.iter().position(|m| m.multiblock_id == multiblock_id) {
            if outgoing[index].currently_sending {
                self.abort_current.store(true, Ordering::SeqCst);
                false
            } else {
                let _ = outgoing.remove(index);
                true
            }
        } else {
            false
        }
    }

    /// Drop every outgoing transfer during session teardown.
    pub fn cancel_all_outgoing(&self) {
        let mut outgoing = self.lock_outgoing();
        if outgoing.front().is_some_and(|m| m.currently_sending) {
            self.abort_current.store(true, Ordering::SeqCst);
        }
        outgoing.retain(|m| m.currently_sending);
    }

    /// Remove a refused transfer and return its blocker correlation, if
    /// any, so the parked caller can be woken empty-handed.
    pub(crate) fn fail_outgoing(&self, multiblock_id: u64) -> Option<u64> {
        let mut outgoing = self.lock_outgoing();
        let index = outgoing.iter().position(|m| m.multiblock_id == multiblock_id)?;
        let message = outgoing.remove(index)?;
        Some(message.blocker_id)
    }

    /// Allocate the reassembly buffer for an announced transfer.
    ///
    /// Returns `false` when the announced size is zero or exceeds
    /// [`MAX_TRANSFER_SIZE`]; the dispatcher answers with a FAIL reply.
    pub fn create_incoming(&self, multiblock_id: u64, total_size: u64) -> bool {
        if total_size == 0 || total_size > MAX_TRANSFER_SIZE {
            return false;
        }

        let buffer = BytesMut::with_capacity(total_size as usize);
        self.lock_incoming()
            .insert(multiblock_id, IncomingMessage { total_size, buffer });
        true
    }

    /// Append one part's payload to an incoming transfer.
    pub fn append_incoming(&self, multiblock_id: u64, payload: &[u8]) -> bool {
        let mut incoming = self.lock_incoming();
        match incoming.get_mut(&multiblock_id) {
            Some(message) => {
                message.buffer.extend_from_slice(payload);
                true
            }
            None => false,
        }
    }

    /// Take the assembled buffer of a finished transfer.
    pub fn finish_incoming(&self, multiblock_id: u64) -> Option<Bytes> {
        let message = self.lock_incoming().remove(&multiblock_id)?;
        if (message.buffer.len() as u64) != message.total_size {
            tracing::warn!(
                multiblock_id,
                expected = message.total_size,
                actual = message.buffer.len(),
                "multi-block transfer finished with size mismatch"
            );
        }
        Some(message.buffer.freeze())
    }

    /// Drop an incoming transfer after an abort.
    pub fn remove_incoming(&self, multiblock_id: u64) -> bool {
        self.lock_incoming().remove(&multiblock_id).is_some()
    }

    /// Stop the sender task during teardown.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Number of queued outgoing transfers.
    #[must_use]
    pub fn outgoing_len(&self) -> usize {
        self.lock_outgoing().len()
    }

    /// Number of open incoming transfers.
    #[must_use]
    pub fn incoming_len(&self) -> usize {
        self.lock_incoming().len()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn abort_requested(&self) -> bool {
        self.abort_current.load(Ordering::SeqCst)
    }

    /// Mark the head message as in flight and snapshot it, if ready.
    fn take_ready_head(&self) -> Option<OutgoingSnapshot> {
        let mut outgoing = self.lock_outgoing();
        let head = outgoing.front_mut()?;
        if !head.ready {
            return None;
        }
        head.currently_sending = true;
        Some(OutgoingSnapshot {
            multiblock_id: head.multiblock_id,
            payload: head.payload.clone(),
            blocker_id: head.blocker_id,
        })
    }

    /// Drop the drained head message and clear the abort flag.
    fn finish_current(&self) {
        self.lock_outgoing().pop_front();
        self.abort_current.store(false, Ordering::SeqCst);
    }

    /// A random id that is nonzero and unused by live transfers.
    fn fresh_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.r#gen();
            if id == 0 {
                continue;
            }
            let in_outgoing = self.lock_outgoing().iter().any(|m| m.multiblock_id == id);
            let in_incoming = self.lock_incoming().contains_key(&id);
            if !in_outgoing && !in_incoming {
                return id;
            }
        }
    }

    fn lock_outgoing(&self) -> std::sync::MutexGuard<'_, VecDeque<OutgoingMessage>> {
        match self.outgoing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_incoming(&self) -> std::sync::MutexGuard<'_, HashMap<u64, IncomingMessage>> {
        match self.incoming.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MultiblockIo {
    fn default() -> Self {
        Self::new()
    }
}

/// A random nonzero u64 for outgoing single-block and blocker ids.
#[must_use]
pub(crate) fn random_nonzero_u64() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.r#gen();
        if id != 0 {
            return id;
        }
    }
}

/// Spawn the per-session sender task draining the outgoing queue.
///
/// The task holds only a weak session reference; it exits when the session
/// is gone or the engine is stopped.
pub(crate) fn spawn_sender(session: Weak<Session>, engine: Arc<MultiblockIo>) {
    tokio::spawn(async move {
        loop {
            if engine.is_stopped() {
                break;
            }

            match engine.take_ready_head() {
                Some(snapshot) => {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    send_outgoing_data(&session, &engine, &snapshot).await;
                    drop(session);
                    engine.finish_current();
                }
                None => engine.wake.notified().await,
            }
        }
    });
}

/// Emit all parts of one transfer, then finish or abort it.
async fn send_outgoing_data(session: &Arc<Session>, engine: &MultiblockIo, message: &OutgoingSnapshot) {
    let total = message.payload.len();
    let total_part_number = total.div_ceil(MULTI_PART_PAYLOAD) as u32;

    let mut part_id: u32 = 0;
    let mut offset = 0;
    let mut failed = false;

    while offset < total && !engine.abort_requested() {
        let end = (offset + MULTI_PART_PAYLOAD).min(total);
        if let Err(error) = session
            .send_multiblock_part(
                message.multiblock_id,
                total_part_number,
                part_id,
                &message.payload[offset..end],
            )
            .await
        {
            tracing::warn!(multiblock_id = message.multiblock_id, %error, "part send failed");
            failed = true;
            break;
        }
        offset = end;
        part_id += 1;
    }

    if failed {
        return;
    }

    let result = if engine.abort_requested() {
        session.send_multiblock_abort_reply(message.multiblock_id).await
    } else {
        session.send_multiblock_finish(message.multiblock_id, message.blocker_id).await
    };

    if let Err(error) = result {
        tracing::warn!(multiblock_id = message.multiblock_id, %error, "finish send failed");
    }
}
