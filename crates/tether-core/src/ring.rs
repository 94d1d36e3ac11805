//! Per-connection receive buffer.
//!
//! The transport's read task appends raw bytes here and hands the buffer to
//! the dispatcher, which consumes zero or more whole frames per invocation.
//! Partial frames stay buffered until more bytes arrive.

use bytes::{Buf, BytesMut};

/// Growable byte buffer between the transport and the dispatcher.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: BytesMut,
}

impl RecvBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8 * 1024) }
    }

    /// Append bytes delivered by the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    #[must_use]
    pub fn readable(&self) -> usize {
        self.buf.len()
    }

    /// View of all buffered bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `count` bytes from the front after the dispatcher processed
    /// them.
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.buf.len());
        self.buf.advance(count.min(self.buf.len()));
    }
}
