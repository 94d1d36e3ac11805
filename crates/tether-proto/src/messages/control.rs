//! Heartbeat and error frames.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    ErrorSubtype, FrameFlags, FrameHeader, FrameTrailer, HeartbeatSubtype, MAX_SINGLE_PAYLOAD,
    MessageType,
    errors::{ProtocolError, Result},
    messages::align8,
};

/// Liveness probe. Expects a `HEARTBEAT_REPLY`.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HeartbeatStart {
    /// Common frame header.
    pub header: FrameHeader,
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl HeartbeatStart {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a heartbeat probe.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::Heartbeat,
                HeartbeatSubtype::Start as u8,
                FrameFlags::NONE.with_reply_expected(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }
}

/// Heartbeat acknowledgment.
///
/// Carries no data; its only role is clearing the probe's reply-registry
/// entry on arrival.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HeartbeatReply {
    /// Common frame header.
    pub header: FrameHeader,
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl HeartbeatReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a reply echoing the probe's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::Heartbeat,
                HeartbeatSubtype::Reply as u8,
                FrameFlags::NONE.with_is_reply(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }
}

/// Fixed prefix of an error frame; the human-readable text follows.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ErrorMessageHeader {
    /// Common frame header.
    pub header: FrameHeader,
    message_size: [u8; 4],
}

impl ErrorMessageHeader {
    /// Serialized prefix size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Cast the leading bytes of an error frame to this prefix.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("error"))
    }

    /// Length of the error text in bytes.
    #[must_use]
    pub fn message_size(&self) -> u32 {
        u32::from_le_bytes(self.message_size)
    }

    /// The error text carried after the prefix.
    pub fn text<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        let start = Self::SIZE;
        let end = start + self.message_size() as usize;
        frame.get(start..end).ok_or(ProtocolError::MalformedBody("error"))
    }
}

/// Encode an error frame carrying `text`, truncated to the single-frame
/// budget.
#[must_use]
pub fn encode_error_message(
    subtype: ErrorSubtype,
    message_id: u32,
    session_id: u32,
    text: &str,
) -> Bytes {
    let text = text.as_bytes();
    let text_len = text.len().min(MAX_SINGLE_PAYLOAD - 1);
    let total = align8(ErrorMessageHeader::SIZE + text_len + FrameTrailer::SIZE);

    let prefix = ErrorMessageHeader {
        header: FrameHeader::new(
            MessageType::Error,
            subtype as u8,
            FrameFlags::NONE,
            message_id,
            session_id,
            total as u32,
        ),
        message_size: (text_len as u32).to_le_bytes(),
    };

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(prefix.as_bytes());
    buf.put_slice(&text[..text_len]);
    buf.resize(total - FrameTrailer::SIZE, 0);
    buf.put_slice(FrameTrailer::new().as_bytes());

    debug_assert_eq!(buf.len(), total);
    buf.freeze()
}
