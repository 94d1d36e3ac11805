//! Stream data frames.
//!
//! Stream payloads are delivered to the receiver's stream callback and are
//! never reassembled; large payloads are chunked by the session before
//! encoding. Full-capacity chunks use the fixed [`StreamStatic`] layout,
//! smaller ones the payload-sized dynamic layout.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, FrameHeader, FrameTrailer, MAX_SINGLE_PAYLOAD, MessageType, StreamSubtype,
    errors::{ProtocolError, Result},
    messages::align8,
};

/// Stream frame with a fixed payload slot of [`MAX_SINGLE_PAYLOAD`] bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamStatic {
    /// Common frame header.
    pub header: FrameHeader,
    payload_size: [u8; 4],
    payload: [u8; MAX_SINGLE_PAYLOAD],
    trailer: FrameTrailer,
}

impl StreamStatic {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a static stream frame. `payload` must fit the slot.
    pub fn new(
        message_id: u32,
        session_id: u32,
        payload: &[u8],
        reply_expected: bool,
    ) -> Result<Self> {
        if payload.len() > MAX_SINGLE_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_SINGLE_PAYLOAD,
            });
        }

        let flags = if reply_expected {
            FrameFlags::NONE.with_reply_expected()
        } else {
            FrameFlags::NONE
        };

        let mut slot = [0u8; MAX_SINGLE_PAYLOAD];
        slot[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            header: FrameHeader::new(
                MessageType::StreamData,
                StreamSubtype::Static as u8,
                flags,
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            payload_size: (payload.len() as u32).to_le_bytes(),
            payload: slot,
            trailer: FrameTrailer::new(),
        })
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("stream static"))
    }

    /// The used prefix of the payload slot.
    pub fn payload(&self) -> Result<&[u8]> {
        let size = u32::from_le_bytes(self.payload_size) as usize;
        self.payload.get(..size).ok_or(ProtocolError::MalformedBody("stream static"))
    }
}

/// Fixed prefix of a dynamic stream frame; the payload follows.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamDynamicHeader {
    /// Common frame header.
    pub header: FrameHeader,
    payload_size: [u8; 4],
}

impl StreamDynamicHeader {
    /// Serialized prefix size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Cast the leading bytes of a dynamic stream frame to this prefix.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("stream dynamic"))
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_le_bytes(self.payload_size)
    }

    /// The payload carried after the prefix.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        let start = Self::SIZE;
        let end = start + self.payload_size() as usize;
        frame.get(start..end).ok_or(ProtocolError::MalformedBody("stream dynamic"))
    }
}

/// Encode a payload-sized stream frame, padded to the 8-byte rule.
pub fn encode_stream_dynamic(
    message_id: u32,
    session_id: u32,
    payload: &[u8],
    reply_expected: bool,
) -> Result<Bytes> {
    if payload.len() > MAX_SINGLE_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max: MAX_SINGLE_PAYLOAD });
    }

    let flags =
        if reply_expected { FrameFlags::NONE.with_reply_expected() } else { FrameFlags::NONE };
    let total = align8(StreamDynamicHeader::SIZE + payload.len() + FrameTrailer::SIZE);

    let prefix = StreamDynamicHeader {
        header: FrameHeader::new(
            MessageType::StreamData,
            StreamSubtype::Dynamic as u8,
            flags,
            message_id,
            session_id,
            total as u32,
        ),
        payload_size: (payload.len() as u32).to_le_bytes(),
    };

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(prefix.as_bytes());
    buf.put_slice(payload);
    buf.resize(total - FrameTrailer::SIZE, 0);
    buf.put_slice(FrameTrailer::new().as_bytes());

    debug_assert_eq!(buf.len(), total);
    Ok(buf.freeze())
}

/// Stream acknowledgment, no payload.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StreamReply {
    /// Common frame header.
    pub header: FrameHeader,
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl StreamReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a reply echoing the data frame's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::StreamData,
                StreamSubtype::Reply as u8,
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
