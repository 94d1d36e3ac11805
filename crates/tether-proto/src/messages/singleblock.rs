//! Single-block standalone data frames.
//!
//! A single-block frame carries a complete standalone payload plus the
//! sender-chosen outgoing id. When the frame answers a parked request it
//! also carries the blocker id and sets the blocker-correlated header flag.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, FrameHeader, FrameTrailer, MAX_SINGLE_PAYLOAD, MessageType, SingleblockSubtype,
    errors::{ProtocolError, Result},
    messages::align8,
};

/// Single-block frame with a fixed payload slot.
///
/// Kept for wire compatibility; the sender side always emits the
/// payload-sized dynamic layout.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SingleblockStatic {
    /// Common frame header.
    pub header: FrameHeader,
    singleblock_id: [u8; 8],
    blocker_id: [u8; 8],
    payload_size: [u8; 4],
    payload: [u8; MAX_SINGLE_PAYLOAD],
    trailer: FrameTrailer,
}

impl SingleblockStatic {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("single-block static"))
    }

    /// Sender-chosen outgoing id.
    #[must_use]
    pub fn singleblock_id(&self) -> u64 {
        u64::from_le_bytes(self.singleblock_id)
    }

    /// Correlation id for a parked request, 0 when unused.
    #[must_use]
    pub fn blocker_id(&self) -> u64 {
        u64::from_le_bytes(self.blocker_id)
    }

    /// The used prefix of the payload slot.
    pub fn payload(&self) -> Result<&[u8]> {
        let size = u32::from_le_bytes(self.payload_size) as usize;
        self.payload.get(..size).ok_or(ProtocolError::MalformedBody("single-block static"))
    }
}

/// Fixed prefix of a dynamic single-block frame; the payload follows.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SingleblockDynamicHeader {
    /// Common frame header.
    pub header: FrameHeader,
    singleblock_id: [u8; 8],
    blocker_id: [u8; 8],
    payload_size: [u8; 4],
}

impl SingleblockDynamicHeader {
    /// Serialized prefix size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Cast the leading bytes of a dynamic single-block frame.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("single-block dynamic"))
    }

    /// Sender-chosen outgoing id.
    #[must_use]
    pub fn singleblock_id(&self) -> u64 {
        u64::from_le_bytes(self.singleblock_id)
    }

    /// Correlation id for a parked request, 0 when unused.
    #[must_use]
    pub fn blocker_id(&self) -> u64 {
        u64::from_le_bytes(self.blocker_id)
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
        frame.get(start..end).ok_or(ProtocolError::MalformedBody("single-block dynamic"))
    }
}

/// Encode a payload-sized single-block frame.
///
/// Sets `REPLY_EXPECTED` so the peer acknowledges receipt, and
/// `BLOCKER_CORRELATED` iff `blocker_id` is nonzero.
pub fn encode_singleblock_dynamic(
    message_id: u32,
    session_id: u32,
    singleblock_id: u64,
    blocker_id: u64,
    payload: &[u8],
) -> Result<Bytes> {
    if payload.len() > MAX_SINGLE_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max: MAX_SINGLE_PAYLOAD });
    }

    let mut flags = FrameFlags::NONE.with_reply_expected();
    if blocker_id != 0 {
        flags = flags.with_blocker_correlated();
    }

    let total = align8(SingleblockDynamicHeader::SIZE + payload.len() + FrameTrailer::SIZE);

    let prefix = SingleblockDynamicHeader {
        header: FrameHeader::new(
            MessageType::SingleblockData,
            SingleblockSubtype::Dynamic as u8,
            flags,
            message_id,
            session_id,
            total as u32,
        ),
        singleblock_id: singleblock_id.to_le_bytes(),
        blocker_id: blocker_id.to_le_bytes(),
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

/// Single-block acknowledgment, no payload.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SingleblockReply {
    /// Common frame header.
    pub header: FrameHeader,
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl SingleblockReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a reply echoing the data frame's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::SingleblockData,
                SingleblockSubtype::Reply as u8,
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
