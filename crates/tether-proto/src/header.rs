//! Frame header and trailer with zero-copy parsing.
//!
//! Every frame starts with a fixed 16-byte header and ends with a 4-byte
//! trailer sentinel. All multi-byte integers are little-endian and stored
//! as raw byte arrays to avoid alignment issues; `zerocopy` verifies the
//! layout at compile time so untrusted bytes can be cast without copies.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, MessageType, PROTOCOL_VERSION,
    errors::{ProtocolError, Result},
};

/// Fixed 16-byte frame header (little-endian).
///
/// Layout on the wire:
/// `type:u8, sub_type:u8, version:u8, flags:u8, message_id:u32,
/// session_id:u32, total_size:u32`
///
/// `total_size` covers the whole frame including this header and the
/// trailer, and must be a multiple of 8. It is authoritative when skipping
/// frames of unknown type, which keeps the header layout forward
/// compatible across versions.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    msg_type: u8,
    sub_type: u8,
    version: u8,
    flags: u8,
    message_id: [u8; 4],
    session_id: [u8; 4],
    total_size: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 16;

    /// Create a header for the given category and sub-type.
    ///
    /// The version byte is always [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn new(
        msg_type: MessageType,
        sub_type: u8,
        flags: FrameFlags,
        message_id: u32,
        session_id: u32,
        total_size: u32,
    ) -> Self {
        Self {
            msg_type: msg_type.to_u8(),
            sub_type,
            version: PROTOCOL_VERSION,
            flags: flags.to_byte(),
            message_id: message_id.to_le_bytes(),
            session_id: session_id.to_le_bytes(),
            total_size: total_size.to_le_bytes(),
        }
    }

    /// Cast the leading bytes of a buffer to a header reference.
    ///
    /// Performs no semantic validation beyond length; version and size
    /// checks are the dispatcher's responsibility so it can answer a bad
    /// header with the proper error frame.
    pub fn peek(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(bytes).map(|(header, _)| header).map_err(|_| {
            ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() }
        })
    }

    /// Serialize to a fixed byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(self.as_bytes());
        arr
    }

    /// Raw category byte.
    #[must_use]
    pub fn raw_type(&self) -> u8 {
        self.msg_type
    }

    /// Frame category as enum. `None` if unrecognized.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    /// Discriminator within the category.
    #[must_use]
    pub fn sub_type(&self) -> u8 {
        self.sub_type
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Header flag bits.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    /// Per-session monotonic id assigned by the sender.
    #[must_use]
    pub fn message_id(&self) -> u32 {
        u32::from_le_bytes(self.message_id)
    }

    /// Recipient's session id from the sender's view.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        u32::from_le_bytes(self.session_id)
    }

    /// Total frame size including header and trailer.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        u32::from_le_bytes(self.total_size)
    }

    /// Composite reply-registry key: `(message_id << 32) | session_id`.
    #[must_use]
    pub fn reply_key(&self) -> u64 {
        (u64::from(self.message_id()) << 32) | u64::from(self.session_id())
    }

    /// Update the flag byte.
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.to_byte();
    }

    /// Update the session id.
    pub fn set_session_id(&mut self, session_id: u32) {
        self.session_id = session_id.to_le_bytes();
    }

    /// Update the total frame size.
    pub fn set_total_size(&mut self, total_size: u32) {
        self.total_size = total_size.to_le_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("type", &self.msg_type)
            .field("sub_type", &self.sub_type)
            .field("version", &self.version)
            .field("flags", &self.flags())
            .field("message_id", &self.message_id())
            .field("session_id", &format!("{:#010x}", self.session_id()))
            .field("total_size", &self.total_size())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

/// Fixed 4-byte frame trailer carrying the end sentinel.
///
/// The sentinel detects frame-boundary corruption: a frame whose trailing
/// word is not [`crate::END_SENTINEL`] is rejected as invalid.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameTrailer {
    end: [u8; 4],
}

impl FrameTrailer {
    /// Size of the serialized trailer.
    pub const SIZE: usize = 4;

    /// A trailer carrying the protocol sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self { end: crate::END_SENTINEL.to_le_bytes() }
    }

    /// Check the sentinel value.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        u32::from_le_bytes(self.end) == crate::END_SENTINEL
    }

    /// Check the trailing 4 bytes of a whole frame.
    ///
    /// `frame` must hold the complete frame; the sentinel is read at
    /// `total_size - 4`.
    pub fn validate_frame(frame: &[u8]) -> Result<()> {
        let start = frame
            .len()
            .checked_sub(Self::SIZE)
            .ok_or(ProtocolError::FrameTooShort { expected: Self::SIZE, actual: frame.len() })?;
        let tail: [u8; 4] = frame[start..]
            .try_into()
            .map_err(|_| ProtocolError::FrameTooShort { expected: Self::SIZE, actual: 0 })?;
        if u32::from_le_bytes(tail) == crate::END_SENTINEL {
            Ok(())
        } else {
            Err(ProtocolError::SentinelMismatch)
        }
    }
}

impl Default for FrameTrailer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameTrailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTrailer").field("end", &u32::from_le_bytes(self.end)).finish()
    }
}
