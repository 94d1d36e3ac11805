//! Session handshake and close frames.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, FrameHeader, FrameTrailer, MessageType, SessionSubtype,
    errors::{ProtocolError, Result},
};

/// Client-initiated handshake start.
///
/// Carries the client's tentative session id (low 16 bits hold the client
/// nonce) and the opaque session identifier that pre-identifies the session
/// on the server before any data frame.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SessionInitStart {
    /// Common frame header.
    pub header: FrameHeader,
    client_session_id: [u8; 4],
    session_identifier: [u8; 8],
    trailer: FrameTrailer,
}

impl SessionInitStart {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build an init-start frame. Expects an `INIT_REPLY` acknowledgment.
    #[must_use]
    pub fn new(message_id: u32, client_session_id: u32, session_identifier: u64) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::Session,
                SessionSubtype::InitStart as u8,
                FrameFlags::NONE.with_reply_expected(),
                message_id,
                client_session_id,
                Self::SIZE as u32,
            ),
            client_session_id: client_session_id.to_le_bytes(),
            session_identifier: session_identifier.to_le_bytes(),
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("session init start"))
    }

    /// Tentative id chosen by the client.
    #[must_use]
    pub fn client_session_id(&self) -> u32 {
        u32::from_le_bytes(self.client_session_id)
    }

    /// Opaque identifier supplied by the client.
    #[must_use]
    pub fn session_identifier(&self) -> u64 {
        u64::from_le_bytes(self.session_identifier)
    }
}

/// Server handshake confirmation.
///
/// Echoes the client's tentative id and carries the complete session id
/// composed of client nonce (low half) and server counter (high half).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SessionInitReply {
    /// Common frame header.
    pub header: FrameHeader,
    client_session_id: [u8; 4],
    complete_session_id: [u8; 4],
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl SessionInitReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build an init-reply echoing the init-start's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, client_session_id: u32, complete_session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::Session,
                SessionSubtype::InitReply as u8,
                FrameFlags::NONE.with_is_reply(),
                message_id,
                client_session_id,
                Self::SIZE as u32,
            ),
            client_session_id: client_session_id.to_le_bytes(),
            complete_session_id: complete_session_id.to_le_bytes(),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("session init reply"))
    }

    /// The tentative id the client used during the handshake.
    #[must_use]
    pub fn client_session_id(&self) -> u32 {
        u32::from_le_bytes(self.client_session_id)
    }

    /// The final id the session is registered under on both sides.
    #[must_use]
    pub fn complete_session_id(&self) -> u32 {
        u32::from_le_bytes(self.complete_session_id)
    }
}

/// Close handshake start.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SessionCloseStart {
    /// Common frame header.
    pub header: FrameHeader,
    reply_expected: u8,
    padding: [u8; 3],
    trailer: FrameTrailer,
}

impl SessionCloseStart {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a close-start frame.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32, reply_expected: bool) -> Self {
        let flags = if reply_expected {
            FrameFlags::NONE.with_reply_expected()
        } else {
            FrameFlags::NONE
        };
        Self {
            header: FrameHeader::new(
                MessageType::Session,
                SessionSubtype::CloseStart as u8,
                flags,
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            reply_expected: u8::from(reply_expected),
            padding: [0; 3],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("session close start"))
    }

    /// Whether the initiator expects a `CLOSE_REPLY`.
    #[must_use]
    pub fn reply_expected(&self) -> bool {
        self.reply_expected != 0
    }
}

/// Close handshake confirmation.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SessionCloseReply {
    /// Common frame header.
    pub header: FrameHeader,
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl SessionCloseReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a close-reply echoing the close-start's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::Session,
                SessionSubtype::CloseReply as u8,
                FrameFlags::NONE.with_is_reply(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("session close reply"))
    }
}
