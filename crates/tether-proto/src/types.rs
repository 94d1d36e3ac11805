//! Frame type constants, sub-type discriminators and header flags.

/// Top-level frame category carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Reserved zero value.
    Undefined = 0,
    /// Session handshake and close control frames.
    Session = 1,
    /// Liveness probes.
    Heartbeat = 2,
    /// Protocol-level error reports.
    Error = 3,
    /// Standalone payloads that fit a single frame.
    SingleblockData = 4,
    /// Fragmented standalone payloads.
    MultiblockData = 5,
    /// Fire-and-forget stream payloads.
    StreamData = 6,
}

impl MessageType {
    /// Decode from the wire byte. `None` for unknown categories.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Session),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Error),
            4 => Some(Self::SingleblockData),
            5 => Some(Self::MultiblockData),
            6 => Some(Self::StreamData),
            _ => None,
        }
    }

    /// Wire byte of this category.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Sub-types of [`MessageType::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionSubtype {
    /// Client-initiated handshake start.
    InitStart = 1,
    /// Server handshake confirmation carrying the complete session id.
    InitReply = 2,
    /// Close handshake start.
    CloseStart = 3,
    /// Close handshake confirmation.
    CloseReply = 4,
}

/// Sub-types of [`MessageType::Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeartbeatSubtype {
    /// Probe.
    Start = 1,
    /// Probe acknowledgment.
    Reply = 2,
}

/// Sub-types of [`MessageType::Error`]. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorSubtype {
    /// Peer announced an unsupported protocol version.
    FalseVersion = 1,
    /// Peer referenced a session id we do not know.
    UnknownSession = 2,
    /// Frame failed size or sentinel validation.
    InvalidMessage = 3,
}

/// Sub-types of [`MessageType::SingleblockData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SingleblockSubtype {
    /// Fixed-capacity payload slot.
    Static = 1,
    /// Payload-sized frame.
    Dynamic = 2,
    /// Acknowledgment, no payload.
    Reply = 3,
}

/// Sub-types of [`MessageType::MultiblockData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MultiblockSubtype {
    /// Transfer announcement with total size.
    Init = 4,
    /// Accept or refuse an announced transfer.
    InitReply = 5,
    /// One part of the fragmented payload.
    Static = 6,
    /// All parts sent.
    Finish = 7,
    /// Cancel an in-flight transfer.
    AbortInit = 8,
    /// Cancel confirmation.
    AbortReply = 9,
}

/// Sub-types of [`MessageType::StreamData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamSubtype {
    /// Fixed-capacity payload slot.
    Static = 1,
    /// Payload-sized frame.
    Dynamic = 2,
    /// Acknowledgment, no payload.
    Reply = 3,
}

/// Error classification surfaced through the error callback.
///
/// The first four values double as wire error sub-types; the rest are
/// local-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// Reserved zero value.
    Undefined = 0,
    /// Received header had a version other than [`crate::PROTOCOL_VERSION`].
    FalseVersion = 1,
    /// Received frame references an unregistered session id.
    UnknownSession = 2,
    /// Trailer sentinel missing or size inconsistent.
    InvalidMessageSize = 3,
    /// Reply or response not received in time.
    MessageTimeout = 4,
    /// Peer refused a multi-block init or local allocation failed.
    MultiblockFailed = 5,
}

impl ErrorKind {
    /// Map a wire error sub-type to the matching kind.
    #[must_use]
    pub fn from_subtype(subtype: ErrorSubtype) -> Self {
        match subtype {
            ErrorSubtype::FalseVersion => Self::FalseVersion,
            ErrorSubtype::UnknownSession => Self::UnknownSession,
            ErrorSubtype::InvalidMessage => Self::InvalidMessageSize,
        }
    }
}

/// Header flag bitfield.
///
/// bit0 = reply expected, bit1 = is reply, bit3 = blocker correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    const REPLY_EXPECTED: u8 = 0x1;
    const IS_REPLY: u8 = 0x2;
    const BLOCKER_CORRELATED: u8 = 0x8;

    /// Reconstruct from the wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Wire byte of this flag set.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// The sender expects an acknowledgment frame.
    #[must_use]
    pub fn reply_expected(self) -> bool {
        self.0 & Self::REPLY_EXPECTED != 0
    }

    /// This frame acknowledges an earlier reply-expecting frame.
    #[must_use]
    pub fn is_reply(self) -> bool {
        self.0 & Self::IS_REPLY != 0
    }

    /// This frame carries a blocker id correlating it to a parked request.
    #[must_use]
    pub fn blocker_correlated(self) -> bool {
        self.0 & Self::BLOCKER_CORRELATED != 0
    }

    /// Set the reply-expected bit.
    #[must_use]
    pub fn with_reply_expected(self) -> Self {
        Self(self.0 | Self::REPLY_EXPECTED)
    }

    /// Set the is-reply bit.
    #[must_use]
    pub fn with_is_reply(self) -> Self {
        Self(self.0 | Self::IS_REPLY)
    }

    /// Set the blocker-correlated bit.
    #[must_use]
    pub fn with_blocker_correlated(self) -> Self {
        Self(self.0 | Self::BLOCKER_CORRELATED)
    }
}
