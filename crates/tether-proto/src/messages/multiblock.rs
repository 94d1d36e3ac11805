//! Multi-block transfer frames.
//!
//! Payloads exceeding the single-frame budget travel as a sender-driven
//! sequence: `INIT` announces the total size, `INIT_REPLY` accepts or
//! refuses it, `STATIC` frames carry the parts in ascending order, `FINISH`
//! completes the transfer and `ABORT_INIT`/`ABORT_REPLY` cancel it.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, FrameHeader, FrameTrailer, MULTI_PART_PAYLOAD, MessageType, MultiblockSubtype,
    errors::{ProtocolError, Result},
};

/// Transfer announcement.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockInit {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    total_size: [u8; 8],
    answer_expected: u8,
    padding: [u8; 3],
    trailer: FrameTrailer,
}

impl MultiblockInit {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build an init frame. Expects an `INIT_REPLY` acknowledgment.
    #[must_use]
    pub fn new(
        message_id: u32,
        session_id: u32,
        multiblock_id: u64,
        total_size: u64,
        answer_expected: bool,
    ) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::Init as u8,
                FrameFlags::NONE.with_reply_expected(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            total_size: total_size.to_le_bytes(),
            answer_expected: u8::from(answer_expected),
            padding: [0; 3],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block init"))
    }

    /// Transfer id, nonzero.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }

    /// Total payload size the receiver must prepare for.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        u64::from_le_bytes(self.total_size)
    }

    /// Whether the sender awaits a correlated response payload.
    #[must_use]
    pub fn answer_expected(&self) -> bool {
        self.answer_expected != 0
    }
}

/// Transfer accept/refuse answer.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockInitReply {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    status: u8,
    padding: [u8; 3],
    trailer: FrameTrailer,
}

impl MultiblockInitReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Transfer accepted.
    pub const OK: u8 = 0;
    /// Transfer refused (allocation failure on the receiver).
    pub const FAIL: u8 = 1;

    /// Build an init-reply echoing the init's `message_id`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32, multiblock_id: u64, status: u8) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::InitReply as u8,
                FrameFlags::NONE.with_is_reply(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            status,
            padding: [0; 3],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block init reply"))
    }

    /// Transfer id.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }

    /// [`Self::OK`] or [`Self::FAIL`].
    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }
}

/// One part of a fragmented payload.
///
/// The payload slot is fixed at [`MULTI_PART_PAYLOAD`] bytes;
/// `payload_size` gives the used prefix (only the final part is short).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockStatic {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    total_part_number: [u8; 4],
    part_id: [u8; 4],
    payload_size: [u8; 4],
    payload: [u8; MULTI_PART_PAYLOAD],
    trailer: FrameTrailer,
}

impl MultiblockStatic {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a part frame. `payload` must fit the part slot.
    pub fn new(
        message_id: u32,
        session_id: u32,
        multiblock_id: u64,
        total_part_number: u32,
        part_id: u32,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > MULTI_PART_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MULTI_PART_PAYLOAD,
            });
        }

        let mut slot = [0u8; MULTI_PART_PAYLOAD];
        slot[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::Static as u8,
                FrameFlags::NONE,
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            total_part_number: total_part_number.to_le_bytes(),
            part_id: part_id.to_le_bytes(),
            payload_size: (payload.len() as u32).to_le_bytes(),
            payload: slot,
            trailer: FrameTrailer::new(),
        })
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block static"))
    }

    /// Transfer id.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }

    /// Number of parts in the whole transfer.
    #[must_use]
    pub fn total_part_number(&self) -> u32 {
        u32::from_le_bytes(self.total_part_number)
    }

    /// Zero-based index of this part.
    #[must_use]
    pub fn part_id(&self) -> u32 {
        u32::from_le_bytes(self.part_id)
    }

    /// The used prefix of the part slot.
    pub fn payload(&self) -> Result<&[u8]> {
        let size = u32::from_le_bytes(self.payload_size) as usize;
        self.payload.get(..size).ok_or(ProtocolError::MalformedBody("multi-block static"))
    }
}

/// Transfer completion.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockFinish {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    blocker_id: [u8; 8],
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl MultiblockFinish {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build a finish frame.
    ///
    /// Sets the blocker-correlated flag iff `blocker_id` is nonzero, so
    /// the receiver routes the assembled buffer to the matching parked
    /// request instead of the standalone callback.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32, multiblock_id: u64, blocker_id: u64) -> Self {
        let mut flags = FrameFlags::NONE;
        if blocker_id != 0 {
            flags = flags.with_blocker_correlated();
        }
        Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::Finish as u8,
                flags,
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            blocker_id: blocker_id.to_le_bytes(),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block finish"))
    }

    /// Transfer id.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }

    /// Correlation id for a parked request, 0 when unused.
    #[must_use]
    pub fn blocker_id(&self) -> u64 {
        u64::from_le_bytes(self.blocker_id)
    }
}

/// Transfer cancellation request.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockAbortInit {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl MultiblockAbortInit {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build an abort request. Expects an `ABORT_REPLY`.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32, multiblock_id: u64) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::AbortInit as u8,
                FrameFlags::NONE.with_reply_expected(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block abort init"))
    }

    /// Transfer id.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }
}

/// Transfer cancellation confirmation.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MultiblockAbortReply {
    /// Common frame header.
    pub header: FrameHeader,
    multiblock_id: [u8; 8],
    padding: [u8; 4],
    trailer: FrameTrailer,
}

impl MultiblockAbortReply {
    /// Serialized frame size.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Build an abort confirmation.
    #[must_use]
    pub fn new(message_id: u32, session_id: u32, multiblock_id: u64) -> Self {
        Self {
            header: FrameHeader::new(
                MessageType::MultiblockData,
                MultiblockSubtype::AbortReply as u8,
                FrameFlags::NONE.with_is_reply(),
                message_id,
                session_id,
                Self::SIZE as u32,
            ),
            multiblock_id: multiblock_id.to_le_bytes(),
            padding: [0; 4],
            trailer: FrameTrailer::new(),
        }
    }

    /// Cast a whole frame to this layout.
    pub fn parse(frame: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(frame)
            .map(|(message, _)| message)
            .map_err(|_| ProtocolError::MalformedBody("multi-block abort reply"))
    }

    /// Transfer id.
    #[must_use]
    pub fn multiblock_id(&self) -> u64 {
        u64::from_le_bytes(self.multiblock_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_round_trip() {
        let message = MultiblockInit::new(1, 131_073, 0x1234, 2313, true);
        assert_eq!(MultiblockInit::SIZE, 40);

        let parsed = MultiblockInit::parse(message.as_bytes()).unwrap();
        assert_eq!(parsed.multiblock_id(), 0x1234);
        assert_eq!(parsed.total_size(), 2313);
        assert!(parsed.answer_expected());
        assert!(parsed.header.flags().reply_expected());
    }

    #[test]
    fn init_reply_status_values() {
        let ok = MultiblockInitReply::new(1, 1, 7, MultiblockInitReply::OK);
        assert_eq!(MultiblockInitReply::parse(ok.as_bytes()).unwrap().status(), 0);

        let fail = MultiblockInitReply::new(1, 1, 7, MultiblockInitReply::FAIL);
        assert_eq!(MultiblockInitReply::parse(fail.as_bytes()).unwrap().status(), 1);
        assert!(fail.header.flags().is_reply());
    }

    #[test]
    fn static_part_round_trip() {
        let payload = vec![7u8; 313];
        let message = MultiblockStatic::new(3, 131_073, 0x1234, 3, 2, &payload).unwrap();

        assert_eq!(MultiblockStatic::SIZE, 1040);
        let parsed = MultiblockStatic::parse(message.as_bytes()).unwrap();
        assert_eq!(parsed.part_id(), 2);
        assert_eq!(parsed.total_part_number(), 3);
        assert_eq!(parsed.payload().unwrap(), &payload[..]);
    }

    #[test]
    fn static_part_rejects_oversized_payload() {
        let payload = vec![0u8; MULTI_PART_PAYLOAD + 1];
        assert!(MultiblockStatic::new(1, 1, 1, 1, 0, &payload).is_err());
    }

    #[test]
    fn finish_correlation_flag_follows_blocker_id() {
        let plain = MultiblockFinish::new(4, 1, 9, 0);
        assert!(!plain.header.flags().blocker_correlated());

        let correlated = MultiblockFinish::new(4, 1, 9, 0xBEEF);
        assert!(correlated.header.flags().blocker_correlated());
        assert_eq!(
            MultiblockFinish::parse(correlated.as_bytes()).unwrap().blocker_id(),
            0xBEEF
        );
    }

    #[test]
    fn abort_frames_round_trip() {
        let init = MultiblockAbortInit::new(5, 1, 11);
        assert_eq!(MultiblockAbortInit::parse(init.as_bytes()).unwrap().multiblock_id(), 11);
        assert!(init.header.flags().reply_expected());

        let reply = MultiblockAbortReply::new(5, 1, 11);
        assert_eq!(MultiblockAbortReply::parse(reply.as_bytes()).unwrap().multiblock_id(), 11);
        assert!(reply.header.flags().is_reply());
    }
}
