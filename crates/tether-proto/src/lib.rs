//! Wire format for the Tether session protocol.
//!
//! Every frame is a fixed 16-byte [`FrameHeader`], a typed body and a
//! 4-byte [`FrameTrailer`] sentinel. All integers are little-endian,
//! `total_size` is always a multiple of 8, and parsing is zero-copy via
//! `zerocopy` packed structs.
//!
//! This crate is pure data: it knows nothing about sessions, transports or
//! timers. The protocol engine lives in `tether-core`.

pub mod errors;
mod header;
pub mod messages;
mod types;

pub use errors::ProtocolError;
pub use header::{FrameHeader, FrameTrailer};
pub use types::{
    ErrorKind, ErrorSubtype, FrameFlags, HeartbeatSubtype, MessageType, MultiblockSubtype,
    SessionSubtype, SingleblockSubtype, StreamSubtype,
};

/// The single supported protocol version byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Trailer sentinel constant closing every frame.
pub const END_SENTINEL: u32 = 0x4E59_4141;

/// Largest payload a single stream or single-block frame carries.
///
/// Defined once; stream chunking, single-block eligibility and error-text
/// truncation all use this constant.
pub const MAX_SINGLE_PAYLOAD: usize = 1024;

/// Payload slot size of one multi-block part frame.
pub const MULTI_PART_PAYLOAD: usize = 1000;
