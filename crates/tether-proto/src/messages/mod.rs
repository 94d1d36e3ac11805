//! Typed frame bodies for every (type, sub-type) pair.
//!
//! Fixed-layout frames are complete packed structs (header + body +
//! trailer) that serialize via `zerocopy`; dynamically sized frames expose
//! a packed prefix struct plus an encode helper that appends the payload,
//! pads the total size to a multiple of 8 and writes the trailer.

mod control;
mod multiblock;
mod session;
mod singleblock;
mod stream;

pub use control::{ErrorMessageHeader, HeartbeatReply, HeartbeatStart, encode_error_message};
pub use multiblock::{
    MultiblockAbortInit, MultiblockAbortReply, MultiblockFinish, MultiblockInit,
    MultiblockInitReply, MultiblockStatic,
};
pub use session::{SessionCloseReply, SessionCloseStart, SessionInitReply, SessionInitStart};
pub use singleblock::{
    SingleblockDynamicHeader, SingleblockReply, SingleblockStatic, encode_singleblock_dynamic,
};
pub use stream::{StreamDynamicHeader, StreamReply, StreamStatic, encode_stream_dynamic};

/// Round `size` up to the next multiple of 8.
///
/// Every frame's `total_size` must satisfy this alignment.
#[must_use]
pub fn align8(size: usize) -> usize {
    size.next_multiple_of(8)
}
