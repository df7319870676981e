//! Binary and JSON wire formats.
//!
//! Stateless encode/decode functions for everything that crosses the device
//! link:
//!
//! 1. **Buffer headers** - short `<index digits><type tag>` messages that
//!    announce which variable the next data message belongs to
//! 2. **Buffer bodies** - `uint64 ref_timestamp || data [|| rel_timestamps]`
//!    for streamed buffers, `uint64 timestamp || value` for monitor samples
//! 3. **Outbound buffers** - `<u32 id><4-byte tag><u32 length><4 pad>` followed
//!    by packed values, pushed from host to device
//! 4. **Control messages** - JSON commands and responses on the control channel
//!
//! All binary integers and floats are little-endian. Bodies may arrive with
//! trailing padding; decoders read exactly the expected byte count and never
//! past it.

mod body;
mod control;
mod header;
mod outbound;

pub use body::{decode_buffer_body, encode_buffer_body};
pub use control::{
    ConnectionEvent, ControlMessage, ListResponse, LogResponse, WatcherCommand, WatcherEntry,
    WatcherRequest, parse_control_message,
};
pub use header::{BufferHeader, HEADER_MAX_LEN, decode_buffer_header, encode_buffer_header};
pub use outbound::{
    OUTBOUND_HEADER_SIZE, OutboundBuffer, decode_outbound_buffer, encode_outbound_buffer,
};

use crate::{Result, WatcherError};

/// Bounds-checked little-endian readers shared by the decoders.
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| insufficient("u32", offset, 4, data.len()))
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| insufficient("u64", offset, 8, data.len()))
}

fn insufficient(what: &str, offset: usize, need: usize, have: usize) -> WatcherError {
    WatcherError::protocol(
        "Integer parsing",
        format!("Insufficient data for {what} at offset {offset} (need {need} bytes, have {have})"),
    )
}
