//! Buffer header messages

use crate::types::{VarType, VariableDescriptor};
use crate::{Result, WatcherError};

/// Data-channel messages at most this long are buffer headers.
pub const HEADER_MAX_LEN: usize = 4;

/// A decoded buffer header: which variable the next body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Index of the variable in the watcher list
    pub channel: usize,
    /// Element type announced on the wire
    pub var_type: VarType,
}

impl BufferHeader {
    /// Check the announced type against the variable list queried at connect time.
    ///
    /// A disagreement means host and device have drifted apart.
    pub fn check_against<'a>(
        &self,
        vars: &'a [VariableDescriptor],
    ) -> Result<&'a VariableDescriptor> {
        let declared = vars.get(self.channel).ok_or_else(|| {
            WatcherError::protocol(
                "Buffer header",
                format!("channel {} is out of range ({} variables)", self.channel, vars.len()),
            )
        })?;
        if declared.var_type != self.var_type {
            return Err(WatcherError::TypeMismatch {
                channel: self.channel,
                declared: declared.var_type,
                received: self.var_type,
            });
        }
        Ok(declared)
    }
}

/// Decode a header message of the form `<index digits><type tag>`.
///
/// Any non-word bytes between the digits and the tag (and trailing NULs) are
/// ignored.
pub fn decode_buffer_header(message: &[u8]) -> Result<BufferHeader> {
    let digits = message.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(WatcherError::protocol(
            "Buffer header",
            format!("no channel index in header {message:?}"),
        ));
    }

    let channel = std::str::from_utf8(&message[..digits])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| WatcherError::protocol("Buffer header", "channel index is not a number"))?;

    let tag = message[digits..]
        .iter()
        .find(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .map(|&b| b as char)
        .ok_or_else(|| {
            WatcherError::protocol("Buffer header", format!("no type tag in header {message:?}"))
        })?;

    Ok(BufferHeader { channel, var_type: VarType::from_tag(tag)? })
}

/// Encode a header message as the device sends it.
pub fn encode_buffer_header(channel: usize, var_type: VarType) -> Vec<u8> {
    let mut out = format!("{channel}{}", var_type.tag()).into_bytes();
    out.push(0);
    out
}
