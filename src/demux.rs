//! Data-channel frame demultiplexer
//!
//! The device interleaves buffers of every watched variable on a single data
//! channel. Each buffer travels as two messages: a short header naming the
//! variable's channel index and type, then the body. [`FrameDemultiplexer`]
//! pairs them up again.
//!
//! ## States
//!
//! ```text
//! ExpectHeader --header (<= 4 bytes)--> ExpectBody(header)
//! ExpectBody   --body (> 4 bytes)-----> ExpectHeader   (buffer emitted)
//! ExpectHeader --body-----------------> ExpectHeader   (ignored)
//! any          --fault----------------> ExpectHeader
//! ```
//!
//! One demultiplexer exists per connection; parse state is never shared.

use std::sync::Arc;

use tracing::trace;

use crate::Result;
use crate::codec::{BufferHeader, HEADER_MAX_LEN, decode_buffer_body, decode_buffer_header};
use crate::types::{ConnectionMode, ParsedBuffer, VariableDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    ExpectHeader,
    ExpectBody(BufferHeader),
}

/// A reassembled buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxedBuffer {
    pub channel: usize,
    pub name: String,
    pub buffer: ParsedBuffer,
}

#[derive(Debug)]
pub struct FrameDemultiplexer {
    state: ParseState,
    vars: Arc<[VariableDescriptor]>,
    mode: ConnectionMode,
}

impl FrameDemultiplexer {
    /// `vars` is the variable list queried at connect time, indexed by channel.
    pub fn new(vars: Arc<[VariableDescriptor]>, mode: ConnectionMode) -> Self {
        Self { state: ParseState::ExpectHeader, vars, mode }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feed one data-channel message.
    ///
    /// Returns a buffer when `message` completes a header/body pair. Faults
    /// (unsupported type, type mismatch, truncated body) drop the pending
    /// buffer and return the demultiplexer to `ExpectHeader`.
    pub fn push(&mut self, message: &[u8]) -> Result<Option<DemuxedBuffer>> {
        if message.len() <= HEADER_MAX_LEN {
            self.state = ParseState::ExpectHeader;
            let header = decode_buffer_header(message)?;
            header.check_against(&self.vars)?;
            trace!(channel = header.channel, var_type = %header.var_type, "Buffer header");
            self.state = ParseState::ExpectBody(header);
            return Ok(None);
        }

        let pending = std::mem::replace(&mut self.state, ParseState::ExpectHeader);
        let ParseState::ExpectBody(header) = pending else {
            trace!(len = message.len(), "Ignoring body without a header");
            return Ok(None);
        };
        let var = header.check_against(&self.vars)?;
        let buffer = decode_buffer_body(message, var.var_type, var.timestamp_mode, self.mode)?;
        trace!(channel = header.channel, var = %var.name, len = buffer.len(), "Buffer body");
        Ok(Some(DemuxedBuffer { channel: header.channel, name: var.name.clone(), buffer }))
    }
}
