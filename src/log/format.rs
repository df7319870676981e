//! On-device log file header
//!
//! A log file written by the device starts with a small header record:
//!
//! 1. Null-terminated project name
//! 2. Null-terminated variable name
//! 3. Null-terminated type tag
//! 4. `u32` pid and `u32` pid id (little-endian)
//! 5. Zero to three padding bytes bringing the header to a 4-byte boundary
//!
//! Buffer bodies follow, each padded to [`VarType::buffer_size`].

use std::io::Read;

use tracing::trace;

use crate::types::VarType;
use crate::{Result, WatcherError};

/// Decoded log-file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileHeader {
    pub project_name: String,
    pub var_name: String,
    pub var_type: VarType,
    pub pid: u32,
    pub pid_id: u32,
}

impl LogFileHeader {
    pub fn parse_from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let project_name = parse_null_terminated_string(reader)?;
        let var_name = parse_null_terminated_string(reader)?;
        let type_text = parse_null_terminated_string(reader)?;
        let tag = type_text
            .chars()
            .next()
            .ok_or_else(|| WatcherError::protocol("Log file header", "empty type tag"))?;
        let var_type = VarType::from_tag(tag)?;

        let pid = read_u32(reader, "pid")?;
        let pid_id = read_u32(reader, "pid id")?;

        let header = Self { project_name, var_name, var_type, pid, pid_id };
        let padding = header.padding_len();
        if padding > 0 {
            let mut pad = [0u8; 3];
            reader.read_exact(&mut pad[..padding]).map_err(|e| {
                let details = format!("missing {padding} padding bytes: {e}");
                WatcherError::protocol("Log file header", details)
            })?;
        }
        trace!(var = %header.var_name, size = header.encoded_len(), "Parsed log file header");
        Ok(header)
    }

    /// Header length before padding.
    fn unpadded_len(&self) -> usize {
        self.project_name.len() + self.var_name.len() + 1 + 3 + 8
    }

    fn padding_len(&self) -> usize {
        (4 - self.unpadded_len() % 4) % 4
    }

    /// Header length on disk, padding included.
    pub fn encoded_len(&self) -> usize {
        self.unpadded_len() + self.padding_len()
    }

    /// Write the header the way the device does.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for text in [self.project_name.as_str(), self.var_name.as_str()] {
            out.extend_from_slice(text.as_bytes());
            out.push(0);
        }
        out.push(self.var_type.tag() as u8);
        out.push(0);
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.pid_id.to_le_bytes());
        out.resize(self.encoded_len(), 0);
        out
    }
}

/// Read bytes up to (and consuming) the next NUL.
pub fn parse_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).map_err(|e| {
            let details = format!("unterminated string after {} bytes: {e}", bytes.len());
            WatcherError::protocol("Log file header", details)
        })?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|e| {
        WatcherError::protocol("Log file header", format!("string is not UTF-8: {e}"))
    })
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| {
        WatcherError::protocol("Log file header", format!("failed to read {what}: {e}"))
    })?;
    Ok(u32::from_le_bytes(buf))
}
