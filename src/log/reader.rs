//! Log file reader
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use belawatch::log::read_binary_file;
//! use belawatch::types::TimestampMode;
//!
//! fn dump() -> belawatch::Result<()> {
//!     let log = read_binary_file("myvar.bin", TimestampMode::Dense)?;
//!     println!("{} buffers of {}", log.buffers.len(), log.header.var_name);
//!     Ok(())
//! }
//! ```

use std::io::Cursor;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::format::LogFileHeader;
use crate::codec::decode_buffer_body;
use crate::types::{ConnectionMode, ParsedBuffer, TimestampMode};
use crate::{Result, WatcherError};

/// A fully decoded log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFile {
    pub header: LogFileHeader,
    pub timestamp_mode: TimestampMode,
    pub buffers: Vec<ParsedBuffer>,
}

/// Decodes on-device log files.
///
/// The whole file is loaded at construction; buffers are decoded lazily.
pub struct LogFileReader {
    data: Vec<u8>,
    path: PathBuf,
    header: LogFileHeader,
    timestamp_mode: TimestampMode,
    position: usize,
}

impl LogFileReader {
    pub fn open<P: AsRef<Path>>(path: P, timestamp_mode: TimestampMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| WatcherError::persistence(&path, e))?;
        Self::from_bytes_with_path(data, path, timestamp_mode)
    }

    pub fn from_bytes(data: Vec<u8>, timestamp_mode: TimestampMode) -> Result<Self> {
        Self::from_bytes_with_path(data, PathBuf::from("<memory>"), timestamp_mode)
    }

    fn from_bytes_with_path(
        data: Vec<u8>,
        path: PathBuf,
        timestamp_mode: TimestampMode,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(WatcherError::protocol("Log file", format!("{} is empty", path.display())));
        }
        let mut cursor = Cursor::new(data.as_slice());
        let header = LogFileHeader::parse_from_reader(&mut cursor)?;
        let position = cursor.position() as usize;
        debug!(
            path = %path.display(),
            var = %header.var_name,
            var_type = %header.var_type,
            "Opened log file"
        );
        Ok(Self { data, path, header, timestamp_mode, position })
    }

    pub fn header(&self) -> &LogFileHeader {
        &self.header
    }

    /// Size of one stored buffer.
    pub fn buffer_size(&self) -> usize {
        self.header.var_type.buffer_size(self.timestamp_mode)
    }

    /// Number of complete buffers remaining.
    pub fn remaining_buffers(&self) -> usize {
        (self.data.len() - self.position) / self.buffer_size()
    }

    /// Decode the next buffer, or `None` at end of file.
    ///
    /// A trailing partial buffer (the device was still writing) ends the read.
    pub fn read_next_buffer(&mut self) -> Result<Option<ParsedBuffer>> {
        let size = self.buffer_size();
        let remaining = self.data.len() - self.position;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < size {
            warn!(
                path = %self.path.display(),
                trailing = remaining,
                expected = size,
                "Ignoring partial buffer at end of log file"
            );
            self.position = self.data.len();
            return Ok(None);
        }

        let body = &self.data[self.position..self.position + size];
        let var_type = self.header.var_type;
        let buffer = decode_buffer_body(body, var_type, self.timestamp_mode, ConnectionMode::Log)?;
        self.position += size;
        Ok(Some(buffer))
    }

    pub fn into_log_file(mut self) -> Result<LogFile> {
        let mut buffers = Vec::with_capacity(self.remaining_buffers());
        while let Some(buffer) = self.read_next_buffer()? {
            buffers.push(buffer);
        }
        Ok(LogFile { header: self.header, timestamp_mode: self.timestamp_mode, buffers })
    }
}

/// Read and decode an entire log file.
pub fn read_binary_file<P: AsRef<Path>>(path: P, timestamp_mode: TimestampMode) -> Result<LogFile> {
    LogFileReader::open(path, timestamp_mode)?.into_log_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_buffer_body;
    use crate::types::{DenseBuffer, Samples, SparseBuffer, VarType};

    fn header(var_type: VarType) -> LogFileHeader {
        LogFileHeader {
            project_name: "watcher".into(),
            var_name: "myvar".into(),
            var_type,
            pid: 1,
            pid_id: 0,
        }
    }

    fn padded(mut body: Vec<u8>, size: usize) -> Vec<u8> {
        body.resize(size, 0);
        body
    }

    #[test]
    fn reads_dense_buffers_and_drops_partial_tail() {
        let h = header(VarType::Int32);
        let mut bytes = h.encode();
        for r in 0..3u64 {
            let buffer = ParsedBuffer::Dense(DenseBuffer {
                ref_timestamp: r * 1024,
                data: Samples::Int32((0..1024).map(|i| (r * 1024 + i) as i32).collect()),
            });
            let body = encode_buffer_body(&buffer, VarType::Int32).unwrap();
            bytes.extend(padded(body, VarType::Int32.buffer_size(TimestampMode::Dense)));
        }
        bytes.extend_from_slice(&[1, 2, 3, 4, 5]);

        let reader = LogFileReader::from_bytes(bytes, TimestampMode::Dense).unwrap();
        let log = reader.into_log_file().unwrap();
        assert_eq!(log.header, h);
        assert_eq!(log.buffers.len(), 3);
        for (r, b) in log.buffers.iter().enumerate() {
            assert_eq!(b.ref_timestamp(), r as u64 * 1024);
            assert_eq!(b.values_f64()[0], b.ref_timestamp() as f64);
        }
    }

    #[test]
    fn sparse_double_buffers_skip_padding() {
        let h = header(VarType::Float64);
        let size = VarType::Float64.buffer_size(TimestampMode::Sparse);
        let buffer = ParsedBuffer::Sparse(SparseBuffer {
            ref_timestamp: 500,
            data: Samples::Float64((0..341).map(|i| i as f64 * 0.5).collect()),
            rel_timestamps: (0..341).map(|i| i * 3).collect(),
        });
        let mut bytes = h.encode();
        for _ in 0..2 {
            bytes.extend(padded(encode_buffer_body(&buffer, VarType::Float64).unwrap(), size));
        }

        let mut reader = LogFileReader::from_bytes(bytes, TimestampMode::Sparse).unwrap();
        assert_eq!(reader.remaining_buffers(), 2);
        assert_eq!(reader.read_next_buffer().unwrap().as_ref(), Some(&buffer));
        assert_eq!(reader.read_next_buffer().unwrap().as_ref(), Some(&buffer));
        assert_eq!(reader.read_next_buffer().unwrap(), None);
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(LogFileReader::from_bytes(Vec::new(), TimestampMode::Dense).is_err());
    }
}
