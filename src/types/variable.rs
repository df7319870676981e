//! Watcher variable descriptors

use serde::{Deserialize, Serialize};

use super::{TimestampMode, VarType};

/// Metadata for one variable exposed by the running project.
///
/// Populated from a list query; immutable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    /// Variable name, unique per project
    pub name: String,
    /// Element type
    pub var_type: VarType,
    /// Timestamp layout of streamed buffers
    pub timestamp_mode: TimestampMode,
    /// Elements per streamed buffer
    pub data_length: usize,
    /// Monitoring period in milliseconds at list time (0 = not monitored)
    pub monitor: u32,
}

impl VariableDescriptor {
    pub fn new(name: impl Into<String>, var_type: VarType, timestamp_mode: TimestampMode) -> Self {
        Self {
            name: name.into(),
            var_type,
            timestamp_mode,
            data_length: var_type.data_length(timestamp_mode),
            monitor: 0,
        }
    }

    /// Exact byte length of a streamed body for this variable.
    pub fn body_size(&self) -> usize {
        self.var_type.body_size(self.timestamp_mode)
    }

    /// Byte length of one buffer in an on-device log file.
    pub fn buffer_size(&self) -> usize {
        self.var_type.buffer_size(self.timestamp_mode)
    }
}

/// The connection slot a client occupies on the device.
///
/// The device allows one active connection per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionMode {
    Watch,
    Stream,
    Log,
    Monitor,
    Control,
}

impl ConnectionMode {
    /// The slot that cannot be active at the same time as this one, if any.
    pub const fn exclusive_with(self) -> Option<ConnectionMode> {
        match self {
            ConnectionMode::Monitor => Some(ConnectionMode::Control),
            ConnectionMode::Control => Some(ConnectionMode::Monitor),
            _ => None,
        }
    }

    /// Whether data bodies on this slot are single monitor samples.
    pub const fn carries_samples(self) -> bool {
        matches!(self, ConnectionMode::Monitor)
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionMode::Watch => "WATCH",
            ConnectionMode::Stream => "STREAM",
            ConnectionMode::Log => "LOG",
            ConnectionMode::Monitor => "MONITOR",
            ConnectionMode::Control => "CONTROL",
        };
        f.write_str(text)
    }
}
