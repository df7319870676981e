//! Core types for watcher data representation.
//!
//! ## Architecture
//!
//! The type system maps directly onto the device's watcher protocol:
//! - [`VarType`] is the closed set of element types, each carrying its byte
//!   width and buffer-size table entry
//! - [`VariableDescriptor`] describes one variable of the running project
//! - [`ParsedBuffer`] is a decoded data-channel body (dense, sparse or a
//!   single monitor sample)
//! - [`ConnectionMode`] names the device's exclusive connection slots
//!
//! ## Usage Example
//!
//! ```rust
//! use belawatch::types::{TimestampMode, VarType, VariableDescriptor};
//!
//! let var = VariableDescriptor::new("myvar", VarType::Float64, TimestampMode::Dense);
//! assert_eq!(var.data_length, 512);
//! assert_eq!(var.body_size(), 8 + 512 * 8);
//! ```

mod buffer;
mod update_rate;
mod var_type;
mod variable;

pub use buffer::{
    BufferEvent, DenseBuffer, MonitorSample, ParsedBuffer, Samples, SparseBuffer, Value,
};
pub use update_rate::UpdateRate;
pub use var_type::{REL_TIMESTAMP_SIZE, TIMESTAMP_SIZE, TimestampMode, VarType};
pub use variable::{ConnectionMode, VariableDescriptor};
