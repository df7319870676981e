//! On-device log file support.
//!
//! The device can persist watched variables to binary log files in the
//! project directory. These modules decode such files once they have been
//! copied to the host.

pub mod format;
pub mod reader;

pub use format::{LogFileHeader, parse_null_terminated_string};
pub use reader::{LogFile, LogFileReader, read_binary_file};
