//! Async host client for the Bela watcher protocol.
//!
//! A Bela device running a watcher-enabled project exposes its variables
//! over two WebSocket channels: JSON commands on the control channel and
//! binary buffers on the data channel. This crate speaks both sides of that
//! link from the host.
//!
//! # Features
//!
//! - **Streaming**: full buffers of any variable, forever, for a number of
//!   values, or on a device-side schedule ([`Streamer`])
//! - **Monitoring**: periodic timestamped samples and one-shot peeks ([`Monitor`])
//! - **Logging**: binary log files recorded on the device, copied back and
//!   decoded on the host ([`Logger`], [`log`])
//! - **Saving and callbacks**: streamed buffers appended to JSON-lines files
//!   and handed to user callbacks off the receive path
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use belawatch::{LinkConfig, SessionOptions, Streamer};
//!
//! #[tokio::main]
//! async fn main() -> belawatch::Result<()> {
//!     let streamer = Streamer::new(LinkConfig::default());
//!     streamer.connect().await?;
//!
//!     let queues = streamer.stream_n_values(&["myvar"], 4096, SessionOptions::default()).await?;
//!     for buffer in &queues["myvar"] {
//!         println!("{} values from frame {}", buffer.len(), buffer.ref_timestamp());
//!     }
//!     streamer.disconnect().await;
//!     Ok(())
//! }
//! ```

// Wire formats and types
pub mod codec;
mod error;
pub mod types;

// Device link
mod config;
pub mod connection;
pub mod demux;

// Sessions
pub mod callback;
pub mod logger;
pub mod persist;
pub mod session;
pub mod stream;
pub mod transfer;

// Data source modules
pub mod log;

#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Core exports
pub use config::LinkConfig;
pub use error::*;
pub use types::*;

// Session exports
pub use callback::{Callback, CallbackStats};
pub use logger::{LoggedFile, Logger, LoggingMode};
pub use session::{
    Monitor, QueueSnapshot, SessionOptions, Streamer, StreamingMode, TimestampedValues,
};
pub use transfer::{BlockingTransfer, FileTransfer, LocalFsTransfer};
