//! Channel transport to the device.
//!
//! ## Architecture
//!
//! ```text
//! WatcherConnection ── Connector ──> control channel (JSON)
//!        │                    └────> data channel (binary)
//!        └── ModeRegistry (one connection per mode slot)
//! ```
//!
//! [`WatcherConnection`] owns both channels of one connection. Channels are
//! opened through a [`Connector`]: [`WebSocketConnector`] for a real device,
//! [`loopback`] for in-process testing.

pub mod loopback;
mod registry;
mod transport;
mod watcher;
mod websocket;

pub use loopback::{LoopbackConnector, LoopbackPeer, loopback};
pub use registry::{Lease, ModeRegistry};
pub use transport::{Channel, Connector, MessageSink, MessageSource, WireMessage};
pub use watcher::WatcherConnection;
pub use websocket::WebSocketConnector;

#[cfg(test)]
mod tests;
