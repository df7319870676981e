//! Message-level channel abstraction
//!
//! The watcher talks to the device over two persistent message channels.
//! [`Connector`] opens one channel to a URL and hands back independent
//! send and receive halves, so the real WebSocket transport and the
//! in-process loopback used by tests are interchangeable.

use async_trait::async_trait;

use crate::Result;

/// A single message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(t) => t.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireMessage::Text(t) => t.as_bytes(),
            WireMessage::Binary(b) => b,
        }
    }
}

/// Write half of a channel.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: WireMessage) -> Result<()>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a channel.
#[async_trait]
pub trait MessageSource: Send {
    /// Next inbound message, or `None` once the channel has closed.
    async fn recv(&mut self) -> Option<Result<WireMessage>>;
}

/// Both halves of an open channel.
pub type Channel = (Box<dyn MessageSink>, Box<dyn MessageSource>);

/// Opens channels to device endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Channel>;
}
