//! In-process channels
//!
//! Every channel opened through a [`LoopbackConnector`] is handed to the
//! paired acceptor as a [`LoopbackPeer`], which plays the device side. Used
//! to drive the full stack without hardware.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{Channel, Connector, MessageSink, MessageSource, WireMessage};
use crate::{ConnectionErrorKind, Result, WatcherError};

/// Device side of one loopback channel.
#[derive(Debug)]
pub struct LoopbackPeer {
    pub url: String,
    /// Messages to the host
    pub tx: mpsc::UnboundedSender<WireMessage>,
    /// Messages from the host; yields `None` once the host closes
    pub rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    accept: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Create a connector and the receiver of the peers it opens.
///
/// Once the receiver is dropped, `open` fails as if the device refused.
pub fn loopback() -> (LoopbackConnector, mpsc::UnboundedReceiver<LoopbackPeer>) {
    let (accept, peers) = mpsc::unbounded_channel();
    (LoopbackConnector { accept }, peers)
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, url: &str) -> Result<Channel> {
        let (host_tx, device_rx) = mpsc::unbounded_channel();
        let (device_tx, host_rx) = mpsc::unbounded_channel();
        self.accept
            .send(LoopbackPeer { url: url.to_string(), tx: device_tx, rx: device_rx })
            .map_err(|_| {
                WatcherError::connection(ConnectionErrorKind::Refused, url, "no loopback acceptor")
            })?;
        Ok((
            Box::new(LoopbackSink { tx: Some(host_tx), url: url.to_string() }),
            Box::new(LoopbackSource { rx: host_rx }),
        ))
    }
}

struct LoopbackSink {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    url: String,
}

#[async_trait]
impl MessageSink for LoopbackSink {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| WatcherError::channel_closed(&self.url))?;
        tx.send(message).map_err(|_| WatcherError::channel_closed(&self.url))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct LoopbackSource {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl MessageSource for LoopbackSource {
    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        self.rx.recv().await.map(Ok)
    }
}
