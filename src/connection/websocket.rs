//! WebSocket channels over `tokio-tungstenite`

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::trace;

use super::transport::{Channel, Connector, MessageSink, MessageSource, WireMessage};
use crate::{ConnectionErrorKind, Result, WatcherError};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to the device's WebSocket endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Channel> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| classify(url, e))?;
        trace!(url, "WebSocket open");
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsSink { sink, url: url.to_string() }),
            Box::new(WsSource { stream, url: url.to_string() }),
        ))
    }
}

fn classify(url: &str, err: tungstenite::Error) -> WatcherError {
    let kind = match &err {
        tungstenite::Error::Io(io) => ConnectionErrorKind::from_io(io),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionErrorKind::Closed
        }
        tungstenite::Error::Http(_)
        | tungstenite::Error::HttpFormat(_)
        | tungstenite::Error::Protocol(_) => ConnectionErrorKind::Handshake,
        _ => ConnectionErrorKind::Other,
    };
    let reason = err.to_string();
    WatcherError::connection_with_source(kind, url, reason, Box::new(err))
}

struct WsSink {
    sink: SplitSink<WsStream, tungstenite::Message>,
    url: String,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let frame = match message {
            WireMessage::Text(text) => tungstenite::Message::Text(text),
            WireMessage::Binary(data) => tungstenite::Message::Binary(data),
        };
        self.sink.send(frame).await.map_err(|e| classify(&self.url, e))
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(classify(&self.url, e)),
        }
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
    url: String,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(WireMessage::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(WireMessage::Binary(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(_)) => return None,
                // tungstenite answers pings itself
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(classify(&self.url, e))),
            }
        }
    }
}
