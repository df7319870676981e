//! Control + data connection to the device watcher

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::registry::{Lease, ModeRegistry};
use super::transport::{Connector, MessageSink, MessageSource, WireMessage};
use super::websocket::WebSocketConnector;
use crate::LinkConfig;
use crate::codec::{
    ConnectionEvent, ControlMessage, ListResponse, WatcherCommand, WatcherRequest,
    parse_control_message,
};
use crate::types::{ConnectionMode, VariableDescriptor};
use crate::{ConnectionErrorKind, Result, WatcherError};

/// Everything that exists only while connected.
struct Link {
    _lease: Lease,
    cancel: CancellationToken,
    tasks: TaskTracker,
    control_tx: mpsc::UnboundedSender<WireMessage>,
    data_tx: mpsc::UnboundedSender<WireMessage>,
    list_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ListResponse>>>,
    data_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct Session {
    project_name: Option<String>,
    sample_rate: f64,
    vars: Arc<[VariableDescriptor]>,
}

/// A connection to the device watcher on one mode slot.
///
/// Owns the control and data channels. Each channel has one background
/// sender draining an outbound queue and one listener routing inbound
/// messages: list responses are correlated for [`list`], data
/// messages are queued for the frame demultiplexer.
///
/// [`list`]: WatcherConnection::list
pub struct WatcherConnection {
    config: LinkConfig,
    mode: ConnectionMode,
    connector: Arc<dyn Connector>,
    registry: Arc<ModeRegistry>,
    connect_lock: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    session: RwLock<Session>,
}

impl WatcherConnection {
    /// Connection over WebSockets, registered in the process-wide registry.
    pub fn new(config: LinkConfig, mode: ConnectionMode) -> Self {
        Self::with_transport(config, mode, Arc::new(WebSocketConnector), ModeRegistry::shared())
    }

    pub fn with_transport(
        config: LinkConfig,
        mode: ConnectionMode,
        connector: Arc<dyn Connector>,
        registry: Arc<ModeRegistry>,
    ) -> Self {
        Self {
            config,
            mode,
            connector,
            registry,
            connect_lock: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            session: RwLock::new(Session::default()),
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.link().as_ref().is_some_and(|link| !link.cancel.is_cancelled())
    }

    /// Open both channels and perform the connection handshake.
    ///
    /// Claims this connection's mode slot first, which closes any previous
    /// connection on the same slot. Refreshes the variable list once the
    /// data channel is up. Connecting while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!(mode = %self.mode, "Already connected");
            return Ok(());
        }
        // a superseded or dropped link may still be around
        self.shutdown_link().await;

        let endpoint = self.config.endpoint();
        let lease = self.registry.acquire(self.mode, &endpoint)?;
        info!(mode = %self.mode, endpoint = %endpoint, "Connecting to watcher");

        let control_url = self.config.control_url();
        let (mut control_sink, mut control_source) = self.open(&control_url).await?;

        let hello = self.await_connection_event(control_source.as_mut(), &control_url).await;
        let project_name = match hello {
            Ok(name) => name,
            Err(e) => {
                let _ = control_sink.close().await;
                return Err(e);
            }
        };
        let reply = serde_json::to_string(&ConnectionEvent::ConnectionReply)?;
        control_sink.send(WireMessage::Text(reply)).await?;

        let data_url = self.config.data_url();
        let (data_sink, data_source) = match self.open(&data_url).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = control_sink.close().await;
                return Err(e);
            }
        };

        let cancel = lease.token().child_token();
        let tasks = TaskTracker::new();
        let (control_tx, control_out) = mpsc::unbounded_channel();
        let (data_tx, data_out) = mpsc::unbounded_channel();
        let (list_tx, list_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tasks.spawn(run_sender(control_sink, control_out, cancel.clone(), control_url.clone()));
        tasks.spawn(run_sender(data_sink, data_out, cancel.clone(), data_url.clone()));
        tasks.spawn(run_control_listener(control_source, list_tx, cancel.clone(), control_url));
        tasks.spawn(run_data_listener(data_source, inbound_tx, cancel.clone(), data_url));
        tasks.close();

        *self.link() = Some(Link {
            _lease: lease,
            cancel,
            tasks,
            control_tx,
            data_tx,
            list_rx: Arc::new(tokio::sync::Mutex::new(list_rx)),
            data_rx: Some(inbound_rx),
        });

        // the running project may have changed since the last connection
        let list = match self.list().await {
            Ok(list) => list,
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        };
        {
            let mut session = self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            session.project_name = Some(project_name.clone());
            session.sample_rate = list.sample_rate;
            session.vars = list.watchers.iter().map(|w| w.descriptor()).collect();
        }
        info!(
            mode = %self.mode,
            project = %project_name,
            sample_rate = list.sample_rate,
            variables = list.watchers.len(),
            "Connection successful"
        );
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.connector.open(url)).await {
            Ok(result) => result,
            Err(_) => Err(WatcherError::connection(
                ConnectionErrorKind::Unreachable,
                url,
                format!("no answer within {timeout:?}"),
            )),
        }
    }

    async fn await_connection_event(
        &self,
        source: &mut dyn MessageSource,
        url: &str,
    ) -> Result<String> {
        let handshake = |reason: &str| {
            WatcherError::connection(ConnectionErrorKind::Handshake, url, reason)
        };
        let timeout = self.config.connect_timeout();
        let first = tokio::time::timeout(timeout, source.recv())
            .await
            .map_err(|_| handshake("no connection event from device"))?;
        let message = match first {
            Some(Ok(WireMessage::Text(text))) => text,
            Some(Ok(WireMessage::Binary(_))) => {
                return Err(handshake("binary handshake message"));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(WatcherError::channel_closed(url)),
        };
        match parse_control_message(&message) {
            Ok(ControlMessage::Connection { project_name }) => Ok(project_name),
            Ok(other) => Err(WatcherError::connection(
                ConnectionErrorKind::Handshake,
                url,
                format!("expected a connection event, got {other:?}"),
            )),
            Err(e) => Err(WatcherError::connection_with_source(
                ConnectionErrorKind::Handshake,
                url,
                "malformed connection event",
                Box::new(e),
            )),
        }
    }

    /// Close both channels and stop the background tasks. Idempotent.
    pub async fn disconnect(&self) {
        if self.shutdown_link().await {
            info!(mode = %self.mode, "Disconnected");
        }
    }

    async fn shutdown_link(&self) -> bool {
        let Some(link) = self.link().take() else {
            return false;
        };
        link.cancel.cancel();
        link.tasks.wait().await;
        true
    }

    /// Serialise and queue a control message.
    pub fn send_control<T: Serialize>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message).map_err(|source| {
            WatcherError::Serialization { context: "control message".into(), source }
        })?;
        trace!(mode = %self.mode, %text, "Sending control message");
        self.enqueue(|link| &link.control_tx, WireMessage::Text(text), self.config.control_url())
    }

    /// Queue a binary message on the data channel.
    pub fn send_data(&self, bytes: Vec<u8>) -> Result<()> {
        self.enqueue(|link| &link.data_tx, WireMessage::Binary(bytes), self.config.data_url())
    }

    pub(crate) fn send_commands(
        &self,
        commands: impl IntoIterator<Item = WatcherCommand>,
    ) -> Result<()> {
        self.send_control(&WatcherRequest::new(commands))
    }

    fn enqueue(
        &self,
        select: impl FnOnce(&Link) -> &mpsc::UnboundedSender<WireMessage>,
        message: WireMessage,
        url: String,
    ) -> Result<()> {
        let guard = self.link();
        let link = guard
            .as_ref()
            .filter(|link| !link.cancel.is_cancelled())
            .ok_or_else(|| WatcherError::channel_closed(&url))?;
        select(link).send(message).map_err(|_| WatcherError::channel_closed(url))
    }

    /// Query the device for its variable list.
    ///
    /// Concurrent callers are serialised so each gets its own response.
    pub async fn list(&self) -> Result<ListResponse> {
        let list_rx = self.with_link(|link| link.list_rx.clone())?;
        let mut rx = list_rx.lock().await;
        while rx.try_recv().is_ok() {}

        self.send_commands([WatcherCommand::List])?;
        let timeout = self.config.response_timeout();
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(list)) => Ok(list),
            Ok(None) => Err(WatcherError::channel_closed(self.config.control_url())),
            Err(_) => Err(WatcherError::timeout("list", timeout)),
        }
    }

    /// Hand the inbound data queue to its consumer. Yields once per connection.
    pub(crate) fn take_data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.link().as_mut().and_then(|link| link.data_rx.take())
    }

    /// Token cancelled when the current connection goes away.
    pub(crate) fn link_token(&self) -> Option<CancellationToken> {
        self.link().as_ref().map(|link| link.cancel.clone())
    }

    fn with_link<T>(&self, f: impl FnOnce(&Link) -> T) -> Result<T> {
        self.link()
            .as_ref()
            .filter(|link| !link.cancel.is_cancelled())
            .map(f)
            .ok_or_else(|| WatcherError::channel_closed(self.config.control_url()))
    }

    fn session(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn project_name(&self) -> Option<String> {
        self.session().project_name.clone()
    }

    pub fn sample_rate(&self) -> f64 {
        self.session().sample_rate
    }

    /// Variables exposed by the running project, as listed at connect time.
    pub fn watcher_vars(&self) -> Arc<[VariableDescriptor]> {
        self.session().vars.clone()
    }

    /// Look up one variable by name.
    pub fn variable(&self, name: &str) -> Result<VariableDescriptor> {
        self.session()
            .vars
            .iter()
            .find(|v| v.name == name)
            .cloned()
            .ok_or_else(|| WatcherError::UnknownVariable { name: name.to_string() })
    }

    /// Resolve a variable argument: empty means every watcher variable,
    /// otherwise every name must exist.
    pub fn check_vars<S: AsRef<str>>(&self, variables: &[S]) -> Result<Vec<String>> {
        let session = self.session();
        if variables.is_empty() {
            return Ok(session.vars.iter().map(|v| v.name.clone()).collect());
        }
        variables
            .iter()
            .map(|name| {
                let name = name.as_ref();
                if session.vars.iter().any(|v| v.name == name) {
                    Ok(name.to_string())
                } else {
                    Err(WatcherError::UnknownVariable { name: name.to_string() })
                }
            })
            .collect()
    }

    async fn filtered_vars(
        &self,
        keep: impl Fn(&crate::codec::WatcherEntry) -> bool,
    ) -> Result<Vec<VariableDescriptor>> {
        let list = self.list().await?;
        Ok(list.watchers.iter().filter(|w| keep(w)).map(|w| w.descriptor()).collect())
    }

    /// Variables currently streamed by the device.
    pub async fn watched_vars(&self) -> Result<Vec<VariableDescriptor>> {
        self.filtered_vars(|w| w.watched).await
    }

    pub async fn unwatched_vars(&self) -> Result<Vec<VariableDescriptor>> {
        self.filtered_vars(|w| !w.watched).await
    }

    /// Variables with a non-zero monitoring period.
    pub async fn monitored_vars(&self) -> Result<Vec<VariableDescriptor>> {
        self.filtered_vars(|w| w.monitor > 0).await
    }

    /// Device clock, in audio frames.
    pub async fn latest_timestamp(&self) -> Result<u64> {
        Ok(self.list().await?.timestamp)
    }
}

impl Drop for WatcherConnection {
    fn drop(&mut self) {
        if let Some(link) = self.link().as_ref() {
            debug!(mode = %self.mode, "Dropping watcher connection");
            link.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for WatcherConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherConnection")
            .field("mode", &self.mode)
            .field("endpoint", &self.config.endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn run_sender(
    mut sink: Box<dyn MessageSink>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    cancel: CancellationToken,
    url: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    error!(url = %url, error = %e, "Failed to send message");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(url = %url, error = %e, "Error closing channel");
    }
}

async fn run_control_listener(
    mut source: Box<dyn MessageSource>,
    list_tx: mpsc::UnboundedSender<ListResponse>,
    cancel: CancellationToken,
    url: String,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.recv() => message,
        };
        let text = match message {
            Some(Ok(WireMessage::Text(text))) => text,
            Some(Ok(WireMessage::Binary(bytes))) => {
                warn!(url = %url, len = bytes.len(), "Ignoring binary message on control channel");
                continue;
            }
            Some(Err(e)) => {
                lost(&cancel, &url, Some(&e));
                break;
            }
            None => {
                lost(&cancel, &url, None);
                break;
            }
        };
        match parse_control_message(&text) {
            Ok(ControlMessage::List(list)) => {
                let _ = list_tx.send(list);
            }
            Ok(ControlMessage::Log(response)) => {
                debug!(url = %url, file = %response.log_file_name, "Log file announced");
            }
            Ok(ControlMessage::Connection { project_name }) => {
                debug!(url = %url, project = %project_name, "Repeated connection event");
            }
            Ok(ControlMessage::Other(value)) => trace!(url = %url, %value, "Control message"),
            Err(e) => warn!(url = %url, error = %e, "Unparseable control message"),
        }
    }
}

async fn run_data_listener(
    mut source: Box<dyn MessageSource>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    url: String,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.recv() => message,
        };
        match message {
            Some(Ok(WireMessage::Binary(bytes))) => {
                let _ = inbound.send(bytes);
            }
            Some(Ok(WireMessage::Text(text))) => {
                let _ = inbound.send(text.into_bytes());
            }
            Some(Err(e)) => {
                lost(&cancel, &url, Some(&e));
                break;
            }
            None => {
                lost(&cancel, &url, None);
                break;
            }
        }
    }
}

/// Report an unintentional channel loss and take the connection down.
fn lost(cancel: &CancellationToken, url: &str, cause: Option<&WatcherError>) {
    if cancel.is_cancelled() {
        return;
    }
    match cause {
        Some(e) => error!(url, error = %e, "Connection lost while receiving"),
        None => error!(url, "Connection closed by device"),
    }
    cancel.cancel();
}
