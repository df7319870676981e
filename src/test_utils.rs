//! Test utilities: an in-process device
//!
//! [`FakeDevice`] plays the device side of the watcher protocol over the
//! loopback transport. It answers the connection handshake and list
//! queries, keeps watch/monitor/log bookkeeping in step with the commands
//! it receives, writes log files into a directory standing in for the
//! device filesystem, and lets tests inject data frames.

#![cfg(any(test, feature = "benchmark"))]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::LinkConfig;
use crate::codec::{
    ConnectionEvent, ListResponse, WatcherCommand, WatcherEntry, WatcherRequest, encode_buffer_body,
    encode_buffer_header,
};
use crate::connection::{LoopbackPeer, ModeRegistry, WatcherConnection, WireMessage, loopback};
use crate::log::LogFileHeader;
use crate::types::{
    ConnectionMode, DenseBuffer, MonitorSample, ParsedBuffer, Samples, SparseBuffer, TimestampMode,
    Value, VarType, VariableDescriptor,
};

pub const PROJECT_NAME: &str = "watcher";
pub const SAMPLE_RATE: f64 = 44100.0;

/// Buffers written to each log file
pub const LOGGED_BUFFERS: usize = 2;

#[derive(Debug)]
struct FakeVar {
    descriptor: VariableDescriptor,
    watched: bool,
    logged: bool,
    monitor: u32,
    log_file_name: String,
}

#[derive(Debug, Default)]
struct DeviceState {
    vars: Vec<FakeVar>,
    timestamp: u64,
    commands: Vec<WatcherCommand>,
    received: Vec<Vec<u8>>,
    data_tx: Option<mpsc::UnboundedSender<WireMessage>>,
    /// Stand-in for the device's projects directory
    projects_dir: Option<PathBuf>,
}

/// A scripted device reachable through [`FakeDevice::connection`].
pub struct FakeDevice {
    config: LinkConfig,
    connector: crate::connection::LoopbackConnector,
    registry: Arc<ModeRegistry>,
    state: Arc<Mutex<DeviceState>>,
    acceptor: JoinHandle<()>,
}

impl FakeDevice {
    /// A device exposing `vars`, in channel order. Must be created inside a runtime.
    pub fn new(vars: Vec<VariableDescriptor>) -> Self {
        Self::build(vars, None)
    }

    /// Like [`new`](Self::new), writing log files under `projects_dir/watcher/`.
    pub fn with_projects_dir(vars: Vec<VariableDescriptor>, projects_dir: &Path) -> Self {
        Self::build(vars, Some(projects_dir.to_path_buf()))
    }

    fn build(vars: Vec<VariableDescriptor>, projects_dir: Option<PathBuf>) -> Self {
        let mut config = LinkConfig {
            ip: "bela.test".into(),
            connect_timeout_ms: 1000,
            response_timeout_ms: 1000,
            schedule_poll_interval_ms: 10,
            block_callback_timeout_ms: 200,
            ..LinkConfig::default()
        };
        if let Some(dir) = &projects_dir {
            config.remote_projects_dir = dir.to_string_lossy().into_owned();
            let _ = std::fs::create_dir_all(dir.join(PROJECT_NAME));
        }
        let state = DeviceState {
            vars: vars
                .into_iter()
                .map(|descriptor| FakeVar {
                    descriptor,
                    watched: false,
                    logged: false,
                    monitor: 0,
                    log_file_name: String::new(),
                })
                .collect(),
            projects_dir,
            ..DeviceState::default()
        };
        let state = Arc::new(Mutex::new(state));
        let (connector, peers) = loopback();
        let acceptor = tokio::spawn(accept(peers, config.control_add.clone(), state.clone()));
        Self { config, connector, registry: ModeRegistry::new(), state, acceptor }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ModeRegistry> {
        self.registry.clone()
    }

    /// A host connection to this device on `mode`.
    pub fn connection(&self, mode: ConnectionMode) -> WatcherConnection {
        WatcherConnection::with_transport(
            self.config.clone(),
            mode,
            Arc::new(self.connector.clone()),
            self.registry.clone(),
        )
    }

    pub fn set_timestamp(&self, timestamp: u64) {
        self.state().timestamp = timestamp;
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<WatcherCommand> {
        self.state().commands.clone()
    }

    /// Wait until a received command matches `pred`.
    pub async fn wait_for_command(&self, pred: impl Fn(&WatcherCommand) -> bool) -> WatcherCommand {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(command) = self.state().commands.iter().find(|c| pred(c)).cloned() {
                    return command;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        match found {
            Ok(command) => command,
            Err(_) => panic!("expected command never arrived; got {:?}", self.commands()),
        }
    }

    pub fn is_watched(&self, name: &str) -> bool {
        self.state().vars.iter().any(|v| v.descriptor.name == name && v.watched)
    }

    /// Binary messages the host sent on the data channel.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state().received.clone()
    }

    /// Inject one buffer on `channel` as a header/body pair.
    pub fn send_buffer(&self, channel: usize, buffer: &ParsedBuffer) {
        let var_type = self.state().vars[channel].descriptor.var_type;
        let body = match encode_buffer_body(buffer, var_type) {
            Ok(body) => body,
            Err(e) => panic!("cannot encode test buffer: {e}"),
        };
        self.send_raw(encode_buffer_header(channel, var_type));
        self.send_raw(body);
    }

    /// Inject a raw data-channel message.
    pub fn send_raw(&self, bytes: Vec<u8>) {
        let state = self.state();
        let tx = state.data_tx.as_ref().map(|tx| tx.send(WireMessage::Binary(bytes)));
        assert!(matches!(tx, Some(Ok(()))), "no data channel open");
    }

    /// A full buffer for `channel` whose values are `ref_timestamp + i`.
    pub fn buffer(&self, channel: usize, ref_timestamp: u64) -> ParsedBuffer {
        let descriptor = self.state().vars[channel].descriptor.clone();
        make_buffer(&descriptor, ref_timestamp)
    }

    /// A monitor sample for `channel` with value `timestamp`.
    pub fn sample(&self, channel: usize, timestamp: u64) -> ParsedBuffer {
        let var_type = self.state().vars[channel].descriptor.var_type;
        let value = value_of(var_type, timestamp as f64);
        ParsedBuffer::Monitor(MonitorSample { timestamp, value })
    }

    /// Wait until the host has opened a data channel.
    pub async fn data_channel_open(&self) {
        let open = tokio::time::timeout(Duration::from_secs(2), async {
            while self.state().data_tx.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(open.is_ok(), "data channel never opened");
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

fn lock(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn value_of(var_type: VarType, x: f64) -> Value {
    match var_type {
        VarType::Int32 | VarType::UInt32AsInt32 => Value::Int(x as i32),
        VarType::Float32 => Value::Float(x as f32),
        VarType::Float64 => Value::Double(x),
        VarType::Char8 => Value::Char(x as u8),
    }
}

/// A full buffer for `var` whose values are `ref_timestamp + i`.
pub fn make_buffer(var: &VariableDescriptor, ref_timestamp: u64) -> ParsedBuffer {
    let n = var.data_length;
    let xs = (0..n).map(|i| (ref_timestamp + i as u64) as f64);
    let data = match var.var_type {
        VarType::Int32 | VarType::UInt32AsInt32 => Samples::Int32(xs.map(|x| x as i32).collect()),
        VarType::Float32 => Samples::Float32(xs.map(|x| x as f32).collect()),
        VarType::Float64 => Samples::Float64(xs.collect()),
        VarType::Char8 => Samples::Char(xs.map(|x| x as u8).collect()),
    };
    match var.timestamp_mode {
        TimestampMode::Dense => ParsedBuffer::Dense(DenseBuffer { ref_timestamp, data }),
        TimestampMode::Sparse => ParsedBuffer::Sparse(SparseBuffer {
            ref_timestamp,
            data,
            rel_timestamps: (0..n as u32).map(|i| i * 2).collect(),
        }),
    }
}

async fn accept(
    mut peers: mpsc::UnboundedReceiver<LoopbackPeer>,
    control_add: String,
    state: Arc<Mutex<DeviceState>>,
) {
    while let Some(peer) = peers.recv().await {
        if peer.url.ends_with(&control_add) {
            tokio::spawn(serve_control(peer, state.clone()));
        } else {
            tokio::spawn(serve_data(peer, state.clone()));
        }
    }
}

async fn serve_data(peer: LoopbackPeer, state: Arc<Mutex<DeviceState>>) {
    let LoopbackPeer { tx, mut rx, .. } = peer;
    lock(&state).data_tx = Some(tx);
    while let Some(message) = rx.recv().await {
        if let WireMessage::Binary(bytes) = message {
            lock(&state).received.push(bytes);
        }
    }
}

async fn serve_control(peer: LoopbackPeer, state: Arc<Mutex<DeviceState>>) {
    let LoopbackPeer { tx, mut rx, .. } = peer;
    let hello = ConnectionEvent::Connection { project_name: PROJECT_NAME.into() };
    let Ok(hello) = serde_json::to_string(&hello) else { return };
    if tx.send(WireMessage::Text(hello)).is_err() {
        return;
    }

    while let Some(message) = rx.recv().await {
        let WireMessage::Text(text) = message else { continue };
        let Ok(request) = serde_json::from_str::<WatcherRequest>(&text) else {
            // connection-reply and anything else without commands
            continue;
        };
        for command in request.watcher {
            if let Some(reply) = apply(&state, command) {
                let _ = tx.send(WireMessage::Text(reply));
            }
        }
    }
}

/// Update the bookkeeping for one command; returns a reply if one is due.
fn apply(shared: &Arc<Mutex<DeviceState>>, command: WatcherCommand) -> Option<String> {
    let mut state = lock(shared);
    state.commands.push(command.clone());
    match command {
        WatcherCommand::List => {
            let list = ListResponse {
                sample_rate: SAMPLE_RATE,
                timestamp: state.timestamp,
                watchers: state
                    .vars
                    .iter()
                    .map(|v| WatcherEntry {
                        name: v.descriptor.name.clone(),
                        var_type: v.descriptor.var_type,
                        timestamp_mode: v.descriptor.timestamp_mode,
                        watched: v.watched,
                        controlled: false,
                        logged: v.logged,
                        monitor: v.monitor,
                        log_file_name: v.log_file_name.clone(),
                        value: None,
                    })
                    .collect(),
            };
            return serde_json::to_string(&serde_json::json!({ "watcher": list })).ok();
        }
        WatcherCommand::Watch { watchers, durations, .. } => {
            for var in state.vars.iter_mut().filter(|v| watchers.contains(&v.descriptor.name)) {
                var.watched = true;
            }
            if let Some(durations) = durations {
                // scheduled: each variable stops after its duration
                for (name, frames) in watchers.into_iter().zip(durations) {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let seconds = frames as f64 / SAMPLE_RATE;
                        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                        let mut state = lock(&shared);
                        let var = state.vars.iter_mut().find(|v| v.descriptor.name == name);
                        if let Some(var) = var {
                            var.watched = false;
                        }
                    });
                }
            }
        }
        WatcherCommand::Unwatch { watchers } => {
            for var in state.vars.iter_mut().filter(|v| watchers.contains(&v.descriptor.name)) {
                var.watched = false;
            }
        }
        WatcherCommand::Monitor { watchers, periods } => {
            for (name, period) in watchers.iter().zip(periods) {
                if let Some(var) = state.vars.iter_mut().find(|v| &v.descriptor.name == name) {
                    var.monitor = period;
                }
            }
        }
        WatcherCommand::Log { watchers, .. } => {
            let dir = state.projects_dir.clone();
            for var in state.vars.iter_mut().filter(|v| watchers.contains(&v.descriptor.name)) {
                var.logged = true;
                var.log_file_name = format!("{}.bin", var.descriptor.name);
                if let Some(dir) = &dir {
                    let path = dir.join(PROJECT_NAME).join(&var.log_file_name);
                    write_log_file(&path, &var.descriptor);
                }
            }
        }
        WatcherCommand::Unlog { watchers } => {
            for var in state.vars.iter_mut().filter(|v| watchers.contains(&v.descriptor.name)) {
                var.logged = false;
            }
        }
    }
    None
}

fn write_log_file(path: &Path, var: &VariableDescriptor) {
    let header = LogFileHeader {
        project_name: PROJECT_NAME.into(),
        var_name: var.name.clone(),
        var_type: var.var_type,
        pid: 4242,
        pid_id: 1,
    };
    let mut bytes = header.encode();
    for i in 0..LOGGED_BUFFERS as u64 {
        let buffer = make_buffer(var, i * var.data_length as u64);
        if let Ok(mut body) = encode_buffer_body(&buffer, var.var_type) {
            body.resize(var.buffer_size(), 0);
            bytes.extend(body);
        }
    }
    let _ = std::fs::write(path, bytes);
}
