//! Streaming sessions
//!
//! A [`Streamer`] owns one watcher connection and runs at most one session
//! on it at a time. Sessions move through [`StreamingMode`]:
//!
//! ```text
//! Off --start_streaming----> Forever
//! Off --stream_n_values----> NValues --every quota reached--> Off
//! Off --schedule_streaming-> Schedule
//! Off --peek---------------> Peek     (monitor connections only)
//! any --stop_streaming-----> Off
//! ```
//!
//! Data messages are demultiplexed by a pump task for the lifetime of the
//! connection. Buffers only reach the per-variable queues while a session
//! is active; from there they fan out to the saving sink, the session's
//! callback and latest-buffer subscribers.

mod mode;
mod monitor;
mod queue;

pub use mode::StreamingMode;
pub use monitor::Monitor;
pub use queue::{BufferQueue, QueueSet, QueueSnapshot, TimestampedValues};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::BoxStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::callback::{Callback, CallbackDispatcher};
use crate::codec::{WatcherCommand, encode_outbound_buffer};
use crate::connection::WatcherConnection;
use crate::demux::{DemuxedBuffer, FrameDemultiplexer};
use crate::persist::{self, PersistenceSink};
use crate::types::{
    BufferEvent, ConnectionMode, MonitorSample, ParsedBuffer, Samples, UpdateRate, VarType,
};
use crate::{LinkConfig, Result, WatcherError};

/// Per-session settings.
///
/// Saving is enabled by giving a directory; each variable then appends to
/// `{dir}/{var}_{filename}`.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub saving_dir: Option<PathBuf>,
    /// Defaults to `var_stream.txt`, or `monitor.txt` on monitor connections
    pub saving_filename: Option<String>,
    pub callback: Option<Callback>,
}

impl SessionOptions {
    pub fn save_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.saving_dir = Some(dir.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.saving_filename = Some(filename.into());
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Debug, Default)]
struct SessionState {
    mode: StreamingMode,
    queue_length: usize,
    queues: QueueSet,
    requested: Vec<String>,
    /// Buffers each variable must deliver in `NValues`
    targets: HashMap<String, usize>,
    peeked: BTreeMap<String, MonitorSample>,
    completion: Option<oneshot::Sender<()>>,
    /// Base path of the saving files
    saving: Option<PathBuf>,
    callbacks: Option<CallbackDispatcher>,
}

impl SessionState {
    fn complete(&mut self) {
        if let Some(done) = self.completion.take() {
            let _ = done.send(());
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    latest: watch::Sender<Option<BufferEvent>>,
    faults: AtomicU64,
    persist: PersistenceSink,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ingest(&self, demuxed: DemuxedBuffer) {
        let DemuxedBuffer { channel, name, buffer } = demuxed;
        let buffer = Arc::new(buffer);

        let mut guard = self.state();
        let state = &mut *guard;
        if !state.mode.is_active() {
            trace!(var = %name, "No active session, dropping buffer");
            return;
        }
        if !state.queues.push(&name, buffer.clone()) {
            trace!(var = %name, channel, "Buffer for a variable without a queue");
            return;
        }
        trace!(
            var = %name,
            ref_timestamp = buffer.ref_timestamp(),
            len = buffer.len(),
            "Buffer ingested"
        );

        if let Some(base) = &state.saving {
            if state.requested.contains(&name) {
                self.persist.spawn_append(persist::var_file_path(base, &name), buffer.clone());
            }
        }

        let event = BufferEvent { name, buffer };
        if let Some(callbacks) = &state.callbacks {
            callbacks.dispatch(event.clone());
        }

        match state.mode {
            StreamingMode::NValues => {
                let filled = state
                    .targets
                    .iter()
                    .all(|(var, &target)| state.queues.get(var).is_some_and(|q| q.len() >= target));
                if filled {
                    info!(variables = ?state.requested, "Requested values received");
                    state.mode = StreamingMode::Off;
                    state.complete();
                }
            }
            StreamingMode::Peek => {
                if let Some(sample) = event.buffer.as_monitor() {
                    state.peeked.entry(event.name.clone()).or_insert(*sample);
                }
                if state.requested.iter().all(|var| state.peeked.contains_key(var)) {
                    state.complete();
                }
            }
            _ => {}
        }
        drop(guard);

        self.latest.send_replace(Some(event));
    }
}

/// A session that has been set up but not necessarily finished.
struct Started {
    vars: Vec<String>,
    done: oneshot::Receiver<()>,
}

/// Streams variables from the device into bounded per-variable queues.
pub struct Streamer {
    conn: Arc<WatcherConnection>,
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// A streamer on the STREAM slot of the device in `config`.
    pub fn new(config: LinkConfig) -> Self {
        Self::from_connection(WatcherConnection::new(config, ConnectionMode::Stream))
    }

    /// Wrap an existing connection. Monitor connections get monitor-sized queues.
    pub fn from_connection(conn: WatcherConnection) -> Self {
        let queue_length = if conn.mode().carries_samples() {
            conn.config().monitor_queue_length
        } else {
            conn.config().streaming_buffers_queue_length
        };
        let (latest, _) = watch::channel(None);
        let shared = Shared {
            state: Mutex::new(SessionState { queue_length, ..SessionState::default() }),
            latest,
            faults: AtomicU64::new(0),
            persist: PersistenceSink::new(),
        };
        Self { conn: Arc::new(conn), shared: Arc::new(shared), pump: Mutex::new(None) }
    }

    pub fn connection(&self) -> &WatcherConnection {
        &self.conn
    }

    /// Connect and start demultiplexing the data channel.
    pub async fn connect(&self) -> Result<()> {
        self.conn.connect().await?;
        let Some(inbound) = self.conn.take_data_receiver() else {
            return Ok(());
        };

        let vars = self.conn.watcher_vars();
        {
            let mut state = self.shared.state();
            state.queues = QueueSet::new(vars.iter().map(|v| v.name.as_str()), state.queue_length);
        }
        let demux = FrameDemultiplexer::new(vars, self.conn.mode());
        let cancel = self.conn.link_token().unwrap_or_default();
        let pump = tokio::spawn(run_pump(self.shared.clone(), inbound, demux, cancel));
        if let Some(previous) = self.pump().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop any session, then close the connection.
    pub async fn disconnect(&self) {
        if self.is_streaming() {
            if let Err(e) = self.stop_streaming::<&str>(&[]).await {
                warn!(error = %e, "Error stopping session before disconnecting");
            }
        }
        self.conn.disconnect().await;
        let pump = self.pump().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
    }

    fn pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        self.shared.state().mode
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_mode().is_active()
    }

    /// Data messages dropped as protocol faults since creation.
    pub fn protocol_faults(&self) -> u64 {
        self.shared.faults.load(Ordering::Relaxed)
    }

    pub fn streaming_buffers_queue_length(&self) -> usize {
        self.shared.state().queue_length
    }

    /// Change the queue capacity. Clears every queue.
    pub fn set_streaming_buffers_queue_length(&self, length: usize) {
        let length = length.max(1);
        let vars = self.conn.watcher_vars();
        let mut state = self.shared.state();
        state.queue_length = length;
        state.queues = QueueSet::new(vars.iter().map(|v| v.name.as_str()), length);
    }

    /// Empty every queue, keeping capacities.
    pub fn flush_queue(&self) {
        let mut state = self.shared.state();
        let capacities: Vec<(String, usize)> =
            state.queues.iter().map(|(name, queue)| (name.clone(), queue.capacity())).collect();
        for (name, capacity) in capacities {
            state.queues.resize(&name, capacity);
        }
    }

    pub fn streaming_buffers_queue(&self) -> QueueSnapshot {
        self.shared.state().queues.snapshot()
    }

    /// Every queued value per variable, oldest first, widened to `f64`.
    pub fn streaming_buffers_data(&self) -> BTreeMap<String, Vec<f64>> {
        self.shared
            .state()
            .queues
            .iter()
            .map(|(name, queue)| {
                (name.clone(), queue.iter().flat_map(|b| b.values_f64()).collect())
            })
            .collect()
    }

    /// The newest buffer of `var`, with absolute timestamps.
    pub fn last_streamed_buffer(&self, var: &str) -> Option<TimestampedValues> {
        self.shared.state().queues.get(var)?.last().map(|b| TimestampedValues::from_buffer(b))
    }

    /// The most recently ingested buffer, at most `rate` times per second.
    pub fn subscribe_latest(&self, rate: UpdateRate) -> BoxStream<'static, BufferEvent> {
        crate::stream::latest_buffers(self.shared.latest.subscribe(), rate)
    }

    /// Stream `variables` (empty for all) until stopped.
    pub async fn start_streaming<S: AsRef<str>>(
        &self,
        variables: &[S],
        options: SessionOptions,
    ) -> Result<()> {
        let started = self.begin(variables, StreamingMode::Forever, None, options).await?;
        self.send_or_abort(self.watch_commands(&started.vars)).await?;
        info!(variables = ?started.vars, "Started streaming");
        Ok(())
    }

    /// End the session and return the queues.
    ///
    /// Waits for pending saves and callbacks. Sends `unwatch` for
    /// `variables` (empty for all) unless the session was scheduled, in
    /// which case the device has already stopped on its own.
    pub async fn stop_streaming<S: AsRef<str>>(&self, variables: &[S]) -> Result<QueueSnapshot> {
        let previous = self.wind_down().await;
        if previous != StreamingMode::Schedule && self.conn.is_connected() {
            let vars = self.conn.check_vars(variables)?;
            let command = if self.conn.mode().carries_samples() {
                WatcherCommand::unmonitor(vars.clone())
            } else {
                WatcherCommand::Unwatch { watchers: vars.clone() }
            };
            self.conn.send_commands([command])?;
            info!(variables = ?vars, "Stopped streaming");
        } else {
            info!(previous = %previous, "Stopped streaming");
        }
        Ok(self.streaming_buffers_queue())
    }

    /// Stream until every variable has delivered at least `n_values` values.
    ///
    /// Each queue is sized to the buffers its variable needs,
    /// `ceil(n_values / data_length)`, so the returned queues hold exactly
    /// that many buffers.
    pub async fn stream_n_values<S: AsRef<str>>(
        &self,
        variables: &[S],
        n_values: usize,
        options: SessionOptions,
    ) -> Result<QueueSnapshot> {
        let started = self.begin(variables, StreamingMode::NValues, Some(n_values), options).await?;
        self.send_or_abort(self.watch_commands(&started.vars)).await?;
        info!(variables = ?started.vars, n_values, "Streaming values");
        self.await_completion(started.done).await?;
        self.stop_streaming(&started.vars).await
    }

    /// Stream each variable from its start timestamp for its duration, both
    /// in audio frames, and return once the device has stopped them all.
    ///
    /// Completion is observed by polling the watched set, so a variable the
    /// device never reports as stopped keeps this waiting; drop the future to
    /// give up.
    pub async fn schedule_streaming<S: AsRef<str>>(
        &self,
        variables: &[S],
        timestamps: &[u64],
        durations: &[u64],
        options: SessionOptions,
    ) -> Result<QueueSnapshot> {
        let vars = self.conn.check_vars(variables)?;
        if timestamps.len() != vars.len() || durations.len() != vars.len() {
            return Err(WatcherError::invalid_argument(format!(
                "{} variables need as many timestamps and durations (got {} and {})",
                vars.len(),
                timestamps.len(),
                durations.len()
            )));
        }
        let started = self.begin(&vars, StreamingMode::Schedule, None, options).await?;
        let watch = WatcherCommand::watch_scheduled(
            started.vars.clone(),
            timestamps.to_vec(),
            durations.to_vec(),
        );
        self.send_or_abort([watch]).await?;
        info!(variables = ?started.vars, ?timestamps, ?durations, "Scheduled streaming");

        let mut started_vars: Vec<String> = Vec::new();
        let mut finished_vars: Vec<String> = Vec::new();
        let mut poll = tokio::time::interval(self.conn.config().schedule_poll_interval());
        while !started.vars.iter().all(|v| finished_vars.contains(v)) {
            poll.tick().await;
            let watched: Vec<String> =
                self.conn.watched_vars().await?.into_iter().map(|v| v.name).collect();
            for var in &watched {
                if started.vars.contains(var) && !started_vars.contains(var) {
                    info!(var = %var, "Started streaming");
                    started_vars.push(var.clone());
                }
            }
            for var in &started_vars {
                if !watched.contains(var) && !finished_vars.contains(var) {
                    info!(var = %var, "Stopped streaming");
                    finished_vars.push(var.clone());
                }
            }
        }
        self.stop_streaming(&started.vars).await
    }

    /// Push a typed buffer to the device on the data channel.
    pub fn send_buffer(&self, id: u32, var_type: VarType, values: &Samples) -> Result<()> {
        let length = u32::try_from(values.len())
            .map_err(|_| WatcherError::invalid_argument("buffer too long"))?;
        let bytes = encode_outbound_buffer(id, var_type, length, values)?;
        debug!(id, var_type = %var_type, length, "Sending buffer");
        self.conn.send_data(bytes)
    }

    /// Read back a file written by a saving session.
    pub fn load_data_from_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ParsedBuffer>> {
        persist::load_data_from_file(path)
    }

    fn watch_commands(&self, vars: &[String]) -> [WatcherCommand; 2] {
        let all = self.conn.watcher_vars().iter().map(|v| v.name.clone()).collect();
        [WatcherCommand::Unwatch { watchers: all }, WatcherCommand::watch(vars.to_vec())]
    }

    /// Set up a session: stop the previous one, resolve variables, prepare
    /// saving and callbacks, reset the queues and switch mode.
    ///
    /// `quota` is the value count for `NValues`.
    async fn begin<S: AsRef<str>>(
        &self,
        variables: &[S],
        mode: StreamingMode,
        quota: Option<usize>,
        options: SessionOptions,
    ) -> Result<Started> {
        if self.is_streaming() {
            warn!(mode = %self.streaming_mode(), "Session already running, stopping it first");
            self.stop_streaming::<&str>(&[]).await?;
        }
        if !self.conn.is_connected() {
            return Err(WatcherError::channel_closed(self.conn.config().control_url()));
        }
        let vars = self.conn.check_vars(variables)?;
        if vars.is_empty() {
            return Err(WatcherError::invalid_argument("no variables to stream"));
        }

        let saving = match &options.saving_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| WatcherError::persistence(dir, e))?;
                let default = if self.conn.mode().carries_samples() {
                    "monitor.txt"
                } else {
                    "var_stream.txt"
                };
                let filename = options.saving_filename.as_deref().unwrap_or(default);
                let base = persist::generate_filename(dir, filename);
                info!(path = %base.display(), "Saving streamed data");
                Some(base)
            }
            None => None,
        };
        let block_timeout = self.conn.config().block_callback_timeout();
        let callbacks = options
            .callback
            .map(|callback| CallbackDispatcher::spawn(callback, vars.clone(), block_timeout));

        let watcher_vars = self.conn.watcher_vars();
        let (done_tx, done) = oneshot::channel();
        let mut state = self.shared.state();
        let names = watcher_vars.iter().map(|v| v.name.as_str());
        state.queues = QueueSet::new(names, state.queue_length);
        state.targets.clear();
        if let Some(n_values) = quota {
            for var in watcher_vars.iter().filter(|v| vars.contains(&v.name)) {
                let target = if self.conn.mode().carries_samples() {
                    n_values.max(1)
                } else {
                    n_values.div_ceil(var.data_length).max(1)
                };
                state.queues.resize(&var.name, target);
                state.targets.insert(var.name.clone(), target);
            }
        }
        state.requested = vars.clone();
        state.peeked.clear();
        state.completion = Some(done_tx);
        state.saving = saving;
        state.callbacks = callbacks;
        state.mode = mode;
        debug!(mode = %mode, variables = ?vars, "Session started");
        Ok(Started { vars, done })
    }

    /// Send a session's opening commands, undoing the setup if that fails.
    async fn send_or_abort(
        &self,
        commands: impl IntoIterator<Item = WatcherCommand>,
    ) -> Result<()> {
        if let Err(e) = self.conn.send_commands(commands) {
            self.wind_down().await;
            return Err(e);
        }
        Ok(())
    }

    /// Switch to `Off` and settle saving and callbacks. Returns the previous mode.
    async fn wind_down(&self) -> StreamingMode {
        let (previous, saving, callbacks) = {
            let mut state = self.shared.state();
            let previous = std::mem::take(&mut state.mode);
            state.completion = None;
            (previous, state.saving.take(), state.callbacks.take())
        };
        if saving.is_some() {
            self.shared.persist.flush().await;
        }
        if let Some(callbacks) = callbacks {
            let stats = callbacks.shutdown().await;
            debug!(?stats, "Callbacks finished");
        }
        previous
    }

    /// Wait for the session to signal completion.
    ///
    /// Returns early if the session is stopped elsewhere; fails if the
    /// connection goes away first.
    async fn await_completion(&self, done: oneshot::Receiver<()>) -> Result<()> {
        let cancel = self.conn.link_token().unwrap_or_default();
        tokio::select! {
            _ = done => Ok(()),
            _ = cancel.cancelled() => {
                self.wind_down().await;
                Err(WatcherError::channel_closed(self.conn.config().data_url()))
            }
        }
    }

    fn take_peeked(&self) -> BTreeMap<String, MonitorSample> {
        std::mem::take(&mut self.shared.state().peeked)
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("connection", &self.conn)
            .field("mode", &self.streaming_mode())
            .finish()
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if let Some(pump) = self.pump().take() {
            pump.abort();
        }
    }
}

/// Feed data messages through the demultiplexer until the connection ends.
async fn run_pump(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut demux: FrameDemultiplexer,
    cancel: CancellationToken,
) {
    debug!("Data pump started");
    let mut buffers = 0u64;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => message,
        };
        let Some(message) = message else { break };
        match demux.push(&message) {
            Ok(Some(buffer)) => {
                buffers += 1;
                shared.ingest(buffer);
            }
            Ok(None) => {}
            Err(e) => {
                shared.faults.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = message.len(), "Dropping data message");
            }
        }
    }
    debug!(buffers, "Data pump stopped");
}

#[cfg(test)]
mod tests;
