//! Logging variables to files on the device
//!
//! Unlike streaming, a logging session writes buffers to binary files on
//! the device itself (see [`crate::log`] for the format). The device picks
//! each file's name; the logger resolves it from a list query and can copy
//! the finished files to the host through a [`FileTransfer`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::WatcherCommand;
use crate::connection::WatcherConnection;
use crate::log::LogFile;
use crate::persist::unique_local_path;
use crate::transfer::FileTransfer;
use crate::types::{ConnectionMode, TimestampMode};
use crate::{LinkConfig, Result, WatcherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    #[default]
    Off,
    Forever,
    Scheduled,
}

/// A file the device is logging to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedFile {
    pub var: String,
    pub remote_path: String,
    /// Where the file is copied on the host, if transferring
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct LoggerState {
    mode: LoggingMode,
    /// Copies to run when logging stops
    pending: Vec<LoggedFile>,
    copied: Vec<PathBuf>,
}

/// Controls logging sessions on the LOG slot.
pub struct Logger {
    conn: WatcherConnection,
    transfer: Option<Arc<dyn FileTransfer>>,
    state: Arc<Mutex<LoggerState>>,
    copies: TaskTracker,
}

impl Logger {
    pub fn new(config: LinkConfig) -> Self {
        Self::from_connection(WatcherConnection::new(config, ConnectionMode::Log))
    }

    pub fn from_connection(conn: WatcherConnection) -> Self {
        Self { conn, transfer: None, state: Arc::default(), copies: TaskTracker::new() }
    }

    /// Use `transfer` for copying and deleting device files.
    pub fn with_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn connection(&self) -> &WatcherConnection {
        &self.conn
    }

    pub async fn connect(&self) -> Result<()> {
        self.conn.connect().await
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    fn state(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn logging_mode(&self) -> LoggingMode {
        self.state().mode
    }

    pub fn is_logging(&self) -> bool {
        self.logging_mode() != LoggingMode::Off
    }

    fn transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        self.transfer
            .clone()
            .ok_or_else(|| WatcherError::invalid_argument("no file transfer configured"))
    }

    /// Directory of the connected project on the device.
    pub fn remote_project_dir(&self) -> Result<String> {
        let project = self.project()?;
        Ok(self.conn.config().remote_project_path(&project, "").trim_end_matches('/').to_string())
    }

    fn project(&self) -> Result<String> {
        self.conn
            .project_name()
            .ok_or_else(|| WatcherError::channel_closed(self.conn.config().control_url()))
    }

    /// Log `variables` (empty for all) until [`stop_logging`].
    ///
    /// With `transfer`, each file is copied into `dir` once logging stops.
    ///
    /// [`stop_logging`]: Logger::stop_logging
    pub async fn start_logging<S: AsRef<str>>(
        &self,
        variables: &[S],
        transfer: bool,
        dir: &Path,
    ) -> Result<Vec<LoggedFile>> {
        let files = self.begin(variables, &[], &[], transfer, dir, LoggingMode::Forever).await?;
        if transfer {
            self.state().pending.extend(files.iter().cloned());
        }
        Ok(files)
    }

    /// Log each variable from its start timestamp for its duration, both in
    /// audio frames.
    ///
    /// With `transfer`, each file is copied into `dir` once it has appeared
    /// and the longest duration has elapsed.
    pub async fn schedule_logging<S: AsRef<str>>(
        &self,
        variables: &[S],
        timestamps: &[u64],
        durations: &[u64],
        transfer: bool,
        dir: &Path,
    ) -> Result<Vec<LoggedFile>> {
        let vars = self.conn.check_vars(variables)?;
        if timestamps.len() != vars.len() || durations.len() != vars.len() {
            return Err(WatcherError::invalid_argument(format!(
                "{} variables need as many timestamps and durations (got {} and {})",
                vars.len(),
                timestamps.len(),
                durations.len()
            )));
        }
        let files =
            self.begin(&vars, timestamps, durations, transfer, dir, LoggingMode::Scheduled).await?;
        if transfer {
            let transfer = self.transfer()?;
            let sample_rate = self.conn.sample_rate();
            let longest = durations.iter().copied().max().unwrap_or(0);
            let wait = if sample_rate > 0.0 {
                Duration::from_secs_f64(longest as f64 / sample_rate)
            } else {
                Duration::ZERO
            };
            let poll = self.conn.config().schedule_poll_interval();
            let cancel = self.conn.link_token().unwrap_or_default();
            for file in files.iter().cloned() {
                let (transfer, state, cancel) =
                    (transfer.clone(), self.state.clone(), cancel.clone());
                self.copies.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let remote = &file.remote_path;
                            debug!(%remote, "Connection closed before scheduled copy");
                        }
                        _ = copy_when_done(transfer.as_ref(), &file, poll, wait, &state) => {}
                    }
                });
            }
        }
        Ok(files)
    }

    async fn begin<S: AsRef<str>>(
        &self,
        variables: &[S],
        timestamps: &[u64],
        durations: &[u64],
        transfer: bool,
        dir: &Path,
        mode: LoggingMode,
    ) -> Result<Vec<LoggedFile>> {
        let vars = self.conn.check_vars(variables)?;
        if transfer {
            self.transfer()?;
            tokio::fs::create_dir_all(dir).await.map_err(|e| WatcherError::persistence(dir, e))?;
        }
        if self.is_logging() {
            warn!("Logging already running, stopping it first");
            self.stop_logging::<&str>(&[]).await?;
        }

        let log = WatcherCommand::log(vars.clone(), timestamps.to_vec(), durations.to_vec());
        self.conn.send_commands([log])?;
        let list = self.conn.list().await?;
        let project = self.project()?;

        let mut files = Vec::with_capacity(vars.len());
        for var in &vars {
            let entry =
                list.entry(var).filter(|e| !e.log_file_name.is_empty()).ok_or_else(|| {
                    let details = format!("device reported no log file for {var}");
                    WatcherError::protocol("Log start", details)
                })?;
            let remote_path =
                self.conn.config().remote_project_path(&project, &entry.log_file_name);
            let local_path = transfer.then(|| unique_local_path(&dir.join(&entry.log_file_name)));
            files.push(LoggedFile { var: var.clone(), remote_path, local_path });
        }
        self.state().mode = mode;
        info!(variables = ?vars, mode = ?mode, "Started logging");
        Ok(files)
    }

    /// Stop logging `variables` (empty for all) and finish every pending
    /// copy. Returns the host paths copied since logging started.
    pub async fn stop_logging<S: AsRef<str>>(&self, variables: &[S]) -> Result<Vec<PathBuf>> {
        let vars = self.conn.check_vars(variables)?;
        self.state().mode = LoggingMode::Off;
        if self.conn.is_connected() {
            self.conn.send_commands([WatcherCommand::Unlog { watchers: vars.clone() }])?;
            info!(variables = ?vars, "Stopped logging");
        }

        let pending = std::mem::take(&mut self.state().pending);
        if !pending.is_empty() {
            let transfer = self.transfer()?;
            for file in pending {
                let (transfer, state) = (transfer.clone(), self.state.clone());
                self.copies.spawn(async move {
                    copy_logged_file(transfer.as_ref(), &file, &state).await
                });
            }
        }
        self.copies.close();
        self.copies.wait().await;
        self.copies.reopen();
        Ok(std::mem::take(&mut self.state().copied))
    }

    /// Decode a log file copied from the device.
    pub fn read_binary_file<P: AsRef<Path>>(
        &self,
        path: P,
        timestamp_mode: TimestampMode,
    ) -> Result<LogFile> {
        crate::log::read_binary_file(path, timestamp_mode)
    }

    /// Copy every `.bin` file of the project into `dir`.
    ///
    /// A failing file is reported and skipped.
    pub async fn copy_all_bin_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let transfer = self.transfer()?;
        let remote_dir = self.remote_project_dir()?;
        tokio::fs::create_dir_all(dir).await.map_err(|e| WatcherError::persistence(dir, e))?;
        let names = transfer.list_remote_bin_files(&remote_dir).await?;
        if names.is_empty() {
            warn!(dir = %remote_dir, "No .bin files in project");
        }

        let mut copied = Vec::with_capacity(names.len());
        for name in names {
            let remote = format!("{remote_dir}/{name}");
            let local = unique_local_path(&dir.join(&name));
            match transfer.copy_file(&remote, &local).await {
                Ok(Some(path)) => copied.push(path),
                Ok(None) => {}
                Err(e) => error!(remote = %remote, error = %e, "Error copying file"),
            }
        }
        info!(count = copied.len(), dir = %dir.display(), "Copied .bin files");
        Ok(copied)
    }

    /// Delete every `.bin` file of the project. Returns how many were deleted.
    pub async fn delete_all_bin_files(&self) -> Result<usize> {
        let transfer = self.transfer()?;
        let remote_dir = self.remote_project_dir()?;
        let mut deleted = 0;
        for name in transfer.list_remote_bin_files(&remote_dir).await? {
            match self.delete_file(&format!("{remote_dir}/{name}")).await {
                Ok(()) => deleted += 1,
                Err(e) => error!(file = %name, error = %e, "Error deleting file"),
            }
        }
        info!(deleted, dir = %remote_dir, "Deleted .bin files");
        Ok(deleted)
    }

    pub async fn delete_file(&self, remote: &str) -> Result<()> {
        self.transfer()?.delete_file(remote).await?;
        debug!(remote, "Deleted file");
        Ok(())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("connection", &self.conn)
            .field("mode", &self.logging_mode())
            .field("transfer", &self.transfer.is_some())
            .finish()
    }
}

async fn copy_logged_file(
    transfer: &dyn FileTransfer,
    file: &LoggedFile,
    state: &Mutex<LoggerState>,
) {
    let Some(local) = &file.local_path else { return };
    match transfer.copy_file(&file.remote_path, local).await {
        Ok(Some(path)) => {
            info!(remote = %file.remote_path, local = %path.display(), "Copied log file");
            state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).copied.push(path);
        }
        Ok(None) => {}
        Err(e) => error!(var = %file.var, error = %e, "Error copying log file"),
    }
}

/// Wait for a scheduled log file to appear and its session to end, then copy it.
async fn copy_when_done(
    transfer: &dyn FileTransfer,
    file: &LoggedFile,
    poll: Duration,
    wait: Duration,
    state: &Mutex<LoggerState>,
) {
    loop {
        match transfer.remote_file_size(&file.remote_path).await {
            Ok(Some(size)) if size > 0 => break,
            Ok(_) => {}
            Err(e) => {
                error!(remote = %file.remote_path, error = %e, "Error checking log file");
                return;
            }
        }
        tokio::time::sleep(poll).await;
    }
    debug!(remote = %file.remote_path, ?wait, "Log file started, waiting for the session to end");
    tokio::time::sleep(wait).await;
    copy_logged_file(transfer, file, state).await;
}
