//! Copying files off the device
//!
//! Log files live on the device's filesystem. The logger only needs a few
//! file operations, expressed by [`FileTransfer`]. Blocking implementations
//! (an SFTP session, a mounted filesystem) plug in through
//! [`BlockingTransfer`], which runs them on the blocking pool so they never
//! hold up the watcher channels.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{Result, WatcherError};

/// Async file operations on the device.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `remote` to `local`. `Ok(None)` if the remote file doesn't exist.
    async fn copy_file(&self, remote: &str, local: &Path) -> Result<Option<PathBuf>>;

    async fn delete_file(&self, remote: &str) -> Result<()>;

    /// Names of the `.bin` files in `dir`.
    async fn list_remote_bin_files(&self, dir: &str) -> Result<Vec<String>>;

    /// Size in bytes, or `None` if the file doesn't exist.
    async fn remote_file_size(&self, remote: &str) -> Result<Option<u64>>;
}

/// Blocking file operations, adapted to [`FileTransfer`] by [`BlockingTransfer`].
pub trait BlockingFileTransfer: Send + Sync + 'static {
    fn copy_file(&self, remote: &str, local: &Path) -> io::Result<()>;
    fn delete_file(&self, remote: &str) -> io::Result<()>;
    fn list_dir(&self, dir: &str) -> io::Result<Vec<String>>;
    fn file_size(&self, remote: &str) -> io::Result<Option<u64>>;
}

/// Runs a [`BlockingFileTransfer`] on the blocking pool.
///
/// Copies are bounded by `base_timeout + size / min_throughput`, so large
/// files get the time they need while a hung transfer still fails.
#[derive(Debug)]
pub struct BlockingTransfer<T> {
    inner: Arc<T>,
    base_timeout: Duration,
    /// Bytes per second
    min_throughput: u64,
}

impl<T: BlockingFileTransfer> BlockingTransfer<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
            base_timeout: Duration::from_secs(5),
            min_throughput: 256 * 1024,
        }
    }

    pub fn with_timeouts(mut self, base_timeout: Duration, min_throughput: u64) -> Self {
        self.base_timeout = base_timeout;
        self.min_throughput = min_throughput.max(1);
        self
    }

    /// Time allowed to copy a file of `size` bytes.
    pub fn copy_timeout(&self, size: u64) -> Duration {
        self.base_timeout + Duration::from_secs_f64(size as f64 / self.min_throughput as f64)
    }

    async fn run<R, F>(&self, remote: &str, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&T) -> io::Result<R> + Send + 'static,
    {
        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || op(&inner)).await {
            Ok(result) => result.map_err(|e| WatcherError::transfer_failed(remote, e.to_string())),
            Err(e) => {
                Err(WatcherError::transfer_failed(remote, format!("transfer task failed: {e}")))
            }
        }
    }
}

#[async_trait]
impl<T: BlockingFileTransfer> FileTransfer for BlockingTransfer<T> {
    async fn copy_file(&self, remote: &str, local: &Path) -> Result<Option<PathBuf>> {
        let Some(size) = self.remote_file_size(remote).await? else {
            warn!(remote, "Remote file does not exist");
            return Ok(None);
        };
        let timeout = self.copy_timeout(size);
        debug!(remote, local = %local.display(), size, ?timeout, "Copying file");

        let (from, to) = (remote.to_string(), local.to_path_buf());
        let copy = self.run(remote, move |t| t.copy_file(&from, &to));
        match tokio::time::timeout(timeout, copy).await {
            Ok(result) => result.map(|()| Some(local.to_path_buf())),
            Err(_) => {
                let reason = format!("copy of {size} bytes timed out after {timeout:?}");
                Err(WatcherError::transfer_failed(remote, reason))
            }
        }
    }

    async fn delete_file(&self, remote: &str) -> Result<()> {
        let path = remote.to_string();
        self.run(remote, move |t| t.delete_file(&path)).await
    }

    async fn list_remote_bin_files(&self, dir: &str) -> Result<Vec<String>> {
        let path = dir.to_string();
        let mut names = self.run(dir, move |t| t.list_dir(&path)).await?;
        names.retain(|name| name.ends_with(".bin"));
        names.sort();
        Ok(names)
    }

    async fn remote_file_size(&self, remote: &str) -> Result<Option<u64>> {
        let path = remote.to_string();
        self.run(remote, move |t| t.file_size(&path)).await
    }
}

/// Device filesystem reachable as local paths (a mount, or a test directory).
#[derive(Debug, Clone, Default)]
pub struct LocalFsTransfer;

impl BlockingFileTransfer for LocalFsTransfer {
    fn copy_file(&self, remote: &str, local: &Path) -> io::Result<()> {
        std::fs::copy(remote, local).map(|_| ())
    }

    fn delete_file(&self, remote: &str) -> io::Result<()> {
        std::fs::remove_file(remote)
    }

    fn list_dir(&self, dir: &str) -> io::Result<Vec<String>> {
        std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    fn file_size(&self, remote: &str) -> io::Result<Option<u64>> {
        match std::fs::metadata(remote) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
