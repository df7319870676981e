//! Saving streamed buffers to disk
//!
//! Each variable of a saving session appends to its own newline-delimited
//! JSON file, one decoded buffer (or monitor sample) per line. Every file has
//! a single writer task fed in arrival order, so lines land in the order the
//! buffers were queued; a per-file lock keeps writers from different sinks
//! from interleaving lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::types::ParsedBuffer;
use crate::{Result, WatcherError};

type FileLocks = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

struct Writer {
    tx: mpsc::UnboundedSender<Arc<ParsedBuffer>>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    failures: AtomicU64,
}

#[derive(Default)]
struct Inner {
    writers: Mutex<HashMap<PathBuf, Writer>>,
    counters: Arc<Counters>,
}

/// Append-only JSON-lines sink shared by every variable of a session.
#[derive(Clone, Default)]
pub struct PersistenceSink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistenceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSink")
            .field("active_writes", &self.active_writes())
            .field("failures", &self.failures())
            .finish()
    }
}

/// Locks shared by every sink in the process, one per file.
fn file_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: std::sync::OnceLock<FileLocks> = std::sync::OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(FileLocks::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

impl PersistenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line to `path`, holding the file's lock for the write.
    pub async fn append<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        append_line(path, value).await
    }

    fn writers(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Writer>> {
        self.inner.writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a buffer for appending without waiting for it.
    ///
    /// Buffers queued for the same file are written in call order. Failures
    /// are logged and counted; they never reach the caller.
    pub fn spawn_append(&self, path: PathBuf, buffer: Arc<ParsedBuffer>) {
        let counters = &self.inner.counters;
        counters.queued.fetch_add(1, Ordering::Relaxed);
        let mut writers = self.writers();
        let writer = writers.entry(path.clone()).or_insert_with(|| self.spawn_writer(path));
        if let Err(mpsc::error::SendError(_)) = writer.tx.send(buffer) {
            counters.queued.fetch_sub(1, Ordering::Relaxed);
            counters.failures.fetch_add(1, Ordering::Relaxed);
            error!("Saving writer stopped before the buffer could be queued");
        }
    }

    fn spawn_writer(&self, path: PathBuf) -> Writer {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<ParsedBuffer>>();
        let counters = self.inner.counters.clone();
        let handle = tokio::spawn(async move {
            while let Some(buffer) = rx.recv().await {
                if let Err(e) = append_line(&path, buffer.as_ref()).await {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(path = %path.display(), error = %e, "Error while saving data to file");
                }
                counters.queued.fetch_sub(1, Ordering::Relaxed);
            }
            debug!(path = %path.display(), "Saving writer finished");
        });
        Writer { tx, handle }
    }

    /// Wait for every write queued so far to finish.
    ///
    /// Later calls to [`spawn_append`](Self::spawn_append) start fresh writers.
    pub async fn flush(&self) {
        let writers: Vec<Writer> = {
            let mut writers = self.writers();
            writers.drain().map(|(_, writer)| writer).collect()
        };
        for Writer { tx, handle } in writers {
            drop(tx);
            if let Err(e) = handle.await {
                error!(error = %e, "Saving writer failed");
            }
        }
    }

    /// Writes queued but not yet finished.
    pub fn active_writes(&self) -> usize {
        self.inner.counters.queued.load(Ordering::Relaxed)
    }

    /// Writes that failed since the sink was created.
    pub fn failures(&self) -> u64 {
        self.inner.counters.failures.load(Ordering::Relaxed)
    }
}

async fn append_line<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).map_err(|source| WatcherError::Serialization {
        context: "saved buffer".into(),
        source,
    })?;
    line.push(b'\n');

    let lock = file_lock(path);
    let _guard = lock.lock().await;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| WatcherError::persistence(path, e))?;
    file.write_all(&line).await.map_err(|e| WatcherError::persistence(path, e))?;
    file.flush().await.map_err(|e| WatcherError::persistence(path, e))?;
    trace!(path = %path.display(), bytes = line.len(), "Saved buffer");
    Ok(())
}

/// Pick a saving file name that no earlier session used.
///
/// Existing files matching `*{stem}*{ext}` in `dir` are grouped by the part
/// of their stem before any `__` suffix; if any exist, the result becomes
/// `{stem}__{n}{ext}` with `n` the size of the largest group.
pub fn generate_filename(dir: &Path, filename: &str) -> PathBuf {
    let (stem, ext) = split_extension(filename);
    let mut groups: HashMap<String, usize> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(ext) || !name.contains(stem) {
                continue;
            }
            let (existing_stem, _) = split_extension(&name);
            let root = existing_stem.split("__").next().unwrap_or(existing_stem);
            *groups.entry(root.to_string()).or_default() += 1;
        }
    }

    match groups.values().max() {
        None => dir.join(filename),
        Some(n) => dir.join(format!("{stem}__{n}{ext}")),
    }
}

/// The per-variable file for a session saving to `base`: `{var}_{file name}`.
pub fn var_file_path(base: &Path, var: &str) -> PathBuf {
    let file = base.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
    base.with_file_name(format!("{var}_{file}"))
}

/// A local path that doesn't overwrite an existing file: `{stem}_{n}{ext}`.
pub fn unique_local_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
    let (stem, ext) = split_extension(&file);
    let candidate = (1..)
        .map(|n| path.with_file_name(format!("{stem}_{n}{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf());
    warn!(from = %path.display(), to = %candidate.display(), "File already exists, renaming");
    candidate
}

/// `("name", ".ext")`, or `("name", "")` without an extension.
fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => filename.split_at(dot),
        _ => (filename, ""),
    }
}

/// Read back a file written by a saving session.
pub fn load_data_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<ParsedBuffer>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| WatcherError::persistence(path, e))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| WatcherError::Serialization {
                context: format!("{} line {}", path.display(), i + 1),
                source,
            })
        })
        .collect()
}
