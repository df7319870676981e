//! User callbacks on ingested buffers
//!
//! Ingestion never runs user code directly. Buffers are queued to a worker
//! task which invokes the callback on the blocking pool, so a slow or
//! panicking callback can't stall the data channel. Callback errors and
//! panics are logged and counted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::types::BufferEvent;

pub type BufferFn = dyn Fn(BufferEvent) -> anyhow::Result<()> + Send + Sync;
pub type BlockFn = dyn Fn(Vec<BufferEvent>) -> anyhow::Result<()> + Send + Sync;

/// What to call, and with what.
#[derive(Clone)]
pub enum Callback {
    /// Once per buffer, in arrival order
    OnBuffer(Arc<BufferFn>),
    /// Once per block holding one buffer of every requested variable, in
    /// request order
    OnBlock(Arc<BlockFn>),
}

impl Callback {
    pub fn on_buffer<F>(f: F) -> Self
    where
        F: Fn(BufferEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::OnBuffer(Arc::new(f))
    }

    pub fn on_block<F>(f: F) -> Self
    where
        F: Fn(Vec<BufferEvent>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Callback::OnBlock(Arc::new(f))
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callback::OnBuffer(_) => f.write_str("Callback::OnBuffer"),
            Callback::OnBlock(_) => f.write_str("Callback::OnBlock"),
        }
    }
}

/// Outcome counts for one dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackStats {
    pub invoked: u64,
    pub failed: u64,
    /// Blocks abandoned because a variable's buffer never arrived
    pub timed_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    invoked: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CallbackStats {
        CallbackStats {
            invoked: self.invoked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Queue plus worker for one session's callback.
#[derive(Debug)]
pub struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<BufferEvent>,
    worker: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl CallbackDispatcher {
    /// Start the worker. `vars` is the block layout for `OnBlock`.
    pub fn spawn(callback: Callback, vars: Vec<String>, block_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = match callback {
            Callback::OnBuffer(f) => tokio::spawn(run_buffer_worker(f, rx, counters.clone())),
            Callback::OnBlock(f) => {
                tokio::spawn(run_block_worker(f, vars, block_timeout, rx, counters.clone()))
            }
        };
        Self { tx, worker, counters }
    }

    /// Queue an event. Never blocks.
    pub fn dispatch(&self, event: BufferEvent) {
        if self.tx.send(event).is_err() {
            trace!("Callback worker gone, dropping event");
        }
    }

    pub fn stats(&self) -> CallbackStats {
        self.counters.snapshot()
    }

    /// Let the worker drain what is queued, then stop it.
    pub async fn shutdown(self) -> CallbackStats {
        let Self { tx, worker, counters } = self;
        drop(tx);
        if let Err(e) = worker.await {
            error!(error = %e, "Callback worker failed");
        }
        counters.snapshot()
    }
}

async fn run_buffer_worker(
    f: Arc<BufferFn>,
    mut rx: mpsc::UnboundedReceiver<BufferEvent>,
    counters: Arc<Counters>,
) {
    while let Some(event) = rx.recv().await {
        invoke(&f, event, &counters).await;
    }
    debug!("Buffer callback worker stopped");
}

async fn run_block_worker(
    f: Arc<BlockFn>,
    vars: Vec<String>,
    block_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<BufferEvent>,
    counters: Arc<Counters>,
) {
    let mut pending: HashMap<String, VecDeque<BufferEvent>> =
        vars.iter().map(|name| (name.clone(), VecDeque::new())).collect();
    // set while a block is partially filled
    let mut deadline: Option<Instant> = None;

    loop {
        let next = match deadline {
            None => rx.recv().await,
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    let missing: Vec<&str> = vars
                        .iter()
                        .filter(|v| pending.get(*v).is_some_and(VecDeque::is_empty))
                        .map(String::as_str)
                        .collect();
                    error!(
                        ?missing,
                        timeout = ?block_timeout,
                        "Timed out waiting for a complete block"
                    );
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    pending.values_mut().for_each(VecDeque::clear);
                    deadline = None;
                    continue;
                }
            },
        };
        let Some(event) = next else { break };

        let Some(queue) = pending.get_mut(&event.name) else {
            trace!(var = %event.name, "Buffer outside the callback block");
            continue;
        };
        queue.push_back(event);

        let mut emitted = false;
        if pending.values().all(|q| !q.is_empty()) {
            let block: Vec<BufferEvent> = vars
                .iter()
                .filter_map(|name| pending.get_mut(name).and_then(VecDeque::pop_front))
                .collect();
            invoke(&f, block, &counters).await;
            emitted = true;
        }
        // leftovers start a new block with a full timeout
        deadline = match (pending.values().any(|q| !q.is_empty()), emitted) {
            (false, _) => None,
            (true, true) => Some(Instant::now() + block_timeout),
            (true, false) => deadline.or_else(|| Some(Instant::now() + block_timeout)),
        };
    }

    let leftover: usize = pending.values().map(VecDeque::len).sum();
    if leftover > 0 {
        warn!(leftover, "Discarding incomplete callback block");
    }
    debug!("Block callback worker stopped");
}

async fn invoke<A, F>(f: &Arc<F>, arg: A, counters: &Counters)
where
    A: Send + 'static,
    F: Fn(A) -> anyhow::Result<()> + Send + Sync + ?Sized + 'static,
{
    let f = f.clone();
    counters.invoked.fetch_add(1, Ordering::Relaxed);
    match tokio::task::spawn_blocking(move || f(arg)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Error in callback");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MonitorSample, ParsedBuffer, Value};
    use std::sync::Mutex;

    fn event(name: &str, timestamp: u64) -> BufferEvent {
        BufferEvent {
            name: name.to_string(),
            buffer: Arc::new(ParsedBuffer::Monitor(MonitorSample {
                timestamp,
                value: Value::Int(0),
            })),
        }
    }

    #[tokio::test]
    async fn buffer_callbacks_survive_errors_and_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dispatcher = CallbackDispatcher::spawn(
            Callback::on_buffer(move |event| {
                match event.buffer.ref_timestamp() {
                    1 => anyhow::bail!("bad buffer"),
                    2 => panic!("callback bug"),
                    t => sink.lock().unwrap().push(t),
                }
                Ok(())
            }),
            vec![],
            Duration::from_secs(1),
        );
        for t in 0..5 {
            dispatcher.dispatch(event("a", t));
        }
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats, CallbackStats { invoked: 5, failed: 2, timed_out: 0 });
        assert_eq!(*seen.lock().unwrap(), vec![0, 3, 4]);
    }

    #[tokio::test]
    async fn blocks_hold_one_buffer_per_variable_in_request_order() {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = blocks.clone();
        let dispatcher = CallbackDispatcher::spawn(
            Callback::on_block(move |block| {
                let names: Vec<_> =
                    block.iter().map(|e| (e.name.clone(), e.buffer.ref_timestamp())).collect();
                sink.lock().unwrap().push(names);
                Ok(())
            }),
            vec!["a".into(), "b".into()],
            Duration::from_secs(1),
        );
        dispatcher.dispatch(event("b", 10));
        dispatcher.dispatch(event("a", 11));
        dispatcher.dispatch(event("a", 12));
        dispatcher.dispatch(event("zzz", 13));
        dispatcher.dispatch(event("b", 14));
        dispatcher.shutdown().await;

        let blocks = blocks.lock().unwrap();
        assert_eq!(
            *blocks,
            vec![
                vec![("a".to_string(), 11), ("b".to_string(), 10)],
                vec![("a".to_string(), 12), ("b".to_string(), 14)],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_blocks_time_out() {
        let dispatcher = CallbackDispatcher::spawn(
            Callback::on_block(|_| Ok(())),
            vec!["a".into(), "b".into()],
            Duration::from_millis(100),
        );
        dispatcher.dispatch(event("a", 1));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dispatcher.stats().timed_out, 1);

        // the next block starts fresh
        dispatcher.dispatch(event("a", 2));
        dispatcher.dispatch(event("b", 3));
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.invoked, 1);
        assert_eq!(stats.timed_out, 1);
    }
    #[tokio::test(start_paused = true)]
    async fn leftovers_get_a_full_timeout_after_a_block() {
        let dispatcher = CallbackDispatcher::spawn(
            Callback::on_block(|_| Ok(())),
            vec!["a".into(), "b".into()],
            Duration::from_millis(100),
        );
        dispatcher.dispatch(event("a", 1));
        tokio::time::sleep(Duration::from_millis(80)).await;
        dispatcher.dispatch(event("a", 2));
        dispatcher.dispatch(event("b", 3));

        // a@2 waits from the emitted block, not from a@1's arrival
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(dispatcher.stats().timed_out, 0);

        dispatcher.dispatch(event("b", 4));
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats, CallbackStats { invoked: 2, failed: 0, timed_out: 0 });
    }
}
