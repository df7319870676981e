//! Mode-slot registry
//!
//! The device accepts one connection per mode slot, and refuses to run the
//! MONITOR and CONTROL slots side by side. A [`ModeRegistry`] tracks which
//! slots this process holds per endpoint. Acquiring an occupied slot cancels
//! the previous holder; acquiring a slot that excludes an active one fails.
//!
//! Registries are injected into connections. [`ModeRegistry::shared`] is the
//! process-wide instance; tests build isolated ones with [`ModeRegistry::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::ConnectionMode;
use crate::{ConnectionErrorKind, Result, WatcherError};

#[derive(Debug)]
struct Slot {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ModeRegistry {
    slots: Mutex<HashMap<(ConnectionMode, String), Slot>>,
    next_id: AtomicU64,
}

impl ModeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<ModeRegistry>> = OnceLock::new();
        SHARED.get_or_init(ModeRegistry::new).clone()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<(ConnectionMode, String), Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `mode` at `endpoint`.
    ///
    /// The returned lease's token is cancelled if a later connection takes
    /// the same slot.
    pub fn acquire(self: &Arc<Self>, mode: ConnectionMode, endpoint: &str) -> Result<Lease> {
        let mut slots = self.slots();

        if let Some(excluded) = mode.exclusive_with() {
            let key = (excluded, endpoint.to_string());
            if slots.get(&key).is_some_and(|slot| !slot.cancel.is_cancelled()) {
                return Err(WatcherError::connection(
                    ConnectionErrorKind::ModeConflict,
                    endpoint,
                    format!("{mode} cannot run while {excluded} is connected"),
                ));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous =
            slots.insert((mode, endpoint.to_string()), Slot { id, cancel: cancel.clone() });
        if let Some(previous) = previous.filter(|slot| !slot.cancel.is_cancelled()) {
            warn!(
                %mode,
                endpoint,
                "Only one active connection per mode is supported; closing the previous one"
            );
            previous.cancel.cancel();
        }
        debug!(%mode, endpoint, id, "Acquired mode slot");

        Ok(Lease { registry: Arc::clone(self), mode, endpoint: endpoint.to_string(), id, cancel })
    }

    /// Give a slot back. Releasing a superseded or already-released lease is a no-op.
    pub fn release(&self, lease: &Lease) {
        let mut slots = self.slots();
        let key = (lease.mode, lease.endpoint.clone());
        if slots.get(&key).is_some_and(|slot| slot.id == lease.id) {
            slots.remove(&key);
            debug!(
                mode = %lease.mode,
                endpoint = %lease.endpoint,
                id = lease.id,
                "Released mode slot"
            );
        }
    }

    pub fn is_active(&self, mode: ConnectionMode, endpoint: &str) -> bool {
        self.slots()
            .get(&(mode, endpoint.to_string()))
            .is_some_and(|slot| !slot.cancel.is_cancelled())
    }
}

/// A held mode slot. Released on drop.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<ModeRegistry>,
    mode: ConnectionMode,
    endpoint: String,
    id: u64,
    cancel: CancellationToken,
}

impl Lease {
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cancelled when this lease is superseded.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_superseded(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(self);
    }
}
