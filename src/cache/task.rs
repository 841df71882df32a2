//! Scoped handles for background work owned by the cache.
//!
//! Every load and every timer is a spawned Tokio task wrapped in a
//! [`TaskGuard`]. Dropping the guard aborts the task, so replacing the guard
//! stored for a key cancels the previous timer, and removing a tile cancels
//! everything it owns. Messages sent back by a task carry the guard id and are
//! ignored once that guard is no longer the registered one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::LoadError;
use crate::tile::{TileData, TileKey, TileState};

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a spawned task that aborts it when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    id: u64,
    handle: JoinHandle<()>,
}

impl TaskGuard {
    /// Spawn `make(id)` where `id` is the new guard's id.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(make(id));
        Self { id, handle }
    }

    /// Send `message(id)` on `tx` after `delay`.
    pub fn timer<M>(delay: Duration, tx: UnboundedSender<CacheMessage>, message: M) -> Self
    where
        M: FnOnce(u64) -> CacheMessage + Send + 'static,
    {
        trace!(delay_ms = delay.as_millis() as u64, "Timer armed");
        Self::spawn(move |id| async move {
            tokio::time::sleep(delay).await;
            // receiver gone means the cache was dropped
            let _ = tx.send(message(id));
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Messages delivered from background tasks to the cache.
#[derive(Debug)]
pub enum CacheMessage {
    /// A load issued for tile instance `uid` finished.
    Loaded {
        uid: u64,
        request: u64,
        previous_state: TileState,
        result: Result<TileData, LoadError>,
    },
    /// The expiry reload timer for `key` fired.
    ReloadDue { key: TileKey, timer: u64 },
    /// The symbol fade hold for `key` elapsed.
    FadeHoldDue { key: TileKey, timer: u64 },
    /// The earliest store entry expiry elapsed.
    StoreExpiryDue { timer: u64 },
}
