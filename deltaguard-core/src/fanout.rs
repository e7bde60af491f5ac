use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// Subscriber callback. Handlers run on the delivering task and must not block.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registered handlers keyed by subscription id.
///
/// Delivery iterates over a snapshot taken under the lock, so handlers may
/// subscribe or unsubscribe from inside a callback.
pub struct HandlerSet<T> {
    handlers: Mutex<HashMap<u64, Handler<T>>>,
    next_id: AtomicU64,
}

impl<T> HandlerSet<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, handler: Handler<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Delivers `event` to every handler. A panicking handler is logged and
    /// skipped; the remaining handlers still run.
    pub fn broadcast(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = self.handlers.lock().values().cloned().collect();
        for handler in snapshot {
            deliver(&handler, event);
        }
    }
}

impl<T> Default for HandlerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandlerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Runs one handler, isolating panics.
pub(crate) fn deliver<T>(handler: &Handler<T>, event: &T) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        warn!("subscriber handler panicked; continuing delivery");
    }
}
