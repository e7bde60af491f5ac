use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fanout::{Handler, HandlerSet};
use crate::store::{JobStore, JobWrite, JobWriteStream};
use crate::types::{Job, JobId};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_POLL_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct ChangeBusConfig {
    pub poll_interval: Duration,
    /// Rows re-listed on every poll tick.
    pub poll_limit: usize,
}

impl Default for ChangeBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }
}

/// How the bus learns about writes. Chosen once, on first subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Push,
    Poll,
}

/// Envelope delivered to job-list subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Snapshot { items: Vec<Job> },
    Changed { item: ChangedItem },
    ChangedBulk { items: Vec<Job> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangedItem {
    Job(Box<Job>),
    Deleted { id: JobId, deleted: bool },
}

impl From<JobWrite> for ChangeEvent {
    fn from(write: JobWrite) -> Self {
        let item = match write {
            JobWrite::Upserted(job) => ChangedItem::Job(Box::new(job)),
            JobWrite::Deleted(id) => ChangedItem::Deleted { id, deleted: true },
        };
        ChangeEvent::Changed { item }
    }
}

pub type ChangeHandler = Handler<ChangeEvent>;

struct BusInner {
    store: Arc<dyn JobStore>,
    config: ChangeBusConfig,
    handlers: HandlerSet<ChangeEvent>,
    started: OnceCell<()>,
    mode: Mutex<Option<BusMode>>,
    shutdown: CancellationToken,
}

/// Process-wide fan-out of job store writes.
///
/// At most one push subscription or poll timer exists per bus regardless of
/// subscriber count.
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new(store: Arc<dyn JobStore>, config: ChangeBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                config,
                handlers: HandlerSet::new(),
                started: OnceCell::new(),
                mode: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers `handler` and starts the bus if this is the first
    /// subscription. Dropping the guard unsubscribes.
    pub async fn subscribe(&self, handler: ChangeHandler) -> BusSubscription {
        let id = self.inner.handlers.insert(handler);
        self.inner
            .started
            .get_or_init(|| start(Arc::clone(&self.inner)))
            .await;
        BusSubscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Selected mode, or `None` before the first subscription.
    pub fn mode(&self) -> Option<BusMode> {
        *self.inner.mode.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for ChangeBus {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("mode", &self.mode())
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Guard returned by [`ChangeBus::subscribe`].
#[derive(Debug)]
pub struct BusSubscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.handlers.remove(self.id);
        }
    }
}

async fn start(inner: Arc<BusInner>) {
    match inner.store.subscribe_writes().await {
        Ok(stream) => {
            *inner.mode.lock() = Some(BusMode::Push);
            info!("job change bus using store write notifications");
            tokio::spawn(push_loop(inner, stream));
        }
        Err(err) => {
            *inner.mode.lock() = Some(BusMode::Poll);
            info!(
                error = %err,
                interval = ?inner.config.poll_interval,
                limit = inner.config.poll_limit,
                "job change bus falling back to polling"
            );
            tokio::spawn(poll_loop(inner));
        }
    }
}

async fn push_loop(inner: Arc<BusInner>, mut stream: JobWriteStream) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            next = stream.next() => match next {
                Some(write) => inner.handlers.broadcast(&ChangeEvent::from(write)),
                None => break,
            },
        }
    }

    warn!("job write notifications ended; switching to polling");
    *inner.mode.lock() = Some(BusMode::Poll);
    poll_loop(inner).await;
}

async fn poll_loop(inner: Arc<BusInner>) {
    let period = inner.config.poll_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if inner.handlers.is_empty() {
            continue;
        }
        match inner.store.list(inner.config.poll_limit).await {
            Ok(items) => inner.handlers.broadcast(&ChangeEvent::ChangedBulk { items }),
            Err(err) => warn!(error = %err, "job poll failed"),
        }
    }
    debug!("job poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deleted_item_wire_shape() {
        let id = JobId::new();
        let event = ChangeEvent::from(JobWrite::Deleted(id));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "changed", "item": {"id": id, "deleted": true}})
        );
    }

    #[test]
    fn bulk_wire_shape() {
        let event = ChangeEvent::ChangedBulk { items: Vec::new() };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "changed_bulk", "items": []})
        );
    }
}
