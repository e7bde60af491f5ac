//! Per-job progress tailing with backlog replay.
//!
//! One tailer exists per job with at least one subscriber. It owns a single
//! timer and a byte cursor into the job's progress file; every tick reads
//! what was appended since the cursor and fans the new records out once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::fanout::{Handler, deliver};
use crate::progress_log::{LogCursor, ProgressLog};
use crate::types::{JobId, ProgressRecord};

pub type ProgressHandler = Handler<ProgressRecord>;

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub interval: Duration,
    /// Records replayed to each new subscriber.
    pub backlog: usize,
    /// Maximum records read per tick.
    pub batch: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backlog: 500,
            batch: 200,
        }
    }
}

type TailerMap = Mutex<HashMap<JobId, Arc<JobTailer>>>;

#[derive(Clone)]
pub struct TailerRegistry {
    log: Arc<ProgressLog>,
    config: TailerConfig,
    tailers: Arc<TailerMap>,
}

impl TailerRegistry {
    pub fn new(log: Arc<ProgressLog>, config: TailerConfig) -> Self {
        Self {
            log,
            config,
            tailers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribes `handler` to `job_id`.
    ///
    /// The handler first receives up to `backlog` of the most recent records,
    /// then every record appended afterwards. Dropping the returned guard
    /// unsubscribes.
    pub async fn subscribe(
        &self,
        job_id: JobId,
        handler: ProgressHandler,
    ) -> Result<TailSubscription> {
        let (tailer, listener_id) = {
            let mut tailers = self.tailers.lock();
            let tailer = tailers
                .entry(job_id)
                .or_insert_with(|| {
                    let tailer = Arc::new(JobTailer::new(job_id));
                    self.spawn_loop(Arc::clone(&tailer));
                    tailer
                })
                .clone();
            let listener_id = tailer.add_listener(Arc::clone(&handler));
            (tailer, listener_id)
        };

        let subscription = TailSubscription {
            tailer: Arc::clone(&tailer),
            listener_id,
            tailers: Arc::downgrade(&self.tailers),
        };

        // Holding the cursor keeps ticks out while the newcomer is brought up
        // to the same position as everyone else.
        let mut cursor = tailer.cursor.lock().await;
        let end = match *cursor {
            Some(current) => {
                let caught_up = self
                    .log
                    .read_after(job_id, current, usize::MAX)
                    .await?;
                tailer.broadcast(&caught_up.records);
                Some(caught_up.cursor)
            }
            None => None,
        };

        let backlog = self
            .log
            .tail_until(job_id, self.config.backlog, end)
            .await?;
        debug!(
            job = %job_id,
            backlog = backlog.records.len(),
            "replaying progress backlog"
        );
        for record in &backlog.records {
            deliver(&handler, record);
        }
        *cursor = Some(end.unwrap_or(backlog.cursor));
        tailer.mark_ready(listener_id);
        drop(cursor);

        Ok(subscription)
    }

    /// Tears down a job's tailer regardless of subscribers.
    pub fn close_job(&self, job_id: JobId) -> bool {
        let removed = self.tailers.lock().remove(&job_id);
        match removed {
            Some(tailer) => {
                tailer.shutdown();
                debug!(job = %job_id, "closed progress tailer");
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.tailers.lock().keys().copied().collect()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.tailers
            .lock()
            .get(&job_id)
            .map_or(0, |tailer| tailer.listener_count())
    }

    /// Stops every tailer.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<JobTailer>> = self.tailers.lock().drain().map(|(_, t)| t).collect();
        for tailer in drained {
            tailer.shutdown();
        }
    }

    fn spawn_loop(&self, tailer: Arc<JobTailer>) {
        let log = Arc::clone(&self.log);
        let period = self.config.interval;
        let batch = self.config.batch;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tailer.stop.cancelled() => break,
                    _ = ticker.tick() => tailer.tick(&log, batch).await,
                }
            }
            trace!(job = %tailer.job_id, "progress tailer loop stopped");
        });
    }
}

impl fmt::Debug for TailerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailerRegistry")
            .field("dir", &self.log.dir())
            .field("config", &self.config)
            .field("active", &self.tailers.lock().len())
            .finish()
    }
}

struct Listener {
    handler: ProgressHandler,
    /// Set once the backlog has been delivered.
    ready: bool,
}

struct JobTailer {
    job_id: JobId,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
    cursor: tokio::sync::Mutex<Option<LogCursor>>,
    stop: CancellationToken,
}

impl JobTailer {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            cursor: tokio::sync::Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    fn add_listener(&self, handler: ProgressHandler) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(
            id,
            Listener {
                handler,
                ready: false,
            },
        );
        id
    }

    fn mark_ready(&self, id: u64) {
        if let Some(listener) = self.listeners.lock().get_mut(&id) {
            listener.ready = true;
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn broadcast(&self, records: &[ProgressRecord]) {
        if records.is_empty() {
            return;
        }
        let ready: Vec<ProgressHandler> = self
            .listeners
            .lock()
            .values()
            .filter(|listener| listener.ready)
            .map(|listener| Arc::clone(&listener.handler))
            .collect();
        for record in records {
            for handler in &ready {
                deliver(handler, record);
            }
        }
    }

    async fn tick(&self, log: &ProgressLog, batch: usize) {
        let Ok(mut cursor) = self.cursor.try_lock() else {
            trace!(job = %self.job_id, "read already in flight; skipping tick");
            return;
        };
        let Some(current) = *cursor else {
            return;
        };

        match log.read_after(self.job_id, current, batch).await {
            Ok(read) => {
                *cursor = Some(read.cursor);
                if !read.records.is_empty() {
                    trace!(job = %self.job_id, records = read.records.len(), "delivering progress");
                }
                self.broadcast(&read.records);
            }
            Err(err) => {
                warn!(job = %self.job_id, error = %err, "failed to read progress file");
            }
        }
    }

    fn shutdown(&self) {
        self.stop.cancel();
        self.listeners.lock().clear();
    }
}

/// Guard returned by [`TailerRegistry::subscribe`].
pub struct TailSubscription {
    tailer: Arc<JobTailer>,
    listener_id: u64,
    tailers: Weak<TailerMap>,
}

impl TailSubscription {
    pub fn job_id(&self) -> JobId {
        self.tailer.job_id
    }
}

impl fmt::Debug for TailSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailSubscription")
            .field("job_id", &self.tailer.job_id)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

impl Drop for TailSubscription {
    fn drop(&mut self) {
        self.tailer.listeners.lock().remove(&self.listener_id);

        let Some(tailers) = self.tailers.upgrade() else {
            return;
        };
        let mut tailers = tailers.lock();
        let owns_entry = tailers
            .get(&self.tailer.job_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.tailer));
        if owns_entry && self.tailer.listener_count() == 0 {
            tailers.remove(&self.tailer.job_id);
            self.tailer.stop.cancel();
            trace!(job = %self.tailer.job_id, "last progress subscriber left");
        }
    }
}
