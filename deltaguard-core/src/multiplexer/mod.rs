//! Client-side pool of outbound event-stream connections.
//!
//! At most `max_open` transports are open at once. Consumers of the same
//! target share one transport; targets beyond the limit wait in FIFO order
//! until an open target loses its last listener.

use std::collections::hash_map::Entry::{Occupied, Vacant};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

#[cfg(feature = "client")]
pub mod eventsource;

#[cfg(feature = "client")]
pub use eventsource::EventSourceConnector;

pub const DEFAULT_MAX_OPEN: usize = 5;

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub max_open: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN,
        }
    }
}

/// One inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl StreamMessage {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultiplexError {
    #[error("connection multiplexer was dropped")]
    Shutdown,
}

type MessageFn = Arc<dyn Fn(&StreamMessage) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&TransportError) + Send + Sync>;
type OpenFn = Box<dyn FnOnce() + Send>;

/// Callbacks for one consumer of a target.
pub struct StreamListener {
    on_message: MessageFn,
    on_error: Option<ErrorFn>,
    on_open: Option<OpenFn>,
}

impl StreamListener {
    pub fn new(on_message: impl Fn(&StreamMessage) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_error: None,
            on_open: None,
        }
    }

    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Runs once, when the caller's `open` resolves with a live transport.
    pub fn on_open(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamListener")
            .field("on_error", &self.on_error.is_some())
            .field("on_open", &self.on_open.is_some())
            .finish()
    }
}

/// Opens transports. `connect` must not block; the transport delivers
/// events through `sink` from its own task.
pub trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        target: &str,
        sink: TransportSink,
    ) -> Result<Box<dyn StreamTransport>, TransportError>;
}

pub trait StreamTransport: Send {
    fn close(&mut self);
}

/// Handed to a transport so it can report events for its entry.
#[derive(Clone)]
pub struct TransportSink {
    shared: Weak<MuxShared>,
    target: String,
    serial: u64,
}

impl TransportSink {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn message(&self, message: StreamMessage) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let handlers: Vec<MessageFn> = {
            let state = shared.state.lock();
            match state.entries.get(&self.target) {
                Some(entry) if entry.serial == self.serial => entry
                    .listeners
                    .values()
                    .map(|listener| Arc::clone(&listener.on_message))
                    .collect(),
                _ => return,
            }
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                warn!(stream = %self.target, "stream listener panicked");
            }
        }
    }

    /// Reports a transport failure. Listeners get the error, then the entry
    /// is torn down and the next queued target is promoted.
    pub fn error(&self, error: TransportError) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(removed) = shared.remove_entry(&self.target, self.serial) else {
            return;
        };
        debug!(stream = %self.target, error = %error, "stream transport failed");
        removed.finish(Some(&error));
        shared.pump();
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink")
            .field("target", &self.target)
            .field("serial", &self.serial)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Queued,
    /// Holds an open slot while the connector runs.
    Opening,
    Open,
}

impl EntryStatus {
    fn holds_slot(self) -> bool {
        matches!(self, EntryStatus::Opening | EntryStatus::Open)
    }
}

enum OpenSignal {
    Opened,
    Failed,
}

struct RegisteredListener {
    on_message: MessageFn,
    on_error: Option<ErrorFn>,
}

struct Entry {
    serial: u64,
    status: EntryStatus,
    transport: Option<Box<dyn StreamTransport>>,
    listeners: HashMap<u64, RegisteredListener>,
    waiters: Vec<oneshot::Sender<OpenSignal>>,
}

/// An entry taken out of the map; cleanup runs outside the lock.
struct RemovedEntry {
    target: String,
    transport: Option<Box<dyn StreamTransport>>,
    error_handlers: Vec<ErrorFn>,
    waiters: Vec<oneshot::Sender<OpenSignal>>,
}

impl RemovedEntry {
    fn finish(mut self, error: Option<&TransportError>) {
        if let Some(error) = error {
            for handler in &self.error_handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                    warn!(stream = %self.target, "stream error listener panicked");
                }
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(OpenSignal::Failed);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            trace!(stream = %self.target, "stream transport closed");
        }
    }
}

#[derive(Default)]
struct MuxState {
    entries: HashMap<String, Entry>,
    fifo: VecDeque<(String, u64)>,
    open: usize,
    next_serial: u64,
    next_listener: u64,
}

struct MuxShared {
    max_open: usize,
    connector: Arc<dyn StreamConnector>,
    state: Mutex<MuxState>,
}

impl MuxShared {
    fn remove_entry(&self, target: &str, serial: u64) -> Option<RemovedEntry> {
        let mut state = self.state.lock();
        if state.entries.get(target).is_none_or(|entry| entry.serial != serial) {
            return None;
        }
        let entry = state.entries.remove(target)?;
        if entry.status.holds_slot() {
            state.open = state.open.saturating_sub(1);
        }
        Some(RemovedEntry {
            target: target.to_string(),
            transport: entry.transport,
            error_handlers: entry
                .listeners
                .values()
                .filter_map(|listener| listener.on_error.clone())
                .collect(),
            waiters: entry.waiters,
        })
    }

    fn remove_listener(self: &Arc<Self>, target: &str, serial: u64, listener_id: u64) {
        let removed = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(target) else {
                return;
            };
            if entry.serial != serial || entry.listeners.remove(&listener_id).is_none() {
                return;
            }
            if !entry.listeners.is_empty() {
                return;
            }
            let Some(entry) = state.entries.remove(target) else {
                return;
            };
            if entry.status.holds_slot() {
                state.open = state.open.saturating_sub(1);
            }
            RemovedEntry {
                target: target.to_string(),
                transport: entry.transport,
                error_handlers: Vec::new(),
                waiters: entry.waiters,
            }
        };
        debug!(stream = %target, "last stream listener left");
        removed.finish(None);
        self.pump();
    }

    /// Promotes queued entries while slots are free.
    fn pump(self: &Arc<Self>) {
        loop {
            let (target, serial) = {
                let mut state = self.state.lock();
                let mut next = None;
                while state.open < self.max_open {
                    let Some((target, serial)) = state.fifo.pop_front() else {
                        break;
                    };
                    let Some(entry) = state.entries.get_mut(&target) else {
                        continue;
                    };
                    if entry.serial != serial || entry.status != EntryStatus::Queued {
                        continue;
                    }
                    entry.status = EntryStatus::Opening;
                    state.open += 1;
                    next = Some((target, serial));
                    break;
                }
                match next {
                    Some(next) => next,
                    None => return,
                }
            };

            let sink = TransportSink {
                shared: Arc::downgrade(self),
                target: target.clone(),
                serial,
            };
            let result = self.connector.connect(&target, sink);
            self.settle(target, serial, result);
        }
    }

    fn settle(
        &self,
        target: String,
        serial: u64,
        result: Result<Box<dyn StreamTransport>, TransportError>,
    ) {
        match result {
            Ok(transport) => {
                let mut transport = Some(transport);
                let waiters = {
                    let mut state = self.state.lock();
                    match state.entries.get_mut(&target) {
                        Some(entry) if entry.serial == serial => {
                            entry.status = EntryStatus::Open;
                            entry.transport = transport.take();
                            std::mem::take(&mut entry.waiters)
                        }
                        _ => Vec::new(),
                    }
                };
                if let Some(mut orphan) = transport {
                    // Every listener left while connecting.
                    orphan.close();
                    return;
                }
                debug!(stream = %target, "stream transport opened");
                for waiter in waiters {
                    let _ = waiter.send(OpenSignal::Opened);
                }
            }
            Err(error) => {
                warn!(stream = %target, error = %error, "stream transport failed to open");
                if let Some(removed) = self.remove_entry(&target, serial) {
                    removed.finish(Some(&error));
                }
            }
        }
    }
}

/// Bounded pool of shared outbound stream connections.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    shared: Arc<MuxShared>,
}

/// Snapshot returned by [`ConnectionMultiplexer::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiplexerState {
    pub max: usize,
    pub open: usize,
    pub queued: usize,
    pub targets: Vec<String>,
}

impl ConnectionMultiplexer {
    pub fn new(connector: Arc<dyn StreamConnector>, config: MultiplexerConfig) -> Self {
        Self {
            shared: Arc::new(MuxShared {
                max_open: config.max_open.max(1),
                connector,
                state: Mutex::new(MuxState::default()),
            }),
        }
    }

    /// Attaches `listener` to `target`, opening or queueing a transport as
    /// needed. Resolves once the target's transport is open, or immediately
    /// if it already is. If the transport fails to open, the listener's
    /// error callback runs and the returned closer is a no-op.
    ///
    /// Dropping the returned future before it resolves detaches the listener.
    pub async fn open(
        &self,
        target: impl Into<String>,
        listener: StreamListener,
    ) -> Result<StreamCloser, MultiplexError> {
        let target = target.into();
        let StreamListener {
            on_message,
            on_error,
            on_open,
        } = listener;

        let (closer, pending) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let listener_id = state.next_listener;
            state.next_listener += 1;

            let entry = match state.entries.entry(target.clone()) {
                Occupied(occupied) => occupied.into_mut(),
                Vacant(vacant) => {
                    let serial = state.next_serial;
                    state.next_serial += 1;
                    state.fifo.push_back((target.clone(), serial));
                    trace!(stream = %target, "stream target queued");
                    vacant.insert(Entry {
                        serial,
                        status: EntryStatus::Queued,
                        transport: None,
                        listeners: HashMap::new(),
                        waiters: Vec::new(),
                    })
                }
            };
            entry.listeners.insert(
                listener_id,
                RegisteredListener {
                    on_message,
                    on_error,
                },
            );
            let pending = if entry.status == EntryStatus::Open {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                Some(rx)
            };
            let closer = StreamCloser {
                shared: Arc::downgrade(&self.shared),
                target: target.clone(),
                serial: entry.serial,
                listener_id,
                closed: false,
            };
            (closer, pending)
        };

        let opened = match pending {
            None => true,
            Some(rx) => {
                self.shared.pump();
                match rx.await {
                    Ok(OpenSignal::Opened) => true,
                    Ok(OpenSignal::Failed) => false,
                    Err(_) => return Err(MultiplexError::Shutdown),
                }
            }
        };

        if opened
            && let Some(on_open) = on_open
            && catch_unwind(AssertUnwindSafe(on_open)).is_err()
        {
            warn!(stream = %target, "stream open callback panicked");
        }
        Ok(closer)
    }

    pub fn state(&self) -> MultiplexerState {
        let state = self.shared.state.lock();
        let mut targets: Vec<String> = state.entries.keys().cloned().collect();
        targets.sort();
        MultiplexerState {
            max: self.shared.max_open,
            open: state.open,
            queued: state
                .entries
                .values()
                .filter(|entry| entry.status == EntryStatus::Queued)
                .count(),
            targets,
        }
    }
}

impl fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("state", &self.state())
            .finish()
    }
}

/// Detaches one listener. Closing happens on drop as well.
pub struct StreamCloser {
    shared: Weak<MuxShared>,
    target: String,
    serial: u64,
    listener_id: u64,
    closed: bool,
}

impl StreamCloser {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(&self.target, self.serial, self.listener_id);
        }
    }
}

impl Drop for StreamCloser {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCloser")
            .field("target", &self.target)
            .field("listener_id", &self.listener_id)
            .field("closed", &self.closed)
            .finish()
    }
}
