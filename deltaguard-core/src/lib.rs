//! Scan job tracking and real-time progress distribution.
//!
//! - [`store`]: durable job records behind the [`store::JobStore`] trait.
//! - [`runner`]: launches and supervises scanner processes.
//! - [`progress_log`] and [`tailer`]: per-job NDJSON progress with backlog replay.
//! - [`change_bus`]: fan-out of job writes, by push notification or polling.
//! - [`hub`]: the registry the server builds once and shares.
//! - [`multiplexer`]: bounded pool of outbound event-stream connections.

pub mod change_bus;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod multiplexer;
pub mod progress_log;
pub mod runner;
pub mod sse;
pub mod store;
pub mod tailer;
pub mod types;

pub use error::{CoreError, Result};
pub use hub::{HubConfig, JobEventHub};
pub use types::{Job, JobId, JobPatch, JobSource, JobStatus, NewJob, ProgressRecord};
