//! # deltaguard server
//!
//! HTTP front end for the scan job hub:
//!
//! - **Jobs**: create, fetch and delete scan jobs
//! - **Scan control**: cancel a running scan
//! - **Live streams**: the job list and per-job progress as server-sent events
//!
//! Jobs persist in PostgreSQL when `DATABASE_URL` is set and in memory
//! otherwise.

pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;
pub mod watch;

pub use errors::{AppError, AppResult};
pub use infra::app_state::AppState;
