pub mod ids;
pub mod job;
pub mod progress;
pub mod report;

pub use ids::JobId;
pub use job::{DEFAULT_FORMAT, DEFAULT_MODE, Job, JobPatch, JobSource, JobStatus, NewJob};
pub use progress::{ProgressRecord, SUMMARY_STAGE};
pub use report::{Finding, ScanReport, SeveritySummary};
