pub mod events;
pub mod jobs;

pub use events::{job_events_handler, job_progress_events_handler};
pub use jobs::{
    cancel_scan_handler, create_job_handler, delete_job_handler, get_job_handler,
    list_progress_handler,
};
