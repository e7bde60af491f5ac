use std::{fmt, sync::Arc};

use deltaguard_core::JobEventHub;
use tokio_util::sync::CancellationToken;

use crate::infra::config::Config;
use crate::infra::scan_tracker::ScanTracker;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<JobEventHub>,
    pub config: Arc<Config>,
    pub scans: ScanTracker,
    /// Cancelled on server shutdown; open event streams end with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(hub: Arc<JobEventHub>, config: Arc<Config>) -> Self {
        Self {
            hub,
            config,
            scans: ScanTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &Arc<JobEventHub> {
        &self.hub
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("hub", &self.hub)
            .field("scans", &self.scans)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
