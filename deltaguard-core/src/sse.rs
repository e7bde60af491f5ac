//! Payloads for one-directional event streams.

use crate::change_bus::ChangeEvent;
use crate::types::ProgressRecord;

/// Heartbeat comment text used between events.
pub const KEEP_ALIVE_TEXT: &str = "keep-alive";

pub fn progress_payload(record: &ProgressRecord) -> serde_json::Result<String> {
    serde_json::to_string(record)
}

pub fn change_payload(event: &ChangeEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
