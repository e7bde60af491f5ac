use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::JobId;

/// Stage name the runner uses for the terminal record of every job.
pub const SUMMARY_STAGE: &str = "scan.summary";

/// One status line emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: JobId,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// Dotted hierarchical stage name, e.g. `scan.deps.resolve`.
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, rename = "pct", skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
}

impl ProgressRecord {
    /// Percent clamped into `0..=100`, if the record carries one.
    pub fn percent_whole(&self) -> Option<u8> {
        self.percent
            .filter(|pct| pct.is_finite())
            .map(|pct| pct.clamp(0.0, 100.0).floor() as u8)
    }
}

/// On-disk shape of a progress line. The job id is implied by the file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogLine {
    pub ts: DateTime<Utc>,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pct: Option<f32>,
}

impl LogLine {
    pub fn into_record(self, job_id: JobId) -> ProgressRecord {
        ProgressRecord {
            job_id,
            timestamp: self.ts,
            stage: self.stage,
            detail: self.detail,
            percent: self.pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scanner_line_with_extra_keys() {
        let raw = r#"{"ts":"2025-03-01T10:00:00Z","stage":"scan.extract","pct":12.5,"worker":3}"#;
        let line: LogLine = serde_json::from_str(raw).unwrap();
        let record = line.into_record(JobId::new());
        assert_eq!(record.stage, "scan.extract");
        assert_eq!(record.percent_whole(), Some(12));
        assert!(record.detail.is_none());
    }

    #[test]
    fn percent_is_clamped() {
        let record = ProgressRecord {
            job_id: JobId::new(),
            timestamp: Utc::now(),
            stage: "scan".into(),
            detail: None,
            percent: Some(180.0),
        };
        assert_eq!(record.percent_whole(), Some(100));
    }
}
