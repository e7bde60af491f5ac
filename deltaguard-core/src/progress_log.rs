//! Append-only NDJSON progress files, one per job.
//!
//! The scanner writes `<dir>/<job-id>.ndjson`; the runner appends its own
//! terminal `scan.summary` line. Readers track a byte offset so each tick only
//! reads what was appended since the previous one.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::Result;
use crate::types::progress::LogLine;
use crate::types::{JobId, ProgressRecord};

/// Default directory for progress files.
pub const DEFAULT_PROGRESS_DIR: &str = "/tmp/deltaguard";

const LOG_EXTENSION: &str = "ndjson";

/// Byte offset of the first unread line in a progress file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogCursor(pub u64);

#[derive(Debug, Clone, Default)]
pub struct ProgressBatch {
    pub records: Vec<ProgressRecord>,
    /// Position after the last consumed line.
    pub cursor: LogCursor,
}

#[derive(Debug, Clone)]
pub struct ProgressLog {
    dir: PathBuf,
}

impl ProgressLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.{LOG_EXTENSION}"))
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Reads up to `limit` complete lines starting at `cursor`.
    ///
    /// A trailing line without a newline is left for the next read. Lines that
    /// fail to parse are skipped. A missing file reads as empty, and a file
    /// shorter than `cursor` is read again from the start.
    pub async fn read_after(
        &self,
        job_id: JobId,
        cursor: LogCursor,
        limit: usize,
    ) -> Result<ProgressBatch> {
        self.read_span(job_id, cursor, None, limit).await
    }

    async fn read_span(
        &self,
        job_id: JobId,
        cursor: LogCursor,
        end: Option<LogCursor>,
        limit: usize,
    ) -> Result<ProgressBatch> {
        let path = self.path_for(job_id);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProgressBatch {
                    records: Vec::new(),
                    cursor,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        let start = if len < cursor.0 {
            warn!(job = %job_id, len, cursor = cursor.0, "progress file shrank; rereading");
            0
        } else {
            cursor.0
        };
        let len = end.map_or(len, |end| len.min(end.0.max(start)));
        if len == start {
            return Ok(ProgressBatch {
                records: Vec::new(),
                cursor: LogCursor(start),
            });
        }

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.take(len - start).read_to_end(&mut buf).await?;

        let mut records = Vec::new();
        let mut consumed = 0usize;
        for raw in buf.split_inclusive(|byte| *byte == b'\n') {
            if records.len() >= limit || raw.last() != Some(&b'\n') {
                break;
            }
            consumed += raw.len();
            if let Some(record) = parse_line(job_id, raw) {
                records.push(record);
            }
        }

        trace!(job = %job_id, read = records.len(), consumed, "read progress lines");
        Ok(ProgressBatch {
            records,
            cursor: LogCursor(start + consumed as u64),
        })
    }

    /// Last `count` complete records, plus the cursor at the end of them.
    pub async fn tail(&self, job_id: JobId, count: usize) -> Result<ProgressBatch> {
        self.tail_until(job_id, count, None).await
    }

    /// Like [`tail`](Self::tail) but ignores anything at or past `end`.
    pub async fn tail_until(
        &self,
        job_id: JobId,
        count: usize,
        end: Option<LogCursor>,
    ) -> Result<ProgressBatch> {
        let batch = self
            .read_span(job_id, LogCursor(0), end, usize::MAX)
            .await?;
        let mut records = batch.records;
        if records.len() > count {
            records.drain(..records.len() - count);
        }
        Ok(ProgressBatch {
            records,
            cursor: batch.cursor,
        })
    }

    /// Appends one record, creating the directory and file as needed.
    pub async fn append(
        &self,
        job_id: JobId,
        stage: &str,
        detail: Option<Value>,
        percent: Option<f32>,
    ) -> Result<ProgressRecord> {
        let line = LogLine {
            ts: Utc::now(),
            stage: stage.to_string(),
            detail,
            pct: percent,
        };
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        self.ensure_dir().await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(job_id))
            .await?;
        file.write_all(&encoded).await?;
        file.flush().await?;

        Ok(line.into_record(job_id))
    }

    /// Deletes the job's file. Returns `false` when there was none.
    pub async fn remove(&self, job_id: JobId) -> Result<bool> {
        match fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_line(job_id: JobId, raw: &[u8]) -> Option<ProgressRecord> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<LogLine>(text) {
        Ok(line) => Some(line.into_record(job_id)),
        Err(err) => {
            warn!(job = %job_id, error = %err, "skipping malformed progress line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_raw(log: &ProgressLog, job_id: JobId, contents: &str) {
        log.ensure_dir().await.unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log.path_for(job_id))
            .await
            .unwrap();
        file.write_all(contents.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new(dir.path());
        let batch = log
            .read_after(JobId::new(), LogCursor(0), 10)
            .await
            .unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.cursor, LogCursor(0));
    }

    #[tokio::test]
    async fn partial_trailing_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new(dir.path());
        let job = JobId::new();

        write_raw(
            &log,
            job,
            "{\"ts\":\"2025-03-01T10:00:00Z\",\"stage\":\"scan.start\"}\n{\"ts\":\"2025-03-01T10:00:01Z\",\"sta",
        )
        .await;
        let first = log.read_after(job, LogCursor(0), 10).await.unwrap();
        assert_eq!(first.records.len(), 1);

        write_raw(&log, job, "ge\":\"scan.extract\",\"pct\":10}\n").await;
        let second = log.read_after(job, first.cursor, 10).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].stage, "scan.extract");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new(dir.path());
        let job = JobId::new();
        write_raw(
            &log,
            job,
            "garbage\n\n{\"ts\":\"2025-03-01T10:00:00Z\",\"stage\":\"scan.deps\"}\n",
        )
        .await;

        let batch = log.read_after(job, LogCursor(0), 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].stage, "scan.deps");
    }

    #[tokio::test]
    async fn tail_keeps_last_records_and_limit_caps_reads() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new(dir.path());
        let job = JobId::new();
        for step in 0..6 {
            log.append(job, &format!("scan.step{step}"), None, Some(step as f32 * 10.0))
                .await
                .unwrap();
        }

        let tail = log.tail(job, 2).await.unwrap();
        let stages: Vec<&str> = tail.records.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["scan.step4", "scan.step5"]);

        let capped = log.read_after(job, LogCursor(0), 4).await.unwrap();
        assert_eq!(capped.records.len(), 4);
        let rest = log.read_after(job, capped.cursor, 10).await.unwrap();
        assert_eq!(rest.records.len(), 2);
        assert_eq!(rest.cursor, tail.cursor);
    }

    #[tokio::test]
    async fn append_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProgressLog::new(dir.path().join("nested"));
        let job = JobId::new();

        let record = log
            .append(job, "scan.summary", Some(json!({"error": "x"})), None)
            .await
            .unwrap();
        assert_eq!(record.job_id, job);

        assert!(log.remove(job).await.unwrap());
        assert!(!log.remove(job).await.unwrap());
    }
}
