use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgNotification, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    JOB_EVENTS_CHANNEL, JobStore, JobStoreError, JobWrite, JobWriteStream, StoreResult,
};
use crate::types::{Job, JobId, JobPatch, JobSource, JobStatus, NewJob};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scan_jobs (
    id              UUID PRIMARY KEY,
    status          TEXT NOT NULL DEFAULT 'queued',
    bucket          TEXT,
    object_key      TEXT,
    source_path     TEXT,
    mode            TEXT NOT NULL DEFAULT 'light',
    format          TEXT NOT NULL DEFAULT 'json',
    refs            BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ,
    progress_pct    SMALLINT NOT NULL DEFAULT 0,
    progress_msg    TEXT,
    report_location TEXT,
    error_msg       TEXT,
    summary_json    JSONB
);

CREATE INDEX IF NOT EXISTS scan_jobs_status_created_idx ON scan_jobs (status, created_at DESC);
CREATE INDEX IF NOT EXISTS scan_jobs_created_at_idx ON scan_jobs (created_at DESC);

CREATE OR REPLACE FUNCTION notify_job_event() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('job_events', row_to_json(NEW)::text);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS scan_jobs_notify ON scan_jobs;
CREATE TRIGGER scan_jobs_notify
    AFTER INSERT OR UPDATE ON scan_jobs
    FOR EACH ROW EXECUTE FUNCTION notify_job_event();
"#;

/// Postgres-backed store. Writes are announced on the `job_events` channel
/// by a row trigger, deletes by an explicit `pg_notify`.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to job database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the table and notification trigger when missing.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, FromRow, Deserialize)]
struct JobRow {
    id: Uuid,
    status: String,
    bucket: Option<String>,
    object_key: Option<String>,
    source_path: Option<String>,
    mode: String,
    format: String,
    refs: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    progress_pct: i16,
    progress_msg: Option<String>,
    report_location: Option<String>,
    error_msg: Option<String>,
    summary_json: Option<Value>,
}

impl JobRow {
    fn into_job(self) -> StoreResult<Job> {
        let status: JobStatus = self.status.parse().map_err(JobStoreError::Malformed)?;
        let source = match (self.bucket, self.object_key, self.source_path) {
            (Some(bucket), Some(key), _) => JobSource::Object {
                bucket,
                object_key: key,
            },
            (_, _, Some(path)) => JobSource::Path {
                path: PathBuf::from(path),
            },
            _ => {
                return Err(JobStoreError::Malformed(format!(
                    "job {} has neither an object nor a path source",
                    self.id
                )));
            }
        };
        Ok(Job {
            id: JobId(self.id),
            status,
            source,
            mode: self.mode,
            format: self.format,
            refs: self.refs,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            progress_pct: self.progress_pct.clamp(0, 100) as u8,
            progress_msg: self.progress_msg,
            report_location: self.report_location,
            error_msg: self.error_msg,
            summary: self.summary_json,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeletedPayload {
    id: Uuid,
    deleted: bool,
}

fn parse_notification(payload: &str) -> Option<JobWrite> {
    if let Ok(deleted) = serde_json::from_str::<DeletedPayload>(payload)
        && deleted.deleted
    {
        return Some(JobWrite::Deleted(JobId(deleted.id)));
    }

    match serde_json::from_str::<JobRow>(payload).map(JobRow::into_job) {
        Ok(Ok(job)) => Some(JobWrite::Upserted(job)),
        Ok(Err(err)) => {
            warn!(error = %err, "discarding job notification with invalid row");
            None
        }
        Err(err) => {
            warn!(error = %err, "discarding unparseable job notification");
            None
        }
    }
}

fn source_columns(source: &JobSource) -> (Option<&str>, Option<&str>, Option<String>) {
    match source {
        JobSource::Object { bucket, object_key } => {
            (Some(bucket.as_str()), Some(object_key.as_str()), None)
        }
        JobSource::Path { path } => (None, None, Some(path.display().to_string())),
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, new: NewJob) -> StoreResult<Job> {
        let job = Job::from_new(new, Utc::now());
        let (bucket, object_key, source_path) = source_columns(&job.source);

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO scan_jobs
                (id, status, bucket, object_key, source_path, mode, format, refs, created_at, progress_pct)
            VALUES ($1, 'queued', $2, $3, $4, $5, $6, $7, $8, 0)
            RETURNING *
            "#,
        )
        .bind(job.id.0)
        .bind(bucket)
        .bind(object_key)
        .bind(source_path)
        .bind(&job.mode)
        .bind(&job.format)
        .bind(job.refs)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_job()
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobStoreError::NotFound(id))?
            .into_job()
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM scan_jobs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> StoreResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE scan_jobs SET
                status          = COALESCE($2, status),
                started_at      = COALESCE($3, started_at),
                finished_at     = COALESCE($4, finished_at),
                progress_pct    = GREATEST(progress_pct, COALESCE($5, progress_pct)),
                progress_msg    = COALESCE($6, progress_msg),
                report_location = COALESCE($7, report_location),
                error_msg       = COALESCE($8, error_msg),
                summary_json    = COALESCE($9, summary_json)
            WHERE id = $1
              AND ($10::text IS NULL OR status = $10)
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(patch.status.map(|status| status.as_str()))
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(patch.progress_pct.map(|pct| i16::from(pct.min(100))))
        .bind(patch.progress_msg.as_deref())
        .bind(patch.report_location.as_deref())
        .bind(patch.error_msg.as_deref())
        .bind(patch.summary.as_ref())
        .bind(patch.only_if.map(|status| status.as_str()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.into_job();
        }

        // Nothing matched: tell a missing row apart from a lost status race.
        let current = self.get(id).await?;
        match patch.only_if {
            Some(expected) => Err(JobStoreError::StatusConflict {
                id,
                expected,
                actual: current.status,
            }),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    async fn delete(&self, id: JobId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM scan_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            let payload = serde_json::json!({ "id": id.0, "deleted": true }).to_string();
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(JOB_EVENTS_CHANNEL)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn subscribe_writes(&self) -> StoreResult<JobWriteStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOB_EVENTS_CHANNEL).await?;
        debug!(channel = JOB_EVENTS_CHANNEL, "listening for job writes");

        let stream = listener
            .into_stream()
            .take_while(|item| {
                let keep = match item {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(error = %err, "job notification listener failed");
                        false
                    }
                };
                futures::future::ready(keep)
            })
            .filter_map(|item: Result<PgNotification, sqlx::Error>| {
                futures::future::ready(item.ok().and_then(|n| parse_notification(n.payload())))
            });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_payload(status: &str) -> String {
        json!({
            "id": "6f9619ff-8b86-d011-b42d-00c04fc964ff",
            "status": status,
            "bucket": "uploads",
            "object_key": "fw/router.bin",
            "source_path": null,
            "mode": "light",
            "format": "json",
            "refs": false,
            "created_at": "2025-03-01T10:00:00+00:00",
            "started_at": null,
            "finished_at": null,
            "progress_pct": 35,
            "progress_msg": "scan.deps",
            "report_location": null,
            "error_msg": null,
            "summary_json": null
        })
        .to_string()
    }

    #[test]
    fn trigger_payload_becomes_upsert() {
        let write = parse_notification(&row_payload("running")).unwrap();
        let JobWrite::Upserted(job) = write else {
            panic!("expected upsert, got {write:?}");
        };
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress_pct, 35);
        assert_eq!(job.source, JobSource::object("uploads", "fw/router.bin"));
    }

    #[test]
    fn delete_payload_becomes_delete() {
        let payload = json!({"id": "6f9619ff-8b86-d011-b42d-00c04fc964ff", "deleted": true});
        let write = parse_notification(&payload.to_string()).unwrap();
        assert!(matches!(write, JobWrite::Deleted(_)));
    }

    #[test]
    fn garbage_payload_is_ignored() {
        assert!(parse_notification("not json").is_none());
        assert!(parse_notification(&row_payload("exploded")).is_none());
    }
}
