use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::command::{ScanInvocation, build_invocation};
use super::{CANCELLED_MESSAGE, JobOutcome, RunnerError, RunnerInner};
use crate::progress_log::LogCursor;
use crate::store::JobStoreError;
use crate::types::{Job, JobId, JobPatch, ScanReport, SeveritySummary};

const STDERR_PREVIEW_CHARS: usize = 300;

struct ScanOutput {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

impl ScanOutput {
    fn from_exit(status: ExitStatus, stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr,
            code: status.code(),
        }
    }

    fn failure_message(&self) -> String {
        let trimmed = self.stderr.trim();
        if !trimmed.is_empty() {
            return trimmed.chars().take(STDERR_PREVIEW_CHARS).collect();
        }
        match self.code {
            Some(code) => format!("scanner exited with status {code}"),
            None => "scanner terminated by signal".to_string(),
        }
    }
}

pub(super) async fn supervise(
    inner: Arc<RunnerInner>,
    job: Job,
    cancel: CancellationToken,
) -> Result<JobOutcome, RunnerError> {
    let job_id = job.id;

    if cancel.is_cancelled() {
        // Cancelled while the job was being claimed; the cancel's own write
        // may have raced the move to running.
        mark_cancelled(&inner, job_id).await;
        return Ok(JobOutcome::Cancelled);
    }

    let input = job.source.local_input(&inner.config.uploads_dir);
    let progress_file = inner.config.use_progress.then(|| inner.log.path_for(job_id));
    if progress_file.is_some()
        && let Err(err) = inner.log.ensure_dir().await
    {
        warn!(error = %err, "could not create progress directory");
    }

    let invocation = build_invocation(
        &inner.config,
        &input,
        &job.format,
        progress_file.as_deref(),
    );
    debug!(command = %invocation.display_command(), "launching scanner");

    let output = match invocation {
        ScanInvocation::Canned { stdout } => ScanOutput {
            stdout,
            stderr: String::new(),
            code: Some(0),
        },
        ScanInvocation::Process { program, args } => {
            let child = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            let child = match child {
                Ok(child) => child,
                Err(source) => {
                    let err = RunnerError::Spawn {
                        program: program.display().to_string(),
                        source,
                    };
                    return spawn_failed(&inner, job_id, &program, err).await;
                }
            };

            match run_to_exit(&inner, &job, child, &cancel).await {
                Some(output) => output,
                None => return Ok(JobOutcome::Cancelled),
            }
        }
    };

    if !inner.release(job_id) {
        debug!("scan exited after cancellation; leaving terminal state to cancel");
        return Ok(JobOutcome::Cancelled);
    }
    finalize(&inner, job_id, output).await
}

/// Waits for the process while mirroring progress. Returns `None` when the
/// scan was cancelled.
async fn run_to_exit(
    inner: &Arc<RunnerInner>,
    job: &Job,
    mut child: Child,
    cancel: &CancellationToken,
) -> Option<ScanOutput> {
    let stdout = child.stdout.take().map(capture);
    let stderr = child.stderr.take().map(capture);

    let mirror_stop = cancel.child_token();
    let mirror = tokio::spawn(mirror_progress(
        Arc::clone(inner),
        job.id,
        job.progress_pct,
        mirror_stop.clone(),
    ));

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    mirror_stop.cancel();
    if let Err(err) = mirror.await {
        warn!(error = %err, "progress mirror task failed");
    }

    let Some(status) = status else {
        terminate(&mut child, inner.config.grace_period).await;
        for reader in [stdout, stderr].into_iter().flatten() {
            reader.abort();
        }
        return None;
    };

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;
    match status {
        Ok(status) => {
            info!(code = ?status.code(), "scanner exited");
            Some(ScanOutput::from_exit(status, stdout, stderr))
        }
        Err(err) => Some(ScanOutput {
            stdout,
            stderr: format!("failed waiting for scanner: {err}"),
            code: None,
        }),
    }
}

fn capture<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buf).await {
            warn!(error = %err, "failed to read scanner output");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// SIGTERM, then SIGKILL once the grace period has passed.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id()
            && let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            debug!(pid, error = %err, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "terminate failed");
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(code = ?status.code(), "scanner stopped after SIGTERM"),
        Ok(Err(err)) => warn!(error = %err, "failed waiting for scanner"),
        Err(_) => {
            warn!(grace = ?grace, "scanner ignored SIGTERM; killing");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill scanner");
            }
        }
    }
}

/// Copies the newest percent and stage onto the job row while it runs.
async fn mirror_progress(
    inner: Arc<RunnerInner>,
    job_id: JobId,
    initial_pct: u8,
    stop: CancellationToken,
) {
    let period = inner.config.mirror_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cursor = LogCursor::default();
    let mut last_pct = initial_pct;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let batch = match inner.log.read_after(job_id, cursor, usize::MAX).await {
            Ok(batch) => batch,
            Err(err) => {
                trace!(error = %err, "progress mirror read failed");
                continue;
            }
        };
        cursor = batch.cursor;

        let latest = batch
            .records
            .iter()
            .rev()
            .find_map(|record| record.percent_whole().map(|pct| (pct, record.stage.clone())));
        let Some((pct, stage)) = latest else {
            continue;
        };
        if pct <= last_pct {
            continue;
        }

        match inner
            .store
            .update(job_id, JobPatch::progress(pct, Some(stage)))
            .await
        {
            Ok(_) => last_pct = pct,
            Err(JobStoreError::StatusConflict { .. } | JobStoreError::NotFound(_)) => break,
            Err(err) => warn!(error = %err, "failed to mirror progress"),
        }
    }
}

async fn spawn_failed(
    inner: &RunnerInner,
    job_id: JobId,
    program: &Path,
    err: RunnerError,
) -> Result<JobOutcome, RunnerError> {
    if !inner.release(job_id) {
        return Ok(JobOutcome::Cancelled);
    }
    let message = match &err {
        RunnerError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            format!("scanner not found on PATH (tried '{}')", program.display())
        }
        other => other.to_string(),
    };
    error!(error = %err, "scanner failed to launch");
    record_failure(inner, job_id, message).await
}

async fn finalize(
    inner: &RunnerInner,
    job_id: JobId,
    output: ScanOutput,
) -> Result<JobOutcome, RunnerError> {
    if output.code != Some(0) {
        let message = output.failure_message();
        warn!(code = ?output.code, error = %message, "scan failed");
        return record_failure(inner, job_id, message).await;
    }

    let summary = match ScanReport::parse(&output.stdout) {
        Some(report) => report.summary_value(),
        None => serde_json::to_value(SeveritySummary::default()).unwrap_or(Value::Null),
    };
    let report_location = write_report(inner, job_id, &output.stdout).await;

    match inner
        .store
        .update(
            job_id,
            JobPatch::done(Utc::now(), report_location.clone(), summary.clone()),
        )
        .await
    {
        Ok(_) => {
            inner
                .append_summary(job_id, summary.clone(), Some(100.0))
                .await;
            info!(summary = %summary, "scan completed");
            Ok(JobOutcome::Done {
                summary,
                report_location,
            })
        }
        Err(err) => {
            error!(error = %err, "failed to record scan completion");
            record_best_effort_failure(inner, job_id, err.to_string()).await;
            Err(err.into())
        }
    }
}

async fn record_failure(
    inner: &RunnerInner,
    job_id: JobId,
    message: String,
) -> Result<JobOutcome, RunnerError> {
    match inner
        .store
        .update(job_id, JobPatch::failed(Utc::now(), message.clone()))
        .await
    {
        Ok(_) => {
            inner
                .append_summary(job_id, json!({ "error": message }), None)
                .await;
            Ok(JobOutcome::Failed { error: message })
        }
        Err(err) => {
            error!(error = %err, "failed to record scan failure");
            Err(err.into())
        }
    }
}

async fn record_best_effort_failure(inner: &RunnerInner, job_id: JobId, message: String) {
    if let Err(err) = inner
        .store
        .update(job_id, JobPatch::failed(Utc::now(), message.clone()))
        .await
    {
        warn!(error = %err, "could not mark job failed");
        return;
    }
    inner
        .append_summary(job_id, json!({ "error": message }), None)
        .await;
}

async fn mark_cancelled(inner: &RunnerInner, job_id: JobId) {
    if let Err(err) = inner
        .store
        .update(job_id, JobPatch::failed(Utc::now(), CANCELLED_MESSAGE))
        .await
    {
        trace!(error = %err, "cancellation already recorded");
    }
}

async fn write_report(inner: &RunnerInner, job_id: JobId, stdout: &str) -> Option<String> {
    let dir = inner.config.report_dir.as_ref()?;
    let path = dir.join(format!("{job_id}.json"));
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, stdout).await
    }
    .await;
    match result {
        Ok(()) => Some(path.display().to_string()),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to write scan report");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_prefers_stderr_preview() {
        let output = ScanOutput {
            stdout: String::new(),
            stderr: format!("  {}  ", "x".repeat(400)),
            code: Some(2),
        };
        assert_eq!(output.failure_message().len(), STDERR_PREVIEW_CHARS);

        let silent = ScanOutput {
            stdout: String::new(),
            stderr: "\n".into(),
            code: Some(3),
        };
        assert_eq!(silent.failure_message(), "scanner exited with status 3");
    }
}
