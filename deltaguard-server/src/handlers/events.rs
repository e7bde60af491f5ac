use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    response::{
        Sse,
        sse::{Event, KeepAlive},
    },
};
use deltaguard_core::change_bus::ChangeEvent;
use deltaguard_core::sse::{KEEP_ALIVE_TEXT, change_payload, progress_payload};
use deltaguard_core::types::{JobId, ProgressRecord};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::infra::app_state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /jobs/events`: a snapshot of recent jobs, then every job change.
pub async fn job_events_handler(
    State(state): State<AppState>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let hub = state.hub();
    // Subscribe before the snapshot so nothing written in between is lost.
    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
    let subscription = hub
        .subscribe_jobs(Arc::new(move |event: &ChangeEvent| {
            let _ = tx.send(event.clone());
        }))
        .await;
    let items = hub.snapshot(hub.snapshot_limit()).await?;
    let snapshot = ChangeEvent::Snapshot { items };

    let stream = async_stream::stream! {
        let _subscription = subscription;
        yield Ok::<Event, Infallible>(ping_event());
        if let Some(event) = change_event(&snapshot) {
            yield Ok(event);
        }
        while let Some(change) = rx.recv().await {
            if let Some(event) = change_event(&change) {
                yield Ok(event);
            }
        }
        debug!("job event stream closed");
    };
    let stream = stream.take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

/// `GET /jobs/{id}/events`: the job's progress records, backlog first.
pub async fn job_progress_events_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let hub = state.hub();
    hub.get(job_id).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressRecord>();
    let subscription = hub
        .subscribe_progress(
            job_id,
            Arc::new(move |record: &ProgressRecord| {
                let _ = tx.send(record.clone());
            }),
        )
        .await?;

    let stream = async_stream::stream! {
        let _subscription = subscription;
        yield Ok::<Event, Infallible>(ping_event());
        while let Some(record) = rx.recv().await {
            match progress_payload(&record) {
                Ok(payload) => {
                    yield Ok(Event::default().data(payload));
                }
                Err(err) => {
                    warn!(job = %job_id, error = %err, "failed to encode progress record");
                }
            }
        }
        debug!(job = %job_id, "progress stream closed");
    };
    let stream = stream.take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

fn change_event(change: &ChangeEvent) -> Option<Event> {
    change_payload(change)
        .map(|payload| Event::default().data(payload))
        .map_err(|err| {
            warn!(error = %err, "failed to encode job change");
            err
        })
        .ok()
}

fn ping_event() -> Event {
    Event::default().comment("ping")
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(KEEP_ALIVE_INTERVAL)
        .text(KEEP_ALIVE_TEXT)
}
