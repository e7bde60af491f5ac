use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    cancel_scan_handler, create_job_handler, delete_job_handler, get_job_handler,
    job_events_handler, job_progress_events_handler, list_progress_handler,
};
use crate::infra::app_state::AppState;

/// Job CRUD, scan control and the two event streams.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs/events", get(job_events_handler))
        .route(
            "/jobs/{id}",
            get(get_job_handler).delete(delete_job_handler),
        )
        .route("/jobs/{id}/events", get(job_progress_events_handler))
        .route("/jobs/{id}/events/list", get(list_progress_handler))
        .route("/scans/{id}/cancel", post(cancel_scan_handler))
}

pub fn create_app(state: AppState) -> Router {
    create_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
