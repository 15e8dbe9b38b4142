use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::{Job, JobKind, JobStatus};
use crate::store::{JobFilter, JobStore};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct DashboardState {
    pub store: JobStore,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryResponse {
    /// Counts per kind, then per status; every status is present.
    pub jobs: BTreeMap<JobKind, BTreeMap<JobStatus, i64>>,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    kind: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(code: StatusCode, error: impl ToString) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/summary", get(summary_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn summary_handler(State(state): State<DashboardState>) -> Response {
    let mut jobs = BTreeMap::new();
    for kind in JobKind::ALL {
        let mut counts: BTreeMap<JobStatus, i64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        match state.store.count_by_status(kind).await {
            Ok(rows) => counts.extend(rows),
            Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        }
        jobs.insert(kind, counts);
    }
    Json(SummaryResponse { jobs }).into_response()
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let kind = match query.kind.as_deref().map(str::parse::<JobKind>).transpose() {
        Ok(kind) => kind,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unknown job kind"),
    };
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unknown job status"),
    };
    let filter = JobFilter {
        kind,
        status,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
    };

    match state.store.list_jobs(&filter).await {
        Ok(jobs) => Json::<Vec<Job>>(jobs).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}
