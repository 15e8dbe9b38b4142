//! Status monitor: the server side of the job status channel.
//!
//! Running jobs POST a [`StatusReport`] to `/status` and block until the
//! [`Ack`] arrives, so every job process has at most one report in flight.
//! Reports are applied with the store's conditional update; a report that
//! does not fit the job's current status (including any report for a job
//! that was reset to `created`) is acknowledged but changes nothing.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::retry::RetryPolicy;
use crate::scheduler::job::{JobId, JobKind, JobStatus};
use crate::store::{JobStore, StatusUpdate, StoreError};

pub const STATUS_PATH: &str = "/status";

/// One status report from a job process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_kind: JobKind,
    pub job_id: JobId,
    pub status: JobStatus,
    /// Wall-clock runtime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
}

impl StatusReport {
    pub fn new(job_kind: JobKind, job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_kind,
            job_id,
            status,
            duration: None,
            result_location: None,
        }
    }

    /// Jobs may only report `running` or a terminal status.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.status == JobStatus::Running || self.status.is_terminal()) {
            return Err(ProtocolError::UnexpectedStatus(self.status));
        }
        if matches!(self.duration, Some(d) if d < 0) {
            return Err(ProtocolError::Malformed("negative duration".to_string()));
        }
        Ok(())
    }

    pub fn to_update(&self) -> StatusUpdate {
        StatusUpdate {
            status: self.status,
            duration: self.duration,
            result_location: self.result_location.clone(),
        }
    }
}

/// Reply sent for every report, applied or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: bool,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed status report: {0}")]
    Malformed(String),

    #[error("jobs may not report status {0}")]
    UnexpectedStatus(JobStatus),
}

pub fn parse_report(body: &[u8]) -> Result<StatusReport, ProtocolError> {
    let report: StatusReport =
        serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    report.validate()?;
    Ok(report)
}

/// Apply a report to the store, retrying transient failures.
/// Returns whether the job record changed.
pub async fn apply_report(
    store: &JobStore,
    report: &StatusReport,
    retry: RetryPolicy,
) -> Result<bool, StoreError> {
    let update = report.to_update();
    let applied = retry
        .run("apply status report", || {
            store.apply_update(report.job_kind, report.job_id, &update)
        })
        .await?;

    if applied {
        tracing::info!(
            job_id = report.job_id,
            kind = %report.job_kind,
            status = %report.status,
            duration = ?report.duration,
            "Job status updated"
        );
    } else {
        tracing::debug!(
            job_id = report.job_id,
            kind = %report.job_kind,
            status = %report.status,
            "Status report does not fit current job status, ignored"
        );
    }
    Ok(applied)
}

#[derive(Debug, Clone)]
pub struct MonitorState {
    pub store: JobStore,
    pub retry: RetryPolicy,
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route(STATUS_PATH, post(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status_handler(
    State(state): State<MonitorState>,
    body: Bytes,
) -> (StatusCode, Json<Ack>) {
    let report = match parse_report(&body) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding status report");
            return (
                StatusCode::BAD_REQUEST,
                Json(Ack {
                    ack: true,
                    applied: false,
                    error: Some(e.to_string()),
                }),
            );
        }
    };
    tracing::debug!(?report, "Received status update");

    match apply_report(&state.store, &report, state.retry).await {
        Ok(applied) => (
            StatusCode::OK,
            Json(Ack {
                ack: true,
                applied,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!(
                job_id = report.job_id,
                kind = %report.job_kind,
                status = %report.status,
                error = %e,
                "Giving up on status update"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Ack {
                    ack: true,
                    applied: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Long-lived listener for status reports.
pub struct StatusMonitor {
    addr: SocketAddr,
    state: MonitorState,
}

impl StatusMonitor {
    pub fn new(addr: SocketAddr, store: JobStore, retry: RetryPolicy) -> Self {
        Self {
            addr,
            state: MonitorState { store, retry },
        }
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Status monitor listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::info!("Status monitor terminated");
        Ok(())
    }
}
