//! Status monitor endpoint tests driven through `tower::ServiceExt::oneshot`.


use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use test_harness::{add_stage_a, force_status, status_of, test_store};
use twostage::monitor::{router, MonitorState};
use twostage::retry::RetryPolicy;
use twostage::scheduler::{JobKind, JobStatus};
use twostage::store::JobStore;

fn app(store: &JobStore) -> Router {
    router(MonitorState {
        store: store.clone(),
        retry: RetryPolicy::default(),
    })
}

async fn post_report(app: Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/status")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_report_lifecycle() {
    let store = test_store().await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Queued).await;

    let (code, ack) = post_report(
        app(&store),
        json!({"job_kind": "stage_a", "job_id": id, "status": "running"}),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(ack, json!({"ack": true, "applied": true}));

    let (_, ack) = post_report(
        app(&store),
        json!({
            "job_kind": "stage_a",
            "job_id": id,
            "status": "success",
            "duration": 42,
            "result_location": "/data/a.out"
        }),
    )
    .await;
    assert_eq!(ack["applied"], true);

    let job = store.get_job(JobKind::StageA, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.duration, Some(42));
    assert_eq!(job.result_location.as_deref(), Some("/data/a.out"));
}

#[tokio::test]
async fn test_late_report_after_reset_is_acknowledged_but_ignored() {
    let store = test_store().await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Running).await;

    // Shutdown sweep handed the job back before the killed process reported.
    assert!(store.reset_to_created(JobKind::StageA, id).await.unwrap());

    let (code, ack) = post_report(
        app(&store),
        json!({"job_kind": "stage_a", "job_id": id, "status": "failed", "duration": 3}),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(ack, json!({"ack": true, "applied": false}));

    let job = store.get_job(JobKind::StageA, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Created);
    assert_eq!(job.duration, None);
}

#[tokio::test]
async fn test_first_terminal_report_wins() {
    let store = test_store().await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Success).await;

    let (_, ack) = post_report(
        app(&store),
        json!({"job_kind": "stage_a", "job_id": id, "status": "walltime_exceeded"}),
    )
    .await;
    assert_eq!(ack["applied"], false);
    assert_eq!(status_of(&store, JobKind::StageA, id).await, JobStatus::Success);
}

#[tokio::test]
async fn test_unknown_job_is_acknowledged() {
    let store = test_store().await;
    let (code, ack) = post_report(
        app(&store),
        json!({"job_kind": "stage_b", "job_id": 999, "status": "running"}),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(ack["applied"], false);
}

#[tokio::test]
async fn test_malformed_reports_are_rejected() {
    let store = test_store().await;
    let id = add_stage_a(&store, 1).await;

    for body in [
        json!({"job_kind": "stage_a", "job_id": id, "status": "queued"}),
        json!({"job_kind": "stage_x", "job_id": id, "status": "running"}),
        json!({"job_id": id, "status": "running"}),
    ] {
        let (code, ack) = post_report(app(&store), body).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(ack["ack"], true);
        assert_eq!(ack["applied"], false);
        assert!(ack["error"].is_string());
    }
    assert_eq!(status_of(&store, JobKind::StageA, id).await, JobStatus::Created);
}
