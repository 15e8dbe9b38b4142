//! End-to-end tests over real TCP listeners and real processes.
//!
//! These tests validate that:
//! - a job process reporting through [`StatusReporter`] drives its store
//!   record to the right terminal status,
//! - the walltime guard stops a command and reports `walltime_exceeded`,
//! - a running node hands every in-flight job back to `created` when it is
//!   shut down.


use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use test_harness::{add_stage_a, force_status, jobs_config, status_of, test_store};
use twostage::backend::{ExecutionBackend, LocalExecutor};
use twostage::config::SchedulerConfig;
use twostage::monitor::StatusMonitor;
use twostage::node::Node;
use twostage::reporter::{run_reported, ReportContext, StatusReporter};
use twostage::retry::RetryPolicy;
use twostage::scheduler::{JobId, JobKind, JobStatus, ScriptRequestBuilder};
use twostage::store::JobStore;

/// Start a status monitor on an ephemeral port.
async fn start_monitor(store: &JobStore) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let monitor = StatusMonitor::new(
        listener.local_addr().unwrap(),
        store.clone(),
        RetryPolicy::default(),
    );
    let serve_cancel = cancel.clone();
    tokio::spawn(async move { monitor.serve(listener, serve_cancel).await });
    (port, cancel)
}

fn reporter(port: u16, id: JobId, walltime: Duration) -> StatusReporter {
    StatusReporter::new(ReportContext {
        host: "127.0.0.1".to_string(),
        port,
        kind: JobKind::StageA,
        id,
        job_name: None,
        walltime,
        output_dir: None,
    })
}

fn sh(script: &str) -> Vec<std::ffi::OsString> {
    vec!["-c".into(), script.into()]
}

#[tokio::test]
async fn test_reported_run_success() {
    let store = test_store().await;
    let (port, cancel) = start_monitor(&store).await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Queued).await;

    let status = run_reported(
        &reporter(port, id, Duration::from_secs(3600)),
        "/bin/sh".into(),
        sh("exit 0"),
        Some("/data/run_1.out".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(status, JobStatus::Success);
    let job = store.get_job(JobKind::StageA, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.duration.is_some());
    assert_eq!(job.result_location.as_deref(), Some("/data/run_1.out"));
    cancel.cancel();
}

#[tokio::test]
async fn test_reported_run_failure() {
    let store = test_store().await;
    let (port, cancel) = start_monitor(&store).await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Queued).await;

    let status = run_reported(
        &reporter(port, id, Duration::from_secs(3600)),
        "/bin/sh".into(),
        sh("exit 3"),
        Some("/data/ignored.out".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(status, JobStatus::Failed);
    let job = store.get_job(JobKind::StageA, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result_location.is_none());
    cancel.cancel();
}

#[tokio::test]
async fn test_reported_run_walltime_exceeded() {
    let store = test_store().await;
    let (port, cancel) = start_monitor(&store).await;
    let id = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, id, JobStatus::Queued).await;

    let status = run_reported(
        &reporter(port, id, Duration::from_secs(1)),
        "sleep".into(),
        vec!["10".into()],
        None,
    )
    .await
    .unwrap();

    assert_eq!(status, JobStatus::WalltimeExceeded);
    assert_eq!(
        status_of(&store, JobKind::StageA, id).await,
        JobStatus::WalltimeExceeded
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_report_for_reset_job_is_not_applied() {
    let store = test_store().await;
    let (port, cancel) = start_monitor(&store).await;
    let id = add_stage_a(&store, 1).await;

    let ack = reporter(port, id, Duration::from_secs(60))
        .report(JobStatus::Running, None, None)
        .await
        .unwrap();
    assert!(ack.ack);
    assert!(!ack.applied);
    assert_eq!(status_of(&store, JobKind::StageA, id).await, JobStatus::Created);
    cancel.cancel();
}

#[tokio::test]
async fn test_node_shutdown_resets_in_flight_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("stage_a.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\ntouch \"$TWOSTAGE_OUTPUT_DIR/started\"\nexec sleep 30\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let store = test_store().await;
    let first = add_stage_a(&store, 1).await;
    let second = add_stage_a(&store, 2).await;

    let mut config = SchedulerConfig::default();
    config.submitter = test_harness::submitter_config(10);
    config.jobs = jobs_config(&dir.path().join("data"));
    config.jobs.stage_a_executable = script;

    let executor = LocalExecutor::with_poll_interval(1, Duration::from_millis(10))
        .with_store(store.clone(), test_harness::PREFIX);
    let executor_task = executor.start();
    let backend: Arc<dyn ExecutionBackend> = Arc::new(executor.clone());
    let builder = Arc::new(ScriptRequestBuilder::new(config.jobs.clone()));
    let node = Node::with_parts(config, store.clone(), backend, builder.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let node_task = tokio::spawn(node.serve(listener, shutdown.clone()));

    // One worker: the first job runs, the second waits in the pool queue.
    let first_job = store.get_job(JobKind::StageA, first).await.unwrap().unwrap();
    let started = builder.output_dir(&first_job).join("started");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !started.exists() {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status_of(&store, JobKind::StageA, first).await, JobStatus::Queued);
    assert_eq!(status_of(&store, JobKind::StageA, second).await, JobStatus::Queued);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), node_task)
        .await
        .expect("node did not stop")
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), executor_task)
        .await
        .expect("executor did not stop")
        .unwrap();

    assert_eq!(executor.n_running().await.unwrap(), 0);
    assert_eq!(executor.n_queued().await.unwrap(), 0);
    assert_eq!(status_of(&store, JobKind::StageA, first).await, JobStatus::Created);
    assert_eq!(status_of(&store, JobKind::StageA, second).await, JobStatus::Created);
    let job = store.get_job(JobKind::StageA, first).await.unwrap().unwrap();
    assert!(job.location.is_none());
}
