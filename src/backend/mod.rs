//! Execution backends.
//!
//! A backend accepts jobs for asynchronous execution and reports point-in-time
//! queue counts for backpressure. Two implementations exist:
//!
//! - [`LocalExecutor`]: bounded pool of child processes on this host
//! - [`RemoteBatchBackend`]: submission to a Slurm cluster via `sbatch`
//!
//! Jobs are only known to a backend by their correlation name
//! (`<prefix>_<kind>_<id>`, see [`JobName`]). On shutdown,
//! [`ExecutionBackend::terminate`] kills running jobs, cancels queued
//! ones, and resets every one of them to `created` so nothing is lost.

pub mod batch;
pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::scheduler::job::JobName;
use crate::store::JobStore;

pub use batch::RemoteBatchBackend;
pub use local::LocalExecutor;

/// Everything a backend needs to start one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the scheduler's own environment.
    pub env: BTreeMap<String, String>,
    pub stdout: Option<PathBuf>,
    /// When unset, stderr goes wherever stdout goes.
    pub stderr: Option<PathBuf>,
    pub job_name: String,
    pub walltime: Duration,
}

impl ExecutionRequest {
    pub fn new(executable: impl Into<PathBuf>, job_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdout: None,
            stderr: None,
            job_name: job_name.into(),
            walltime: Duration::from_secs(3600),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn with_walltime(mut self, walltime: Duration) -> Self {
        self.walltime = walltime;
        self
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    /// `submit` after `terminate`. A caller bug, not a runtime condition.
    #[error("backend is shut down")]
    Shutdown,

    #[error("no partition accepts a walltime of {}s", walltime.as_secs())]
    NoPartitionFits { walltime: Duration },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    Scheduler {
        program: String,
        status: String,
        output: String,
    },

    #[error("could not parse scheduler output: {0}")]
    Parse(String),
}

/// Capability contract shared by all execution backends.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Enqueue a job. Never waits for the job to finish.
    async fn submit(&self, request: ExecutionRequest) -> Result<(), BackendError>;

    async fn n_running(&self) -> Result<usize, BackendError>;

    async fn n_queued(&self) -> Result<usize, BackendError>;

    async fn running_job_names(&self) -> Result<Vec<String>, BackendError>;

    async fn queued_job_names(&self) -> Result<Vec<String>, BackendError>;

    /// Terminate an in-flight job. Unknown names are ignored.
    async fn kill(&self, job_name: &str) -> Result<(), BackendError>;

    /// Remove a job that has not started yet. Unknown names are ignored.
    async fn cancel(&self, job_name: &str) -> Result<(), BackendError>;

    /// Stop accepting and starting work. Subsequent `submit` calls fail
    /// with [`BackendError::Shutdown`].
    async fn shutdown(&self);

    /// Shut down and hand every tracked job back to the store.
    async fn terminate(&self, store: &JobStore, prefix: &str) -> SweepReport {
        self.shutdown().await;
        shutdown_sweep(self, store, prefix, RetryPolicy::default()).await
    }
}

/// Outcome of a shutdown sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub killed: Vec<String>,
    pub cancelled: Vec<String>,
    pub reset: usize,
    pub errors: usize,
}

/// Kill running jobs and cancel queued jobs, resetting each to `created`.
///
/// Errors on individual jobs are logged and counted; the sweep always
/// visits every job the backend reports.
pub async fn shutdown_sweep<B>(
    backend: &B,
    store: &JobStore,
    prefix: &str,
    retry: RetryPolicy,
) -> SweepReport
where
    B: ExecutionBackend + ?Sized,
{
    let mut report = SweepReport::default();

    let running = backend.running_job_names().await.unwrap_or_else(|e| {
        tracing::error!(backend = backend.name(), error = %e, "Could not list running jobs");
        report.errors += 1;
        Vec::new()
    });
    for name in running {
        match backend.kill(&name).await {
            Ok(()) => report.killed.push(name.clone()),
            Err(e) => {
                tracing::error!(job_name = %name, error = %e, "Failed to kill job");
                report.errors += 1;
            }
        }
        reset_job(store, &name, prefix, retry, &mut report).await;
    }

    let queued = backend.queued_job_names().await.unwrap_or_else(|e| {
        tracing::error!(backend = backend.name(), error = %e, "Could not list queued jobs");
        report.errors += 1;
        Vec::new()
    });
    for name in queued {
        match backend.cancel(&name).await {
            Ok(()) => report.cancelled.push(name.clone()),
            Err(e) => {
                tracing::error!(job_name = %name, error = %e, "Failed to cancel job");
                report.errors += 1;
            }
        }
        reset_job(store, &name, prefix, retry, &mut report).await;
    }

    tracing::info!(
        backend = backend.name(),
        killed = report.killed.len(),
        cancelled = report.cancelled.len(),
        reset = report.reset,
        errors = report.errors,
        "Backend shutdown sweep finished"
    );
    report
}

async fn reset_job(
    store: &JobStore,
    name: &str,
    prefix: &str,
    retry: RetryPolicy,
    report: &mut SweepReport,
) {
    let Some(job) = JobName::parse(name, prefix) else {
        tracing::warn!(job_name = %name, "Not a scheduler job name, leaving store untouched");
        return;
    };

    tracing::info!(job_id = job.id, kind = %job.kind, "Setting job to created");
    match retry
        .run("reset job", || store.reset_to_created(job.kind, job.id))
        .await
    {
        Ok(_) => report.reset += 1,
        Err(e) => {
            tracing::error!(job_id = job.id, kind = %job.kind, error = %e, "Failed to reset job");
            report.errors += 1;
        }
    }
}
