use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, ExecutionBackend, ExecutionRequest};
use crate::retry::RetryPolicy;
use crate::scheduler::job::JobName;
use crate::store::JobStore;

/// A job process started by the pool.
#[derive(Debug)]
struct RunningJob {
    child: Child,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<ExecutionRequest>,
    running: HashMap<String, RunningJob>,
}

impl PoolState {
    /// Drop processes that have exited.
    fn prune(&mut self) {
        self.running.retain(|name, job| match job.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                tracing::warn!(
                    job_name = %name,
                    status = %status,
                    elapsed_secs = job.started_at.elapsed().as_secs(),
                    "Job process exited unsuccessfully, its record keeps the last reported status"
                );
                false
            }
            Ok(Some(status)) => {
                tracing::debug!(
                    job_name = %name,
                    status = %status,
                    elapsed_secs = job.started_at.elapsed().as_secs(),
                    "Job process exited"
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(job_name = %name, error = %e, "Could not poll job process");
                false
            }
        });
    }
}

/// Store handle used to fail jobs whose process could not be started.
#[derive(Debug, Clone)]
struct FailureSink {
    store: JobStore,
    prefix: String,
    retry: RetryPolicy,
}

/// Bounded in-process worker pool over external processes.
///
/// Accepted jobs wait in a FIFO queue; a control loop started with
/// [`LocalExecutor::start`] moves them into running child processes while
/// fewer than `max_workers` are alive.
///
/// A job taken off the queue whose process cannot be started is marked
/// `failed` in the store attached with [`LocalExecutor::with_store`].
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    max_workers: usize,
    poll_interval: Duration,
    state: Arc<Mutex<PoolState>>,
    shutdown: CancellationToken,
    failures: Option<FailureSink>,
}

impl LocalExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self::with_poll_interval(max_workers, Duration::from_millis(100))
    }

    pub fn with_poll_interval(max_workers: usize, poll_interval: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            poll_interval,
            state: Arc::new(Mutex::new(PoolState::default())),
            shutdown: CancellationToken::new(),
            failures: None,
        }
    }

    /// Settle spawn failures of jobs named `<prefix>_<kind>_<id>` in `store`.
    pub fn with_store(mut self, store: JobStore, prefix: impl Into<String>) -> Self {
        self.failures = Some(FailureSink {
            store,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
        });
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn the control loop. It exits once [`ExecutionBackend::shutdown`]
    /// has been called.
    pub fn start(&self) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move { executor.run().await })
    }

    async fn run(&self) {
        tracing::info!(max_workers = self.max_workers, "Local executor started");

        while !self.shutdown.is_cancelled() {
            if self.start_next().await {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Local executor stopped");
    }

    /// Prune exited processes and start one queued job if a worker is free.
    /// Returns true if a job was taken off the queue.
    async fn start_next(&self) -> bool {
        let failed = {
            let mut state = self.state.lock().await;
            state.prune();

            if state.running.len() >= self.max_workers {
                return false;
            }
            let Some(request) = state.queue.pop_front() else {
                return false;
            };

            match spawn_process(&request) {
                Ok(child) => {
                    tracing::info!(
                        job_name = %request.job_name,
                        pid = ?child.id(),
                        running = state.running.len() + 1,
                        "Started job process"
                    );
                    state.running.insert(
                        request.job_name,
                        RunningJob {
                            child,
                            started_at: Instant::now(),
                        },
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(job_name = %request.job_name, error = %e, "Could not start job process");
                    request.job_name
                }
            }
        };

        self.settle_spawn_failure(&failed).await;
        true
    }

    /// Move a job that never started from `queued` to `failed`.
    async fn settle_spawn_failure(&self, job_name: &str) {
        let Some(sink) = &self.failures else {
            tracing::warn!(job_name, "No job store attached, record left as queued");
            return;
        };
        let Some(job) = JobName::parse(job_name, &sink.prefix) else {
            tracing::warn!(job_name, "Not a scheduler job name, leaving store untouched");
            return;
        };

        match sink
            .retry
            .run("mark job failed", || {
                sink.store.mark_submission_failed(job.kind, job.id)
            })
            .await
        {
            Ok(true) => tracing::info!(job_id = job.id, kind = %job.kind, "Marked job failed"),
            Ok(false) => {
                tracing::debug!(job_id = job.id, kind = %job.kind, "Job already left queued")
            }
            Err(e) => {
                tracing::error!(job_id = job.id, kind = %job.kind, error = %e, "Failed to mark job failed")
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, request: ExecutionRequest) -> Result<(), BackendError> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Shutdown);
        }
        if request.job_name.is_empty() {
            return Err(BackendError::InvalidRequest("empty job name".to_string()));
        }
        if resolve_executable(&request.executable).is_none() {
            return Err(BackendError::InvalidRequest(format!(
                "executable not found or not executable: {}",
                request.executable.display()
            )));
        }

        let mut state = self.state.lock().await;
        tracing::debug!(job_name = %request.job_name, queued = state.queue.len() + 1, "Job accepted");
        state.queue.push_back(request);
        Ok(())
    }

    async fn n_running(&self) -> Result<usize, BackendError> {
        let mut state = self.state.lock().await;
        state.prune();
        Ok(state.running.len())
    }

    async fn n_queued(&self) -> Result<usize, BackendError> {
        Ok(self.state.lock().await.queue.len())
    }

    async fn running_job_names(&self) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock().await;
        state.prune();
        Ok(state.running.keys().cloned().collect())
    }

    async fn queued_job_names(&self) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock().await;
        Ok(state.queue.iter().map(|r| r.job_name.clone()).collect())
    }

    async fn kill(&self, job_name: &str) -> Result<(), BackendError> {
        // Release the lock before waiting on the process.
        let job = self.state.lock().await.running.remove(job_name);
        let Some(mut job) = job else {
            tracing::debug!(job_name, "Kill requested for unknown job");
            return Ok(());
        };

        if let Ok(Some(_)) = job.child.try_wait() {
            return Ok(());
        }

        tracing::info!(job_name, "Killing job process");
        job.child.kill().await.map_err(|source| BackendError::Spawn {
            program: job_name.to_string(),
            source,
        })
    }

    async fn cancel(&self, job_name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let before = state.queue.len();
        state.queue.retain(|r| r.job_name != job_name);
        if state.queue.len() < before {
            tracing::info!(job_name, "Cancelled queued job");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn spawn_process(request: &ExecutionRequest) -> Result<Child, BackendError> {
    let spawn_err = |source| BackendError::Spawn {
        program: request.executable.display().to_string(),
        source,
    };

    let (stdout, stderr) = match &request.stdout {
        Some(path) => {
            let file = File::create(path).map_err(spawn_err)?;
            let stderr = match &request.stderr {
                Some(err_path) => Stdio::from(File::create(err_path).map_err(spawn_err)?),
                None => Stdio::from(file.try_clone().map_err(spawn_err)?),
            };
            (Stdio::from(file), stderr)
        }
        None => {
            let stderr = match &request.stderr {
                Some(err_path) => Stdio::from(File::create(err_path).map_err(spawn_err)?),
                None => Stdio::null(),
            };
            (Stdio::null(), stderr)
        }
    };

    Command::new(&request.executable)
        .args(&request.args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(spawn_err)
}

/// Locate an executable either by path or through `$PATH`.
fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return is_executable(executable).then(|| executable.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(executable))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_executables_on_path() {
        assert!(resolve_executable(Path::new("sh")).is_some());
        assert!(resolve_executable(Path::new("/bin/sh")).is_some());
        assert!(resolve_executable(Path::new("definitely-not-a-binary-1234")).is_none());
        assert!(resolve_executable(Path::new("./no/such/file")).is_none());
    }

    #[test]
    fn files_without_exec_bit_are_not_executables() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(resolve_executable(&script).is_none());

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_executable(&script), Some(script.clone()));
    }

    #[tokio::test]
    async fn submit_rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = LocalExecutor::new(1)
            .submit(ExecutionRequest::new(&script, "job_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn submit_rejects_missing_executable() {
        let executor = LocalExecutor::new(1);
        let err = executor
            .submit(ExecutionRequest::new("no-such-binary-4321", "job_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
        assert_eq!(executor.n_queued().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_only_the_named_job() {
        let executor = LocalExecutor::new(1);
        executor
            .submit(ExecutionRequest::new("sh", "job_1"))
            .await
            .unwrap();
        executor
            .submit(ExecutionRequest::new("sh", "job_2"))
            .await
            .unwrap();

        executor.cancel("job_1").await.unwrap();
        executor.cancel("unknown").await.unwrap();

        assert_eq!(executor.queued_job_names().await.unwrap(), vec!["job_2"]);
    }
}
