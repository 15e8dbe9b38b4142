use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, ExecutionBackend};
use crate::config::SubmitterConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::job::Job;
use crate::scheduler::pending::pending_jobs;
use crate::scheduler::request::{ReportAddress, RequestBuilder};
use crate::store::JobStore;

/// What one submission cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Free queue slots at the start of the cycle
    pub capacity: usize,
    pub submitted: usize,
    pub failed: usize,
    /// Candidates another writer moved out of `created` first
    pub skipped: usize,
    /// True when the cycle stopped early on cancellation
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitOutcome {
    Submitted,
    Failed,
    Skipped,
}

/// Periodic loop moving pending jobs from the store into the backend.
pub struct JobSubmitter {
    store: JobStore,
    backend: Arc<dyn ExecutionBackend>,
    builder: Arc<dyn RequestBuilder>,
    config: SubmitterConfig,
    retry: RetryPolicy,
}

impl JobSubmitter {
    pub fn new(
        store: JobStore,
        backend: Arc<dyn ExecutionBackend>,
        builder: Arc<dyn RequestBuilder>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            store,
            backend,
            builder,
            config,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for settling a job whose submission did not go through.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn report_address(&self) -> ReportAddress {
        ReportAddress {
            host: self.config.host.clone(),
            port: self.config.port,
        }
    }

    /// Run cycles every `interval` until `cancel` fires.
    ///
    /// Errors never stop the loop; they are logged and the next cycle
    /// tries again.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            max_queued_jobs = self.config.max_queued_jobs,
            backend = self.backend.name(),
            "Job submitter started"
        );

        while !cancel.is_cancelled() {
            match self.process_pending_jobs(&cancel).await {
                Ok(report) if report.submitted > 0 || report.failed > 0 => {
                    tracing::info!(
                        submitted = report.submitted,
                        failed = report.failed,
                        capacity = report.capacity,
                        "Submission cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::error!(error = %e, "Lost database connection");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error during submission");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }

        tracing::info!("Job submitter stopped");
    }

    /// One submission cycle.
    ///
    /// Applies backpressure from the backend's queued count, then submits
    /// the pending candidates in priority order. A failed submission marks
    /// that job `failed` and the cycle carries on.
    pub async fn process_pending_jobs(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let n_queued = self.backend.n_queued().await?;
        let capacity = self.config.max_queued_jobs.saturating_sub(n_queued);
        let mut report = CycleReport {
            capacity,
            ..CycleReport::default()
        };

        tracing::debug!(n_queued, capacity, "Checking for pending jobs");
        if capacity == 0 {
            return Ok(report);
        }

        let candidates = pending_jobs(&self.store, capacity).await?;
        for job in &candidates {
            if cancel.is_cancelled() {
                tracing::info!("Submission cycle interrupted");
                report.interrupted = true;
                break;
            }

            match self.submit_job(job).await? {
                SubmitOutcome::Submitted => report.submitted += 1,
                SubmitOutcome::Failed => report.failed += 1,
                SubmitOutcome::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// Claim the job, hand it to the backend, and settle its status.
    ///
    /// The job is moved to `queued` before the backend sees it, so a fast
    /// job's `running` report always finds it there.
    async fn submit_job(&self, job: &Job) -> Result<SubmitOutcome> {
        let kind = job.kind();
        if !self.store.claim(kind, job.id, &self.config.host).await? {
            tracing::debug!(job_id = job.id, kind = %kind, "Job left created state, skipping");
            return Ok(SubmitOutcome::Skipped);
        }

        let submitted = async {
            let request = self.builder.build(job, &self.report_address()).await?;
            self.backend.submit(request).await?;
            Ok::<_, Error>(())
        }
        .await;

        match submitted {
            Ok(()) => {
                tracing::info!(
                    job_id = job.id,
                    kind = %kind,
                    priority = job.priority,
                    backend = self.backend.name(),
                    "Submitted job"
                );
                Ok(SubmitOutcome::Submitted)
            }
            Err(Error::Backend(BackendError::Shutdown)) => {
                tracing::error!(job_id = job.id, kind = %kind, "Backend shut down during submission");
                self.retry
                    .run("reset job", || self.store.reset_to_created(kind, job.id))
                    .await?;
                Err(BackendError::Shutdown.into())
            }
            Err(e) => {
                tracing::error!(job_id = job.id, kind = %kind, error = %e, "Could not submit job");
                self.retry
                    .run("mark job failed", || {
                        self.store.mark_submission_failed(kind, job.id)
                    })
                    .await?;
                Ok(SubmitOutcome::Failed)
            }
        }
    }
}
