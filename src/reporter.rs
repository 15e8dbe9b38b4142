//! Job-side end of the status channel.
//!
//! A job process reads its [`ReportContext`] from the environment the
//! submitter published, reports `running`, runs its payload under the
//! walltime guard and then reports exactly one terminal status.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::monitor::{Ack, StatusReport, STATUS_PATH};
use crate::scheduler::job::{JobId, JobKind, JobStatus};
use crate::scheduler::request::env;

/// Safety margin between the command timeout and the allocated walltime.
pub const WALLTIME_MARGIN: Duration = Duration::from_secs(300);

/// Everything a job needs to know to report on itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportContext {
    pub host: String,
    pub port: u16,
    pub kind: JobKind,
    pub id: JobId,
    pub job_name: Option<String>,
    pub walltime: Duration,
    pub output_dir: Option<PathBuf>,
}

impl ReportContext {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| Error::Config(format!("{key} is not set")))
        };
        let invalid = |key: &str, value: &str| Error::Config(format!("invalid {key}: {value:?}"));

        let host = required(env::SUBMITTER_HOST)?;
        let port_raw = required(env::SUBMITTER_PORT)?;
        let port = port_raw
            .parse::<u16>()
            .map_err(|_| invalid(env::SUBMITTER_PORT, &port_raw))?;
        let kind_raw = required(env::JOB_KIND)?;
        let kind = kind_raw
            .parse::<JobKind>()
            .map_err(|_| invalid(env::JOB_KIND, &kind_raw))?;
        let id_raw = required(env::JOB_ID)?;
        let id = id_raw
            .parse::<JobId>()
            .map_err(|_| invalid(env::JOB_ID, &id_raw))?;
        let walltime_raw = required(env::WALLTIME)?;
        let walltime = walltime_raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| invalid(env::WALLTIME, &walltime_raw))?;

        Ok(Self {
            host,
            port,
            kind,
            id,
            job_name: lookup(env::JOB_NAME),
            walltime,
            output_dir: lookup(env::OUTPUT_DIR).map(PathBuf::from),
        })
    }

    pub fn status_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, STATUS_PATH)
    }

    /// Time the payload may run before it is stopped and reported as
    /// `walltime_exceeded`.
    pub fn command_timeout(&self) -> Duration {
        let margin = if self.walltime >= WALLTIME_MARGIN * 10 {
            WALLTIME_MARGIN
        } else {
            self.walltime / 10
        };
        self.walltime.saturating_sub(margin)
    }
}

/// HTTP client for the status monitor.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    context: ReportContext,
}

impl StatusReporter {
    pub fn new(context: ReportContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            context,
        }
    }

    pub fn context(&self) -> &ReportContext {
        &self.context
    }

    /// Send one report and wait for the acknowledgement.
    pub async fn report(
        &self,
        status: JobStatus,
        duration: Option<i64>,
        result_location: Option<String>,
    ) -> Result<Ack> {
        let report = StatusReport {
            job_kind: self.context.kind,
            job_id: self.context.id,
            status,
            duration,
            result_location,
        };
        tracing::debug!(?report, url = %self.context.status_url(), "Sending status report");

        let ack: Ack = self
            .client
            .post(self.context.status_url())
            .json(&report)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = &ack.error {
            tracing::warn!(status = %status, error = %error, "Status report rejected");
        }
        Ok(ack)
    }
}

/// Run `program` with `args` under the walltime guard and report its
/// life cycle. Returns the terminal status that was reported.
///
/// A command that cannot be started is reported as `failed`.
pub async fn run_reported(
    reporter: &StatusReporter,
    program: OsString,
    args: Vec<OsString>,
    result_location: Option<String>,
) -> Result<JobStatus> {
    let timeout = reporter.context().command_timeout();
    reporter.report(JobStatus::Running, None, None).await?;

    let started = Instant::now();
    let mut command = tokio::process::Command::new(&program);
    command.args(&args).kill_on_drop(true);

    let (status, location) = match command.spawn() {
        Err(e) => {
            tracing::error!(program = ?program, error = %e, "Could not start job command");
            (JobStatus::Failed, None)
        }
        Ok(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(exit)) if exit.success() => (JobStatus::Success, result_location),
            Ok(Ok(exit)) => {
                tracing::error!(%exit, "Job command failed");
                (JobStatus::Failed, None)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Lost track of job command");
                (JobStatus::Failed, None)
            }
            Err(_) => {
                tracing::error!(timeout_secs = timeout.as_secs(), "Job command exceeded walltime");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Could not kill job command");
                }
                (JobStatus::WalltimeExceeded, None)
            }
        },
    };

    let duration = started.elapsed().as_secs() as i64;
    reporter.report(status, Some(duration), location).await?;
    tracing::info!(status = %status, duration, "Job finished");
    Ok(status)
}
