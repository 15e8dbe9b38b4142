use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{BackendError, ExecutionBackend, ExecutionRequest};
use crate::config::BatchConfig;

/// State of a job in the external scheduler's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Running,
    Other(String),
}

impl QueueState {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "REQUEUED" | "REQUEUE_HOLD" => QueueState::Pending,
            "RUNNING" | "CONFIGURING" | "COMPLETING" => QueueState::Running,
            other => QueueState::Other(other.to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub name: String,
    pub state: QueueState,
}

/// Submits jobs to a Slurm cluster.
///
/// The partition is chosen from the configured `(max_walltime, name)` table:
/// the first partition, in ascending walltime order, whose bound covers the
/// request. Counts and job names come from `squeue`, restricted to job names
/// carrying our prefix.
#[derive(Debug)]
pub struct RemoteBatchBackend {
    config: BatchConfig,
    partitions: Vec<(Duration, String)>,
    prefix: String,
    user: String,
    shut_down: AtomicBool,
}

impl RemoteBatchBackend {
    pub fn new(config: BatchConfig, prefix: impl Into<String>) -> Self {
        let mut partitions: Vec<(Duration, String)> = config
            .partitions
            .iter()
            .map(|p| (Duration::from_secs(p.max_walltime_mins * 60), p.name.clone()))
            .collect();
        partitions.sort();

        let user = config
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();

        Self {
            config,
            partitions,
            prefix: prefix.into(),
            user,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn select_partition(&self, walltime: Duration) -> Result<&str, BackendError> {
        self.partitions
            .iter()
            .find(|(max_walltime, _)| walltime <= *max_walltime)
            .map(|(_, name)| name.as_str())
            .ok_or(BackendError::NoPartitionFits { walltime })
    }

    /// Arguments for `sbatch`, excluding the program itself.
    pub fn sbatch_args(&self, request: &ExecutionRequest, partition: &str) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            request.job_name.clone(),
            "-p".to_string(),
            partition.to_string(),
        ];

        if let Some(ref mail) = self.config.mail_address {
            args.push(format!("--mail-user={mail}"));
        }
        if let Some(ref mail_type) = self.config.mail_type {
            args.push(format!("--mail-type={mail_type}"));
        }
        if let Some(ref stdout) = request.stdout {
            args.push("-o".to_string());
            args.push(stdout.display().to_string());
        }
        if let Some(ref stderr) = request.stderr {
            args.push("-e".to_string());
            args.push(stderr.display().to_string());
        }
        if let Some(ref memory) = self.config.memory {
            args.push(format!("--mem={memory}"));
        }
        args.push(format!("--time={}", format_walltime(request.walltime)));

        args.push(request.executable.display().to_string());
        args.extend(request.args.iter().cloned());
        args
    }

    /// Jobs of our user whose names carry the scheduler prefix.
    pub async fn list_jobs(&self) -> Result<Vec<QueueEntry>, BackendError> {
        let mut args = vec!["-h".to_string(), "-o".to_string(), "%j|%T".to_string()];
        if !self.user.is_empty() {
            args.push("-u".to_string());
            args.push(self.user.clone());
        }
        let output = run_command(&self.config.squeue, &args, &BTreeMap::new()).await?;

        let owned = format!("{}_", self.prefix);
        Ok(parse_squeue(&output)?
            .into_iter()
            .filter(|entry| entry.name.starts_with(&owned))
            .collect())
    }

    async fn names_in_state(&self, state: QueueState) -> Result<Vec<String>, BackendError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.name)
            .collect())
    }

    async fn scancel(&self, job_name: &str) -> Result<(), BackendError> {
        let mut args = vec!["--name".to_string(), job_name.to_string()];
        if !self.user.is_empty() {
            args.push("-u".to_string());
            args.push(self.user.clone());
        }
        run_command(&self.config.scancel, &args, &BTreeMap::new()).await?;
        tracing::info!(job_name, "Cancelled batch job");
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBatchBackend {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn submit(&self, request: ExecutionRequest) -> Result<(), BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::Shutdown);
        }
        let partition = self.select_partition(request.walltime)?;
        let args = self.sbatch_args(&request, partition);

        let output = run_command(&self.config.sbatch, &args, &request.env).await?;
        tracing::debug!(
            job_name = %request.job_name,
            partition,
            output = %output.trim(),
            "Submitted batch job"
        );
        Ok(())
    }

    async fn n_running(&self) -> Result<usize, BackendError> {
        Ok(self.names_in_state(QueueState::Running).await?.len())
    }

    async fn n_queued(&self) -> Result<usize, BackendError> {
        Ok(self.names_in_state(QueueState::Pending).await?.len())
    }

    async fn running_job_names(&self) -> Result<Vec<String>, BackendError> {
        self.names_in_state(QueueState::Running).await
    }

    async fn queued_job_names(&self) -> Result<Vec<String>, BackendError> {
        self.names_in_state(QueueState::Pending).await
    }

    async fn kill(&self, job_name: &str) -> Result<(), BackendError> {
        self.scancel(job_name).await
    }

    async fn cancel(&self, job_name: &str) -> Result<(), BackendError> {
        self.scancel(job_name).await
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

async fn run_command<P: AsRef<OsStr>>(
    program: P,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<String, BackendError> {
    let program_name = program.as_ref().to_string_lossy().to_string();
    let output = Command::new(program)
        .args(args)
        .envs(env)
        .output()
        .await
        .map_err(|source| BackendError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Scheduler {
            program: program_name,
            status: output.status.to_string(),
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        });
    }
    Ok(stdout)
}

/// Parse `squeue -h -o '%j|%T'` output.
pub fn parse_squeue(output: &str) -> Result<Vec<QueueEntry>, BackendError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, state) = line
                .rsplit_once('|')
                .ok_or_else(|| BackendError::Parse(format!("unexpected squeue line: {line}")))?;
            Ok(QueueEntry {
                name: name.to_string(),
                state: QueueState::parse(state),
            })
        })
        .collect()
}

/// Slurm `--time` value, `D-HH:MM:SS`.
pub fn format_walltime(walltime: Duration) -> String {
    let total = walltime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
}
