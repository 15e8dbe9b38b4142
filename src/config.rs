use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default file looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "twostage.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://twostage.db`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://twostage.db".to_string(),
            max_connections: 4,
        }
    }
}

/// Submission loop and status channel settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Seconds between two submission cycles
    pub interval_secs: u64,
    /// No new jobs are submitted while the backend holds this many queued jobs
    pub max_queued_jobs: usize,
    /// Host name published to jobs for status reports; also recorded as job location
    pub host: String,
    /// Port of the status monitor
    pub port: u16,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_queued_jobs: 50,
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: 12700,
        }
    }
}

impl SubmitterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Local,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    pub max_walltime_mins: u64,
}

/// Slurm submission settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub partitions: Vec<PartitionConfig>,
    pub mail_address: Option<String>,
    pub mail_type: Option<String>,
    /// Memory request, e.g. "4G"
    pub memory: Option<String>,
    /// Owner of the jobs in `squeue`/`scancel`, defaults to `$USER`
    pub user: Option<String>,
    pub sbatch: PathBuf,
    pub squeue: PathBuf,
    pub scancel: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            mail_address: None,
            mail_type: None,
            memory: None,
            user: None,
            sbatch: PathBuf::from("sbatch"),
            squeue: PathBuf::from("squeue"),
            scancel: PathBuf::from("scancel"),
        }
    }
}

/// How jobs are turned into processes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Root for job outputs and logs
    pub output_dir: PathBuf,
    pub stage_a_executable: PathBuf,
    pub stage_b_executable: PathBuf,
    /// First component of every job name, `<prefix>_<kind>_<id>`
    pub job_name_prefix: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("twostage-data"),
            stage_a_executable: PathBuf::from("run_stage_a.sh"),
            stage_b_executable: PathBuf::from("run_stage_b.sh"),
            job_name_prefix: "twostage".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub submitter: SubmitterConfig,
    pub backend: BackendConfig,
    pub local: LocalConfig,
    pub batch: BatchConfig,
    pub jobs: JobsConfig,
    pub monitor: MonitorConfig,
    /// Serve the read-only dashboard on this port
    pub dashboard_port: Option<u16>,
}

impl SchedulerConfig {
    /// Load from `path` if given, else from `twostage.toml` if it exists,
    /// else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.submitter.interval_secs == 0 {
            return Err(Error::Config("submitter.interval_secs must be > 0".into()));
        }
        if self.jobs.job_name_prefix.is_empty() || self.jobs.job_name_prefix.contains('_') {
            return Err(Error::Config(
                "jobs.job_name_prefix must be non-empty and contain no '_'".into(),
            ));
        }
        if self.backend.mode == BackendMode::Batch && self.batch.partitions.is_empty() {
            return Err(Error::Config(
                "batch mode requires at least one [[batch.partitions]] entry".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.database.url, "sqlite://twostage.db");
        assert_eq!(cfg.submitter.interval_secs, 10);
        assert_eq!(cfg.submitter.max_queued_jobs, 50);
        assert_eq!(cfg.submitter.port, 12700);
        assert_eq!(cfg.backend.mode, BackendMode::Local);
        assert!(cfg.local.max_workers >= 1);
        assert_eq!(cfg.jobs.job_name_prefix, "twostage");
        assert!(cfg.dashboard_port.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn batch_config_default_programs() {
        let cfg = BatchConfig::default();
        assert_eq!(cfg.sbatch, PathBuf::from("sbatch"));
        assert_eq!(cfg.squeue, PathBuf::from("squeue"));
        assert_eq!(cfg.scancel, PathBuf::from("scancel"));
        assert!(cfg.partitions.is_empty());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = SchedulerConfig::parse(
            r#"
            dashboard_port = 8080

            [submitter]
            interval_secs = 2
            max_queued_jobs = 7
            host = "submit01"

            [backend]
            mode = "batch"

            [[batch.partitions]]
            name = "short"
            max_walltime_mins = 60

            [[batch.partitions]]
            name = "long"
            max_walltime_mins = 1440
            "#,
        )
        .unwrap();

        assert_eq!(cfg.dashboard_port, Some(8080));
        assert_eq!(cfg.submitter.interval(), Duration::from_secs(2));
        assert_eq!(cfg.submitter.max_queued_jobs, 7);
        assert_eq!(cfg.submitter.host, "submit01");
        assert_eq!(cfg.submitter.port, 12700);
        assert_eq!(cfg.backend.mode, BackendMode::Batch);
        assert_eq!(cfg.batch.partitions.len(), 2);
        assert_eq!(cfg.batch.partitions[1].name, "long");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn batch_mode_without_partitions_is_invalid() {
        let cfg = SchedulerConfig::parse("[backend]\nmode = \"batch\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn prefix_with_separator_is_invalid() {
        let mut cfg = SchedulerConfig::default();
        cfg.jobs.job_name_prefix = "my_jobs".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_backend_mode_fails_to_parse() {
        assert!(SchedulerConfig::parse("[backend]\nmode = \"cloud\"\n").is_err());
    }

    #[test]
    fn monitor_retry_policy() {
        let policy = MonitorConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[local]\nmax_workers = 3\n").unwrap();

        let cfg = SchedulerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.local.max_workers, 3);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            SchedulerConfig::load(Some(&missing)),
            Err(Error::Config(_))
        ));
    }
}
