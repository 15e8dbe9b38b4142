use std::path::PathBuf;

use async_trait::async_trait;

use crate::backend::ExecutionRequest;
use crate::config::JobsConfig;
use crate::error::Result;
use crate::scheduler::job::{Job, JobDetail, JobKind, JobName};

/// Environment variables published to every job.
pub mod env {
    pub const SUBMITTER_HOST: &str = "TWOSTAGE_SUBMITTER_HOST";
    pub const SUBMITTER_PORT: &str = "TWOSTAGE_SUBMITTER_PORT";
    pub const JOB_KIND: &str = "TWOSTAGE_JOB_KIND";
    pub const JOB_ID: &str = "TWOSTAGE_JOB_ID";
    pub const JOB_NAME: &str = "TWOSTAGE_JOB_NAME";
    pub const WALLTIME: &str = "TWOSTAGE_WALLTIME";
    pub const OUTPUT_DIR: &str = "TWOSTAGE_OUTPUT_DIR";
    pub const PAYLOAD: &str = "TWOSTAGE_PAYLOAD";
    pub const UPSTREAM_ID: &str = "TWOSTAGE_UPSTREAM_ID";
    pub const UPSTREAM_RESULT: &str = "TWOSTAGE_UPSTREAM_RESULT";
}

/// Where jobs send their status reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportAddress {
    pub host: String,
    pub port: u16,
}

/// Turns a store record into something a backend can run.
#[async_trait]
pub trait RequestBuilder: Send + Sync {
    async fn build(&self, job: &Job, report_to: &ReportAddress) -> Result<ExecutionRequest>;
}

/// Runs one configured executable per job kind and wires the reporter
/// context into its environment.
#[derive(Debug, Clone)]
pub struct ScriptRequestBuilder {
    config: JobsConfig,
}

impl ScriptRequestBuilder {
    pub fn new(config: JobsConfig) -> Self {
        Self { config }
    }

    pub fn job_name(&self, job: &Job) -> String {
        JobName::new(job.kind(), job.id).render(&self.config.job_name_prefix)
    }

    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.config
            .output_dir
            .join(job.kind().as_str())
            .join(format!("{:08}", job.id))
    }

    pub fn log_file(&self, job: &Job) -> PathBuf {
        self.config
            .output_dir
            .join("logs")
            .join(job.kind().as_str())
            .join(format!("{}.log", self.job_name(job)))
    }
}

#[async_trait]
impl RequestBuilder for ScriptRequestBuilder {
    async fn build(&self, job: &Job, report_to: &ReportAddress) -> Result<ExecutionRequest> {
        let executable = match job.kind() {
            JobKind::StageA => &self.config.stage_a_executable,
            JobKind::StageB => &self.config.stage_b_executable,
        };
        let job_name = self.job_name(job);
        let output_dir = self.output_dir(job);
        let log_file = self.log_file(job);

        tokio::fs::create_dir_all(&output_dir).await?;
        if let Some(log_dir) = log_file.parent() {
            tokio::fs::create_dir_all(log_dir).await?;
        }

        let mut request = ExecutionRequest::new(executable.clone(), job_name.clone())
            .with_stdout(log_file)
            .with_walltime(job.walltime)
            .with_env(env::SUBMITTER_HOST, report_to.host.clone())
            .with_env(env::SUBMITTER_PORT, report_to.port.to_string())
            .with_env(env::JOB_KIND, job.kind().as_str())
            .with_env(env::JOB_ID, job.id.to_string())
            .with_env(env::JOB_NAME, job_name)
            .with_env(env::WALLTIME, job.walltime.as_secs().to_string())
            .with_env(env::OUTPUT_DIR, output_dir.display().to_string())
            .with_env(env::PAYLOAD, job.payload.clone());

        if let JobDetail::StageB {
            upstream_ref,
            upstream_result,
            ..
        } = &job.detail
        {
            request = request.with_env(env::UPSTREAM_ID, upstream_ref.to_string());
            if let Some(result) = upstream_result {
                request = request.with_env(env::UPSTREAM_RESULT, result.clone());
            }
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::scheduler::job::JobStatus;

    fn job(detail: JobDetail) -> Job {
        Job {
            id: 12,
            priority: 1,
            status: JobStatus::Created,
            walltime: Duration::from_secs(7200),
            location: None,
            duration: None,
            result_location: None,
            payload: r#"{"particle":14}"#.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            detail,
        }
    }

    fn builder(root: &std::path::Path) -> ScriptRequestBuilder {
        ScriptRequestBuilder::new(JobsConfig {
            output_dir: root.to_path_buf(),
            stage_a_executable: PathBuf::from("/opt/a.sh"),
            stage_b_executable: PathBuf::from("/opt/b.sh"),
            job_name_prefix: "twostage".to_string(),
        })
    }

    fn address() -> ReportAddress {
        ReportAddress {
            host: "submit01".to_string(),
            port: 12700,
        }
    }

    #[tokio::test]
    async fn stage_a_request_publishes_report_context() {
        let dir = tempfile::tempdir().unwrap();
        let request = builder(dir.path())
            .build(&job(JobDetail::StageA), &address())
            .await
            .unwrap();

        assert_eq!(request.executable, PathBuf::from("/opt/a.sh"));
        assert_eq!(request.job_name, "twostage_stage_a_12");
        assert_eq!(request.walltime, Duration::from_secs(7200));
        assert!(request.stderr.is_none());
        assert_eq!(request.env[env::SUBMITTER_HOST], "submit01");
        assert_eq!(request.env[env::SUBMITTER_PORT], "12700");
        assert_eq!(request.env[env::JOB_KIND], "stage_a");
        assert_eq!(request.env[env::JOB_ID], "12");
        assert_eq!(request.env[env::WALLTIME], "7200");
        assert_eq!(request.env[env::PAYLOAD], r#"{"particle":14}"#);
        assert!(!request.env.contains_key(env::UPSTREAM_ID));

        let log = request.stdout.unwrap();
        assert!(log.parent().unwrap().is_dir());
        assert!(log.ends_with("logs/stage_a/twostage_stage_a_12.log"));
    }

    #[tokio::test]
    async fn stage_b_request_points_at_upstream_result() {
        let dir = tempfile::tempdir().unwrap();
        let detail = JobDetail::StageB {
            upstream_ref: 3,
            run_key: "wobble".to_string(),
            upstream_result: Some("/data/a3.eventio".to_string()),
        };
        let request = builder(dir.path())
            .build(&job(detail), &address())
            .await
            .unwrap();

        assert_eq!(request.executable, PathBuf::from("/opt/b.sh"));
        assert_eq!(request.env[env::UPSTREAM_ID], "3");
        assert_eq!(request.env[env::UPSTREAM_RESULT], "/data/a3.eventio");
    }
}
