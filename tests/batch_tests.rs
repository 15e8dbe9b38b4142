//! Tests for the Slurm backend against fake `sbatch`/`squeue`/`scancel`
//! scripts in a scratch directory.


use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use test_harness::{add_stage_a, force_status, name, status_of, test_store, PREFIX};
use twostage::backend::{BackendError, ExecutionBackend, ExecutionRequest, RemoteBatchBackend};
use twostage::config::{BatchConfig, PartitionConfig};
use twostage::scheduler::{JobKind, JobStatus};

struct FakeSlurm {
    dir: tempfile::TempDir,
}

impl FakeSlurm {
    fn new() -> Self {
        let fake = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        let root = fake.dir.path().display().to_string();
        fake.script(
            "sbatch",
            &format!(
                "echo \"$@\" >> {root}/sbatch.log\necho \"JOB_ID=$TWOSTAGE_JOB_ID\" >> {root}/sbatch.log\necho 'Submitted batch job 1'\n"
            ),
        );
        fake.script("squeue", &format!("cat {root}/queue\n"));
        fake.script("scancel", &format!("echo \"$@\" >> {root}/scancel.log\n"));
        fake.set_queue("");
        fake
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    fn script(&self, program: &str, body: &str) {
        let path = self.path(program);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn set_queue(&self, listing: &str) {
        std::fs::write(self.path("queue"), listing).unwrap();
    }

    fn read(&self, file: &str) -> String {
        std::fs::read_to_string(self.path(file)).unwrap_or_default()
    }

    fn config(&self) -> BatchConfig {
        BatchConfig {
            partitions: vec![
                PartitionConfig {
                    name: "long".to_string(),
                    max_walltime_mins: 2880,
                },
                PartitionConfig {
                    name: "short".to_string(),
                    max_walltime_mins: 60,
                },
            ],
            mail_address: Some("ops@example.org".to_string()),
            mail_type: Some("FAIL".to_string()),
            memory: Some("4G".to_string()),
            user: Some("tester".to_string()),
            sbatch: self.path("sbatch"),
            squeue: self.path("squeue"),
            scancel: self.path("scancel"),
        }
    }

    fn backend(&self) -> RemoteBatchBackend {
        RemoteBatchBackend::new(self.config(), PREFIX)
    }
}

fn request(walltime_mins: u64, log: &Path) -> ExecutionRequest {
    ExecutionRequest::new("/opt/run_stage_a.sh", "twostage_stage_a_7")
        .with_args(["--fast"])
        .with_env("TWOSTAGE_JOB_ID", "7")
        .with_stdout(log)
        .with_walltime(Duration::from_secs(walltime_mins * 60))
}

#[tokio::test]
async fn test_submit_picks_smallest_fitting_partition() {
    let slurm = FakeSlurm::new();
    let backend = slurm.backend();

    backend
        .submit(request(30, Path::new("/logs/a.log")))
        .await
        .unwrap();

    let log = slurm.read("sbatch.log");
    assert!(log.contains("-J twostage_stage_a_7 -p short"));
    assert!(log.contains("--mail-user=ops@example.org --mail-type=FAIL"));
    assert!(log.contains("-o /logs/a.log"));
    assert!(log.contains("--mem=4G --time=0-00:30:00 /opt/run_stage_a.sh --fast"));
    assert!(log.contains("JOB_ID=7"));

    backend
        .submit(request(600, Path::new("/logs/a.log")))
        .await
        .unwrap();
    assert!(slurm.read("sbatch.log").contains("-p long"));
}

#[tokio::test]
async fn test_submit_without_fitting_partition_fails() {
    let slurm = FakeSlurm::new();
    let err = slurm
        .backend()
        .submit(request(3000, Path::new("/logs/a.log")))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::NoPartitionFits { .. }));
    assert!(slurm.read("sbatch.log").is_empty());
}

#[tokio::test]
async fn test_sbatch_failure_is_reported() {
    let slurm = FakeSlurm::new();
    slurm.script("sbatch", "echo 'sbatch: error: invalid account' >&2\nexit 1\n");

    let err = slurm
        .backend()
        .submit(request(30, Path::new("/logs/a.log")))
        .await
        .unwrap_err();
    match err {
        BackendError::Scheduler { output, .. } => assert!(output.contains("invalid account")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_counts_only_own_jobs() {
    let slurm = FakeSlurm::new();
    slurm.set_queue(
        "twostage_stage_a_1|RUNNING\n\
         twostage_stage_b_2|PENDING\n\
         twostage_stage_a_3|PENDING\n\
         someone_elses_job|PENDING\n\
         twostage_stage_a_4|COMPLETING\n\
         twostage_stage_a_5|SUSPENDED\n",
    );
    let backend = slurm.backend();

    assert_eq!(backend.n_queued().await.unwrap(), 2);
    assert_eq!(backend.n_running().await.unwrap(), 2);
    assert_eq!(
        backend.queued_job_names().await.unwrap(),
        vec!["twostage_stage_b_2", "twostage_stage_a_3"]
    );
    assert_eq!(
        backend.running_job_names().await.unwrap(),
        vec!["twostage_stage_a_1", "twostage_stage_a_4"]
    );
}

#[tokio::test]
async fn test_terminate_cancels_and_resets() {
    let slurm = FakeSlurm::new();
    let store = test_store().await;
    let running = add_stage_a(&store, 1).await;
    let queued = add_stage_a(&store, 1).await;
    force_status(&store, JobKind::StageA, running, JobStatus::Running).await;
    force_status(&store, JobKind::StageA, queued, JobStatus::Queued).await;

    slurm.set_queue(&format!(
        "{}|RUNNING\n{}|PENDING\n",
        name(JobKind::StageA, running),
        name(JobKind::StageA, queued)
    ));
    let backend = slurm.backend();

    let report = backend.terminate(&store, PREFIX).await;
    assert_eq!(report.reset, 2);
    assert_eq!(report.errors, 0);

    let cancels = slurm.read("scancel.log");
    assert!(cancels.contains(&format!("--name {} -u tester", name(JobKind::StageA, running))));
    assert!(cancels.contains(&format!("--name {} -u tester", name(JobKind::StageA, queued))));
    assert_eq!(status_of(&store, JobKind::StageA, running).await, JobStatus::Created);
    assert_eq!(status_of(&store, JobKind::StageA, queued).await, JobStatus::Created);

    let err = backend
        .submit(request(30, Path::new("/logs/a.log")))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Shutdown));
}
