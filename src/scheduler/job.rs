use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store identity of a job. Ids are only unique within one [`JobKind`].
pub type JobId = i64;

/// The two dependent job kinds of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Raw simulation run.
    StageA,
    /// Post-processing run consuming the output of one `StageA` job.
    StageB,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::StageA, JobKind::StageB];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::StageA => "stage_a",
            JobKind::StageB => "stage_b",
        }
    }

    /// Priority assigned when the producer does not choose one.
    /// Post-processing wins once it is unblocked.
    pub fn default_priority(&self) -> i64 {
        match self {
            JobKind::StageA => 10,
            JobKind::StageB => 5,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stage_a" => Ok(JobKind::StageA),
            "stage_b" => Ok(JobKind::StageB),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Success,
    Failed,
    WalltimeExceeded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::WalltimeExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::WalltimeExceeded => "walltime_exceeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::WalltimeExceeded
        )
    }

    /// Statuses a job may be in for a forward transition to `self`.
    ///
    /// The reset edge to `Created` is not a forward transition and is
    /// handled separately, so `Created` has no predecessors here.
    /// `Failed` is also reachable from `Queued`: a submission error or a
    /// job dying before it could report `running`.
    pub fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Created => &[],
            JobStatus::Queued => &[JobStatus::Created],
            JobStatus::Running => &[JobStatus::Queued],
            JobStatus::Failed => &[JobStatus::Queued, JobStatus::Running],
            JobStatus::Success | JobStatus::WalltimeExceeded => &[JobStatus::Running],
        }
    }

    /// Whether `self -> next` lies on the status DAG, including the
    /// universal reset edge.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if next == JobStatus::Created {
            return *self != JobStatus::Created;
        }
        next.predecessors().contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Kind-specific part of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDetail {
    StageA,
    StageB {
        upstream_ref: JobId,
        run_key: String,
        /// Result location of the upstream job, filled by queries that join it.
        upstream_result: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub priority: i64,
    pub status: JobStatus,
    #[serde(with = "duration_secs")]
    pub walltime: Duration,
    pub location: Option<String>,
    pub duration: Option<i64>,
    pub result_location: Option<String>,
    /// Opaque domain parameters, forwarded to the job untouched.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: JobDetail,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self.detail {
            JobDetail::StageA => JobKind::StageA,
            JobDetail::StageB { .. } => JobKind::StageB,
        }
    }

    pub fn upstream_ref(&self) -> Option<JobId> {
        match &self.detail {
            JobDetail::StageA => None,
            JobDetail::StageB { upstream_ref, .. } => Some(*upstream_ref),
        }
    }
}

/// Correlation name of a submitted job: `<prefix>_<kind>_<id>`.
///
/// Backends only know jobs by this name; shutdown parses it back to
/// locate the store record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobName {
    pub kind: JobKind,
    pub id: JobId,
}

impl JobName {
    pub fn new(kind: JobKind, id: JobId) -> Self {
        Self { kind, id }
    }

    pub fn render(&self, prefix: &str) -> String {
        format!("{}_{}_{}", prefix, self.kind, self.id)
    }

    /// Parse a job name produced by [`JobName::render`] with the same prefix.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
        let (kind, id) = rest.rsplit_once('_')?;
        Some(Self {
            kind: kind.parse().ok()?,
            id: id.parse().ok()?,
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
