//! Persistent job store.
//!
//! The store is the single serialization point between the submission loop,
//! the status monitor and backend shutdown. Every status change is one
//! conditional `UPDATE` whose `WHERE` clause encodes the allowed
//! predecessors of the target status, so concurrent writers never need an
//! in-process lock: a transition either applies atomically or is a no-op.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use crate::scheduler::job::{Job, JobDetail, JobId, JobKind, JobStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stage_a_jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    priority        INTEGER NOT NULL,
    status          TEXT    NOT NULL DEFAULT 'created'
                    CHECK (status IN ('created', 'queued', 'running', 'success', 'failed', 'walltime_exceeded')),
    walltime_secs   INTEGER NOT NULL CHECK (walltime_secs > 0),
    location        TEXT,
    duration_secs   INTEGER,
    result_location TEXT,
    payload         TEXT    NOT NULL DEFAULT '{}',
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS stage_b_jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    upstream_ref    INTEGER NOT NULL REFERENCES stage_a_jobs (id),
    run_key         TEXT    NOT NULL,
    priority        INTEGER NOT NULL,
    status          TEXT    NOT NULL DEFAULT 'created'
                    CHECK (status IN ('created', 'queued', 'running', 'success', 'failed', 'walltime_exceeded')),
    walltime_secs   INTEGER NOT NULL CHECK (walltime_secs > 0),
    location        TEXT,
    duration_secs   INTEGER,
    result_location TEXT,
    payload         TEXT    NOT NULL DEFAULT '{}',
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL,
    UNIQUE (upstream_ref, run_key)
);

CREATE INDEX IF NOT EXISTS idx_stage_a_pending ON stage_a_jobs (status, priority, id);
CREATE INDEX IF NOT EXISTS idx_stage_b_pending ON stage_b_jobs (status, priority, id);
"#;

const STAGE_A_SELECT: &str = "SELECT id, priority, status, walltime_secs, location, duration_secs, \
     result_location, payload, created_at, updated_at FROM stage_a_jobs";

const STAGE_B_SELECT: &str = "SELECT b.id, b.priority, b.status, b.walltime_secs, b.location, \
     b.duration_secs, b.result_location, b.payload, b.created_at, b.updated_at, \
     b.upstream_ref, b.run_key, a.result_location AS upstream_result \
     FROM stage_b_jobs b LEFT JOIN stage_a_jobs a ON a.id = b.upstream_ref";

// SQLite primary result codes for a locked database.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stage_b job for upstream {upstream_ref} with run key {run_key:?} already exists")]
    Conflict { upstream_ref: JobId, run_key: String },

    #[error("{kind} job {id} not found")]
    NotFound { kind: JobKind, id: JobId },

    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connectivity failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        let StoreError::Database(err) = self else {
            return false;
        };
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A new stage-A job as handed in by a producer.
#[derive(Debug, Clone)]
pub struct NewStageA {
    pub priority: Option<i64>,
    pub walltime: Duration,
    pub payload: String,
}

/// A new stage-B job. `run_key` distinguishes several post-processing runs
/// over the same upstream output.
#[derive(Debug, Clone)]
pub struct NewStageB {
    pub upstream_ref: JobId,
    pub run_key: String,
    pub priority: Option<i64>,
    pub walltime: Duration,
    pub payload: String,
}

/// Status plus the optional terminal fields carried by a report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub duration: Option<i64>,
    pub result_location: Option<String>,
}

impl StatusUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            duration: None,
            result_location: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

/// Handle to the job database. Cheap to clone; constructed once at startup
/// and passed to every component that needs it.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Connect to a SQLite database URL, creating the file if needed.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::info!(url, "Connected to job store");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection that is never
    /// recycled keeps the database alive for the lifetime of the handle.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    pub async fn insert_stage_a(&self, job: NewStageA) -> StoreResult<JobId> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO stage_a_jobs (priority, walltime_secs, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.priority.unwrap_or(JobKind::StageA.default_priority()))
        .bind(walltime_secs(job.walltime))
        .bind(job.payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!(job_id = id, kind = %JobKind::StageA, "Job inserted");
        Ok(id)
    }

    pub async fn insert_stage_b(&self, job: NewStageB) -> StoreResult<JobId> {
        let upstream_exists = sqlx::query("SELECT 1 FROM stage_a_jobs WHERE id = ?")
            .bind(job.upstream_ref)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !upstream_exists {
            return Err(StoreError::NotFound {
                kind: JobKind::StageA,
                id: job.upstream_ref,
            });
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO stage_b_jobs \
             (upstream_ref, run_key, priority, walltime_secs, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.upstream_ref)
        .bind(&job.run_key)
        .bind(job.priority.unwrap_or(JobKind::StageB.default_priority()))
        .bind(walltime_secs(job.walltime))
        .bind(job.payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => {
                let id = result.last_insert_rowid();
                tracing::debug!(
                    job_id = id,
                    kind = %JobKind::StageB,
                    upstream_ref = job.upstream_ref,
                    "Job inserted"
                );
                Ok(id)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict {
                    upstream_ref: job.upstream_ref,
                    run_key: job.run_key,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_job(&self, kind: JobKind, id: JobId) -> StoreResult<Option<Job>> {
        let sql = match kind {
            JobKind::StageA => format!("{STAGE_A_SELECT} WHERE id = ?"),
            JobKind::StageB => format!("{STAGE_B_SELECT} WHERE b.id = ?"),
        };
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| job_from_row(kind, &row)).transpose()
    }

    /// Stage-A jobs in `created`, most urgent first.
    pub async fn created_stage_a(&self, limit: i64) -> StoreResult<Vec<Job>> {
        let sql = format!("{STAGE_A_SELECT} WHERE status = ? ORDER BY priority, id LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Created.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| job_from_row(JobKind::StageA, row))
            .collect()
    }

    /// Stage-B jobs in `created` whose upstream job finished with `success`,
    /// most urgent first.
    pub async fn eligible_stage_b(&self, limit: i64) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "{STAGE_B_SELECT} WHERE b.status = ? AND a.status = ? \
             ORDER BY b.priority, b.id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Created.as_str())
            .bind(JobStatus::Success.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| job_from_row(JobKind::StageB, row))
            .collect()
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let kinds: Vec<JobKind> = match filter.kind {
            Some(kind) => vec![kind],
            None => JobKind::ALL.to_vec(),
        };
        let limit = filter.limit.unwrap_or(-1);
        let status = filter.status.map(|s| s.as_str());

        let mut jobs = Vec::new();
        for kind in kinds {
            let sql = match kind {
                JobKind::StageA => format!(
                    "{STAGE_A_SELECT} WHERE (?1 IS NULL OR status = ?1) ORDER BY id LIMIT ?2"
                ),
                JobKind::StageB => format!(
                    "{STAGE_B_SELECT} WHERE (?1 IS NULL OR b.status = ?1) ORDER BY b.id LIMIT ?2"
                ),
            };
            let rows = sqlx::query(&sql)
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                jobs.push(job_from_row(kind, row)?);
            }
        }
        Ok(jobs)
    }

    /// Number of jobs of `kind` per status. Statuses without jobs are omitted.
    pub async fn count_by_status(&self, kind: JobKind) -> StoreResult<Vec<(JobStatus, i64)>> {
        let sql = format!(
            "SELECT status, COUNT(*) AS n FROM {} GROUP BY status ORDER BY status",
            table(kind)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                Ok((parse_status(&status)?, n))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Conditional transitions
    // ---------------------------------------------------------------------

    /// `created -> queued`, recording the owner. Returns false if the job
    /// was not in `created` any more.
    pub async fn claim(&self, kind: JobKind, id: JobId, location: &str) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET status = ?, location = ?, updated_at = ? WHERE id = ? AND status = ?",
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::Queued.as_str())
            .bind(location)
            .bind(Utc::now())
            .bind(id)
            .bind(JobStatus::Created.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `queued -> failed` after the backend refused the job.
    pub async fn mark_submission_failed(&self, kind: JobKind, id: JobId) -> StoreResult<bool> {
        self.apply_update(kind, id, &StatusUpdate::status(JobStatus::Failed))
            .await
    }

    /// Apply a status report under the race guard.
    ///
    /// The update only applies when the current status is one of the
    /// target's predecessors, and never when the job is in `created`: a
    /// late report from a process killed during shutdown must not touch a
    /// job that was already handed back to the pending pool. Returns
    /// whether a row changed; a rejected transition is not an error.
    pub async fn apply_update(
        &self,
        kind: JobKind,
        id: JobId,
        update: &StatusUpdate,
    ) -> StoreResult<bool> {
        let predecessors = update.status.predecessors();
        if predecessors.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET status = ?, \
                 duration_secs = COALESCE(?, duration_secs), \
                 result_location = COALESCE(?, result_location), \
                 updated_at = ? \
             WHERE id = ? AND status != ? AND status IN ({placeholders})",
            table(kind)
        );

        let mut query = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(update.duration)
            .bind(update.result_location.as_deref())
            .bind(Utc::now())
            .bind(id)
            .bind(JobStatus::Created.as_str());
        for status in predecessors {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Universal reset edge: hand the job back to the pending pool and forget
    /// its previous owner and results.
    pub async fn reset_to_created(&self, kind: JobKind, id: JobId) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET status = ?, location = NULL, duration_secs = NULL, \
             result_location = NULL, updated_at = ? WHERE id = ? AND status != ?",
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::Created.as_str())
            .bind(Utc::now())
            .bind(id)
            .bind(JobStatus::Created.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Reset every failed job of `kind` for resubmission.
    pub async fn reset_failed(&self, kind: JobKind) -> StoreResult<u64> {
        let sql = format!(
            "UPDATE {} SET status = ?, location = NULL, duration_secs = NULL, \
             result_location = NULL, updated_at = ? WHERE status = ?",
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::Created.as_str())
            .bind(Utc::now())
            .bind(JobStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn table(kind: JobKind) -> &'static str {
    match kind {
        JobKind::StageA => "stage_a_jobs",
        JobKind::StageB => "stage_b_jobs",
    }
}

fn walltime_secs(walltime: Duration) -> i64 {
    i64::try_from(walltime.as_secs()).unwrap_or(i64::MAX)
}

fn parse_status(raw: &str) -> StoreResult<JobStatus> {
    raw.parse().map_err(StoreError::Corrupt)
}

fn job_from_row(kind: JobKind, row: &SqliteRow) -> StoreResult<Job> {
    let status: String = row.try_get("status")?;
    let walltime: i64 = row.try_get("walltime_secs")?;

    let detail = match kind {
        JobKind::StageA => JobDetail::StageA,
        JobKind::StageB => JobDetail::StageB {
            upstream_ref: row.try_get("upstream_ref")?,
            run_key: row.try_get("run_key")?,
            upstream_result: row.try_get("upstream_result")?,
        },
    };

    Ok(Job {
        id: row.try_get("id")?,
        priority: row.try_get("priority")?,
        status: parse_status(&status)?,
        walltime: Duration::from_secs(u64::try_from(walltime).unwrap_or(0)),
        location: row.try_get("location")?,
        duration: row.try_get("duration_secs")?,
        result_location: row.try_get("result_location")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        detail,
    })
}
