use crate::scheduler::job::{Job, JobKind};
use crate::store::{JobStore, StoreResult};

/// Fetch up to `max_jobs` submittable jobs, most urgent first.
///
/// Stage-A and stage-B candidates are selected independently, each capped
/// at `max_jobs`, and merged afterwards. Stage-B candidates are only those
/// whose upstream job finished with `success`.
pub async fn pending_jobs(store: &JobStore, max_jobs: usize) -> StoreResult<Vec<Job>> {
    if max_jobs == 0 {
        return Ok(Vec::new());
    }
    let limit = i64::try_from(max_jobs).unwrap_or(i64::MAX);

    let stage_a = store.created_stage_a(limit).await?;
    let stage_b = store.eligible_stage_b(limit).await?;

    tracing::debug!(
        stage_a = stage_a.len(),
        stage_b = stage_b.len(),
        max_jobs,
        "Pending candidates selected"
    );

    Ok(merge_candidates(stage_a, stage_b, max_jobs))
}

/// Merge two per-kind candidate lists by priority and truncate.
///
/// The sort is stable, so equal priorities keep their per-kind order with
/// stage-A candidates ahead of stage-B ones.
pub fn merge_candidates(stage_a: Vec<Job>, stage_b: Vec<Job>, max_jobs: usize) -> Vec<Job> {
    debug_assert!(stage_a.iter().all(|j| j.kind() == JobKind::StageA));
    debug_assert!(stage_b.iter().all(|j| j.kind() == JobKind::StageB));

    let mut jobs = stage_a;
    jobs.extend(stage_b);
    jobs.sort_by_key(|job| job.priority);
    jobs.truncate(max_jobs);
    jobs
}
