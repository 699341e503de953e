//! Job queue engine.
//!
//! The engine keeps no state of its own beyond configuration. Every claim is
//! a conditional update against the store: a candidate only becomes ours if
//! the store confirms it was still eligible at the moment of the write.

use std::collections::HashSet;
use std::sync::Arc;

use jobq_config::EngineConfig;
use jobq_core::{
    Job, JobFilter, JobId, JobOrder, JobPatch, JobQuery, JobStore, PinPolicy, StoreError, WriteOp,
};
use tracing::{debug, info};

use crate::{QueueError, QueueResult};

/// Priority-ordered job queue over a shared record store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    pin_policy: PinPolicy,
    claim_window: usize,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, &EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            pin_policy: config.pin_policy,
            claim_window: config.claim_window.max(1),
        }
    }

    pub fn pin_policy(&self) -> PinPolicy {
        self.pin_policy
    }

    /// Enqueue a new job.
    pub async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        match self.store.insert(&job).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    worker = %job.worker_name,
                    priority = job.priority,
                    "Enqueued job"
                );
                Ok(job.id)
            }
            Err(StoreError::Duplicate(id)) => Err(QueueError::DuplicateId(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue several jobs in one transaction. Either all are inserted or none.
    pub async fn enqueue_batch(&self, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if !seen.insert(&job.id) {
                return Err(QueueError::DuplicateId(job.id.clone()));
            }
        }

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id.clone()).collect();
        let ops = jobs.into_iter().map(WriteOp::Insert).collect();
        match self.store.transactionally(ops).await {
            Ok(_) => {
                info!(count = ids.len(), "Enqueued job batch");
                Ok(ids)
            }
            Err(StoreError::Duplicate(id)) => Err(QueueError::DuplicateId(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the next eligible job from the unscoped pool.
    ///
    /// Reads a window of candidates in claim order and tries to flip each one
    /// to active with a conditional update. A candidate taken by someone else
    /// in between is skipped. Returns `None` once nothing eligible remains.
    pub async fn claim_next(&self) -> QueueResult<Option<Job>> {
        let pool = self.pin_policy.unscoped_pool();
        let patch = JobPatch::claim();

        if self.store.has_atomic_claim() {
            let claimed = self.store.claim_first(&pool, &patch).await?;
            if let Some(job) = &claimed {
                info!(job_id = %job.id, priority = job.priority, "Claimed job");
            }
            return Ok(claimed);
        }

        let window = JobQuery::new(pool.clone())
            .ordered(JobOrder::Claim)
            .limit(self.claim_window);

        loop {
            let candidates = self.store.query(&window).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in &candidates {
                if let Some(job) = self
                    .store
                    .conditional_update(&candidate.id, &pool, &patch)
                    .await?
                {
                    info!(job_id = %job.id, priority = job.priority, "Claimed job");
                    return Ok(Some(job));
                }
                debug!(job_id = %candidate.id, "Lost claim race");
            }
            // Every candidate in the window went to other claimers; re-read.
        }
    }

    /// Preview up to `limit` eligible jobs pinned to `worker_name`, in claim
    /// order. Nothing is claimed; use [`JobQueue::claim`] per job for that.
    pub async fn claim_next_for_worker(
        &self,
        worker_name: &str,
        limit: i64,
    ) -> QueueResult<Vec<Job>> {
        if limit < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "limit must not be negative, got {}",
                limit
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = JobQuery::new(JobFilter::eligible().with_worker(worker_name))
            .ordered(JobOrder::Claim)
            .limit(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(self.store.query(&query).await?)
    }

    /// Claim one specific job.
    ///
    /// Returns `None` if the job exists but is no longer eligible, and
    /// `NotFound` if it is absent or soft-deleted.
    pub async fn claim(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let claimed = self
            .store
            .conditional_update(id, &JobFilter::eligible(), &JobPatch::claim())
            .await?;

        match claimed {
            Some(job) => {
                info!(job_id = %job.id, priority = job.priority, "Claimed job");
                Ok(Some(job))
            }
            None if self.get(id).await?.is_some() => {
                debug!(job_id = %id, "Job not eligible for claim");
                Ok(None)
            }
            None => Err(QueueError::NotFound(id.clone())),
        }
    }

    /// Mark a job failed. Works whether or not the job is active.
    pub async fn mark_failed(&self, id: &JobId, reason: &str) -> QueueResult<Job> {
        if reason.is_empty() {
            return Err(QueueError::InvalidArgument(
                "failure reason must not be empty".to_string(),
            ));
        }

        let job = self
            .store
            .conditional_update(id, &JobFilter::live(), &JobPatch::fail(reason))
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        info!(job_id = %id, reason, "Marked job failed");
        Ok(job)
    }

    /// Record a failed run of a claimed job and release it.
    ///
    /// Bumps `meta_data` every time. While attempts remain the job becomes
    /// eligible again; the run that uses up `attempts` marks it failed.
    /// Returns `None` if the job is no longer active (cancelled meanwhile).
    pub async fn record_failure(&self, id: &JobId, reason: &str) -> QueueResult<Option<Job>> {
        if reason.is_empty() {
            return Err(QueueError::InvalidArgument(
                "failure reason must not be empty".to_string(),
            ));
        }

        let current = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let exhausted = current.is_last_attempt();
        let patch = if exhausted {
            JobPatch::fail(reason).released()
        } else {
            JobPatch::retry(reason)
        };

        let updated = self
            .store
            .conditional_update(id, &JobFilter::live().with_active(true), &patch)
            .await?;
        match &updated {
            Some(job) if exhausted => {
                info!(job_id = %id, reason, attempts = job.attempts, "Job failed permanently");
            }
            Some(job) => {
                info!(
                    job_id = %id,
                    reason,
                    failed_attempts = job.meta_data.failed_attempts,
                    attempts = job.attempts,
                    "Job released for retry"
                );
            }
            None => debug!(job_id = %id, "Failure not recorded, job no longer active"),
        }
        Ok(updated)
    }

    /// Finish a claimed job: status `finished` plus the tombstone, in one write.
    ///
    /// Returns false if the job is live but no longer active.
    pub async fn complete(&self, id: &JobId) -> QueueResult<bool> {
        let finished = self
            .store
            .conditional_update(id, &JobFilter::live().with_active(true), &JobPatch::finish())
            .await?;
        if finished.is_some() {
            info!(job_id = %id, "Job finished");
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(QueueError::NotFound(id.clone())),
        }
    }

    /// Take an active job back into the pool with status `cancelled`.
    ///
    /// Returns `None` if the job exists but is not active, `NotFound` if it is
    /// absent or soft-deleted. A handler already running is not interrupted;
    /// its outcome is discarded.
    pub async fn cancel(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let cancelled = self
            .store
            .conditional_update(id, &JobFilter::live().with_active(true), &JobPatch::cancel())
            .await?;
        match cancelled {
            Some(job) => {
                info!(job_id = %id, "Cancelled job");
                Ok(Some(job))
            }
            None if self.get(id).await?.is_some() => Ok(None),
            None => Err(QueueError::NotFound(id.clone())),
        }
    }

    /// Cancel every active job. Returns rows affected.
    pub async fn cancel_all_active(&self) -> QueueResult<u64> {
        let affected = self
            .store
            .update_where(&JobFilter::live().with_active(true), &JobPatch::cancel())
            .await?;
        info!(affected, "Cancelled active jobs");
        Ok(affected)
    }

    /// Soft-delete a job. Deleting an already-deleted job succeeds.
    pub async fn soft_delete(&self, id: &JobId) -> QueueResult<()> {
        self.store
            .conditional_update(id, &JobFilter::any(), &JobPatch::tombstone())
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        info!(job_id = %id, "Soft-deleted job");
        Ok(())
    }

    /// Soft-delete every job pinned to `worker_name`. Returns rows affected.
    pub async fn soft_delete_all_for_worker(&self, worker_name: &str) -> QueueResult<u64> {
        let affected = self
            .store
            .update_where(
                &JobFilter::any().with_worker(worker_name),
                &JobPatch::tombstone(),
            )
            .await?;
        info!(worker = %worker_name, affected, "Soft-deleted worker jobs");
        Ok(affected)
    }

    /// Fetch a live job by id.
    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let query = JobQuery::new(JobFilter::live().with_id(id)).limit(1);
        Ok(self.store.query(&query).await?.into_iter().next())
    }

    /// Number of live jobs.
    pub async fn count(&self) -> QueueResult<u64> {
        Ok(self.store.count(&JobFilter::live()).await?)
    }

    /// Permanently remove one record. Store maintenance only.
    pub async fn purge(&self, id: &JobId) -> QueueResult<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(job_id = %id, "Purged job");
        }
        Ok(removed)
    }

    /// Permanently remove every record. Store maintenance only.
    pub async fn purge_all(&self) -> QueueResult<u64> {
        let removed = self.store.delete_all().await?;
        info!(removed, "Purged all jobs");
        Ok(removed)
    }

    // Query surface. All reads are single store queries.

    /// Live jobs in store order.
    pub async fn list_all(&self) -> QueueResult<Vec<Job>> {
        self.list(JobFilter::live(), JobOrder::Unordered).await
    }

    /// Live jobs in claim order.
    pub async fn list_ordered(&self) -> QueueResult<Vec<Job>> {
        self.list(JobFilter::live(), JobOrder::Claim).await
    }

    /// Every job, soft-deleted included, in claim order.
    pub async fn list_ordered_including_deleted(&self) -> QueueResult<Vec<Job>> {
        self.list(JobFilter::any(), JobOrder::Claim).await
    }

    /// Live jobs currently claimed.
    pub async fn list_active(&self) -> QueueResult<Vec<Job>> {
        self.list(JobFilter::live().with_active(true), JobOrder::Unordered)
            .await
    }

    /// Exact id lookup, excluding soft-deleted jobs.
    pub async fn find_by_id(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.get(id).await
    }

    /// `LIKE` style id lookup (`%`, `_`, `\` escapes), excluding soft-deleted
    /// jobs, in claim order.
    pub async fn find_by_pattern(&self, pattern: &str) -> QueueResult<Vec<Job>> {
        self.list(JobFilter::live().with_id_like(pattern), JobOrder::Claim)
            .await
    }

    /// Up to `limit` unclaimed, unfailed jobs pinned to `worker_name`,
    /// soft-deleted ones included, in claim order.
    pub async fn list_for_worker_including_deleted(
        &self,
        worker_name: &str,
        limit: i64,
    ) -> QueueResult<Vec<Job>> {
        if limit < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "limit must not be negative, got {}",
                limit
            )));
        }
        let filter = JobFilter::any()
            .with_worker(worker_name)
            .with_active(false)
            .with_failed(false);
        let query = JobQuery::new(filter)
            .ordered(JobOrder::Claim)
            .limit(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(self.store.query(&query).await?)
    }

    /// The oldest live job currently claimed, if any.
    pub async fn work_in_progress(&self) -> QueueResult<Option<Job>> {
        let query = JobQuery::new(JobFilter::live().with_active(true))
            .ordered(JobOrder::CreatedAsc)
            .limit(1);
        Ok(self.store.query(&query).await?.into_iter().next())
    }

    async fn list(&self, filter: JobFilter, order: JobOrder) -> QueueResult<Vec<Job>> {
        Ok(self.store.query(&JobQuery::new(filter).ordered(order)).await?)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.store.name())
            .field("pin_policy", &self.pin_policy)
            .field("claim_window", &self.claim_window)
            .finish()
    }
}
