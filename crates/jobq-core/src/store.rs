//! Record store contract.
//!
//! The queue engine never touches storage directly. It talks to a
//! [`JobStore`] in terms of filters, patches and ordered queries, and relies
//! on [`JobStore::conditional_update`] for race-free claiming.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ordering::{created_order, sort_for_claim};
use crate::pattern::like_match;
use crate::{Job, JobId, JobStatus, StoreResult};

/// Conjunction of optional predicates over a job record.
///
/// `None` fields do not constrain. `JobFilter::default()` matches every
/// record, deleted or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub id: Option<JobId>,
    /// `LIKE` pattern over the id.
    pub id_like: Option<String>,
    pub worker_name: Option<String>,
    pub active: Option<bool>,
    /// `Some(true)` requires a failure reason, `Some(false)` requires none.
    pub failed: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl JobFilter {
    /// Matches every record, including soft-deleted ones.
    pub fn any() -> Self {
        Self::default()
    }

    /// Records not soft-deleted.
    pub fn live() -> Self {
        Self {
            is_deleted: Some(false),
            ..Self::default()
        }
    }

    /// Records that may be claimed.
    pub fn eligible() -> Self {
        Self {
            active: Some(false),
            failed: Some(false),
            is_deleted: Some(false),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &JobId) -> Self {
        self.id = Some(id.clone());
        self
    }

    pub fn with_id_like(mut self, pattern: impl Into<String>) -> Self {
        self.id_like = Some(pattern.into());
        self
    }

    pub fn with_worker(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_failed(mut self, failed: bool) -> Self {
        self.failed = Some(failed);
        self
    }

    pub fn with_deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = Some(is_deleted);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.id.as_ref().is_none_or(|id| *id == job.id)
            && self
                .id_like
                .as_deref()
                .is_none_or(|p| like_match(p, job.id.as_str()))
            && self
                .worker_name
                .as_deref()
                .is_none_or(|w| w == job.worker_name)
            && self.active.is_none_or(|a| a == job.active)
            && self.failed.is_none_or(|f| f == job.is_failed())
            && self.is_deleted.is_none_or(|d| d == job.is_deleted)
    }
}

/// Field updates applied to a record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPatch {
    pub active: Option<bool>,
    pub failed: Option<String>,
    pub status: Option<JobStatus>,
    pub is_deleted: Option<bool>,
    /// Bumps `meta_data.failed_attempts` and appends this message.
    pub append_error: Option<String>,
}

impl JobPatch {
    /// Transition an eligible job to claimed.
    pub fn claim() -> Self {
        Self {
            active: Some(true),
            status: Some(JobStatus::Processing),
            ..Self::default()
        }
    }

    /// Record a failure reason.
    pub fn fail(reason: &str) -> Self {
        Self {
            failed: Some(reason.to_string()),
            status: Some(JobStatus::Failed),
            append_error: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Release a claimed job after a failed run that still has attempts left.
    /// The job becomes eligible again.
    pub fn retry(reason: &str) -> Self {
        Self {
            active: Some(false),
            status: Some(JobStatus::Idle),
            append_error: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Also clear `active`.
    pub fn released(mut self) -> Self {
        self.active = Some(false);
        self
    }

    /// Successful run: record it as finished and tombstone it in one write.
    pub fn finish() -> Self {
        Self {
            active: Some(false),
            status: Some(JobStatus::Finished),
            is_deleted: Some(true),
            ..Self::default()
        }
    }

    /// Take a running job back without recording a failure.
    pub fn cancel() -> Self {
        Self {
            active: Some(false),
            status: Some(JobStatus::Cancelled),
            ..Self::default()
        }
    }

    /// Set the soft-delete tombstone.
    pub fn tombstone() -> Self {
        Self {
            is_deleted: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.failed.is_none()
            && self.status.is_none()
            && self.is_deleted.is_none()
            && self.append_error.is_none()
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(active) = self.active {
            job.active = active;
        }
        if let Some(failed) = &self.failed {
            job.failed = failed.clone();
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(is_deleted) = self.is_deleted {
            job.is_deleted = is_deleted;
        }
        if let Some(message) = &self.append_error {
            job.meta_data.record_failure(message);
        }
    }
}

/// Result ordering for a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOrder {
    /// Store order.
    #[default]
    Unordered,
    /// Priority descending, created ascending.
    Claim,
    /// Created ascending.
    CreatedAsc,
}

impl JobOrder {
    /// Sort a result set in memory.
    pub fn sort(&self, jobs: &mut [Job]) {
        match self {
            JobOrder::Unordered => {}
            JobOrder::Claim => sort_for_claim(jobs),
            JobOrder::CreatedAsc => jobs.sort_by(created_order),
        }
    }
}

/// A projection read: filter, order, optional limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub filter: JobFilter,
    pub order: JobOrder,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new(filter: JobFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn ordered(mut self, order: JobOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single write inside [`JobStore::transactionally`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Job),
    ConditionalUpdate {
        id: JobId,
        predicate: JobFilter,
        patch: JobPatch,
    },
    UpdateWhere {
        filter: JobFilter,
        patch: JobPatch,
    },
    Delete(JobId),
}

/// Outcome of one [`WriteOp`], in the same position as its op.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    /// The updated record, or `None` if the predicate did not hold.
    Updated(Option<Job>),
    Affected(u64),
    Deleted(bool),
}

/// Durable keyed storage for job records.
///
/// Every method is atomic on its own. Multi-record atomicity goes through
/// [`JobStore::transactionally`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Apply every op against one isolated view and commit them together.
    /// The first failing op rolls back the whole batch.
    async fn transactionally(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<WriteOutcome>>;

    /// Insert a new record. Fails with `StoreError::Duplicate` if the id exists.
    async fn insert(&self, job: &Job) -> StoreResult<()>;

    /// Apply `patch` to the record `id` iff it currently satisfies
    /// `predicate`. Returns the updated record, or `None` if the record is
    /// absent or the predicate did not hold.
    async fn conditional_update(
        &self,
        id: &JobId,
        predicate: &JobFilter,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>>;

    /// Apply `patch` to every record matching `filter`. Returns rows affected.
    async fn update_where(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64>;

    async fn query(&self, query: &JobQuery) -> StoreResult<Vec<Job>>;

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64>;

    /// Hard delete. Store maintenance only.
    async fn delete(&self, id: &JobId) -> StoreResult<bool>;

    /// Hard delete everything. Store maintenance only.
    async fn delete_all(&self) -> StoreResult<u64>;

    /// Whether [`JobStore::claim_first`] is a native single-statement claim.
    fn has_atomic_claim(&self) -> bool {
        false
    }

    /// Patch and return the first record matching `filter` in claim order,
    /// as one atomic statement.
    async fn claim_first(&self, _filter: &JobFilter, _patch: &JobPatch) -> StoreResult<Option<Job>> {
        Err(crate::StoreError::Unsupported("claim_first"))
    }
}
