//! In-process record store.
//!
//! All records live behind one `RwLock`. Writers hold the lock for the whole
//! read-modify-write, which makes every conditional update atomic with
//! respect to every other caller sharing the store.

use async_trait::async_trait;
use jobq_core::{
    Job, JobFilter, JobId, JobPatch, JobQuery, JobStore, StoreError, StoreResult, WriteOp,
    WriteOutcome,
};
use tokio::sync::RwLock;

/// Job store held in memory. Share it between workers with `Arc`.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: RwLock<Rows>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Records in insertion order.
#[derive(Debug, Default, Clone)]
struct Rows {
    jobs: Vec<Job>,
}

impl Rows {
    fn insert(&mut self, job: &Job) -> StoreResult<()> {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        self.jobs.push(job.clone());
        Ok(())
    }

    fn conditional_update(
        &mut self,
        id: &JobId,
        predicate: &JobFilter,
        patch: &JobPatch,
    ) -> Option<Job> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == *id && predicate.matches(j))?;
        patch.apply(job);
        Some(job.clone())
    }

    fn update_where(&mut self, filter: &JobFilter, patch: &JobPatch) -> u64 {
        let mut affected = 0;
        for job in self.jobs.iter_mut().filter(|j| filter.matches(j)) {
            patch.apply(job);
            affected += 1;
        }
        affected
    }

    fn delete(&mut self, id: &JobId) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.id != *id);
        self.jobs.len() != before
    }

    fn apply(&mut self, op: WriteOp) -> StoreResult<WriteOutcome> {
        let outcome = match op {
            WriteOp::Insert(job) => {
                self.insert(&job)?;
                WriteOutcome::Inserted
            }
            WriteOp::ConditionalUpdate {
                id,
                predicate,
                patch,
            } => WriteOutcome::Updated(self.conditional_update(&id, &predicate, &patch)),
            WriteOp::UpdateWhere { filter, patch } => {
                WriteOutcome::Affected(self.update_where(&filter, &patch))
            }
            WriteOp::Delete(id) => WriteOutcome::Deleted(self.delete(&id)),
        };
        Ok(outcome)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn transactionally(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<WriteOutcome>> {
        let mut rows = self.rows.write().await;
        let mut staged = rows.clone();
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            outcomes.push(staged.apply(op)?);
        }
        *rows = staged;
        Ok(outcomes)
    }

    async fn insert(&self, job: &Job) -> StoreResult<()> {
        self.rows.write().await.insert(job)
    }

    async fn conditional_update(
        &self,
        id: &JobId,
        predicate: &JobFilter,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>> {
        Ok(self
            .rows
            .write()
            .await
            .conditional_update(id, predicate, patch))
    }

    async fn update_where(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
        Ok(self.rows.write().await.update_where(filter, patch))
    }

    async fn query(&self, query: &JobQuery) -> StoreResult<Vec<Job>> {
        let rows = self.rows.read().await;
        let mut jobs: Vec<Job> = rows
            .jobs
            .iter()
            .filter(|j| query.filter.matches(j))
            .cloned()
            .collect();
        query.order.sort(&mut jobs);
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        let rows = self.rows.read().await;
        Ok(rows.jobs.iter().filter(|j| filter.matches(j)).count() as u64)
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        Ok(self.rows.write().await.delete(id))
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        let removed = rows.jobs.len() as u64;
        rows.jobs.clear();
        Ok(removed)
    }
}
