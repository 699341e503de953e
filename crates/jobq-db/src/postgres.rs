//! PostgreSQL record store.
//!
//! Conditional updates are single `UPDATE ... WHERE id = $1 AND <predicate>`
//! statements. PostgreSQL re-checks the predicate after taking the row lock,
//! so two concurrent claims on one row cannot both apply.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{
    Job, JobFilter, JobId, JobMeta, JobOrder, JobPatch, JobQuery, JobStore, StoreResult, WriteOp,
    WriteOutcome,
};
use sqlx::postgres::PgExecutor;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;

use crate::{DbError, DbResult};

const COLUMNS: &str = "id, worker_name, active, payload, failed_attempts, errors, attempts, \
                       created, failed, timeout, priority, is_deleted, status";

/// A job row as stored in the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    worker_name: String,
    active: bool,
    payload: serde_json::Value,
    failed_attempts: i32,
    errors: Vec<String>,
    attempts: i32,
    created: DateTime<Utc>,
    failed: String,
    timeout: i64,
    priority: i32,
    is_deleted: bool,
    status: String,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| DbError::InvalidRow(format!("job {}: {}", row.id, e)))?;
        let failed_attempts = u32::try_from(row.failed_attempts).map_err(|_| {
            DbError::InvalidRow(format!(
                "job {}: negative failed_attempts {}",
                row.id, row.failed_attempts
            ))
        })?;
        Ok(Job {
            id: JobId::from(row.id),
            worker_name: row.worker_name,
            active: row.active,
            payload: row.payload,
            meta_data: JobMeta {
                failed_attempts,
                errors: row.errors,
            },
            attempts: row.attempts,
            created: row.created,
            failed: row.failed,
            timeout: row.timeout,
            priority: row.priority,
            is_deleted: row.is_deleted,
            status,
        })
    }
}

/// PostgreSQL implementation of JobStore.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn transactionally(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<WriteOutcome>> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            // Dropping `tx` on error rolls the whole batch back.
            outcomes.push(apply_op(&mut tx, op).await?);
        }
        tx.commit().await.map_err(DbError::from)?;
        Ok(outcomes)
    }

    async fn insert(&self, job: &Job) -> StoreResult<()> {
        Ok(insert_row(&self.pool, job).await?)
    }

    async fn conditional_update(
        &self,
        id: &JobId,
        predicate: &JobFilter,
        patch: &JobPatch,
    ) -> StoreResult<Option<Job>> {
        Ok(conditional_update_row(&self.pool, id, predicate, patch).await?)
    }

    async fn update_where(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
        Ok(update_where_rows(&self.pool, filter, patch).await?)
    }

    async fn query(&self, query: &JobQuery) -> StoreResult<Vec<Job>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder.push(COLUMNS).push(" FROM jobs");
        push_filter(&mut builder, &query.filter);
        builder.push(order_clause(query.order));
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(jobs)
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs");
        push_filter(&mut builder, filter);
        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count as u64)
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        Ok(delete_row(&self.pool, id).await?)
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM jobs")
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    fn has_atomic_claim(&self) -> bool {
        true
    }

    /// Claim with `FOR UPDATE SKIP LOCKED`, so concurrent claimers skip rows
    /// another transaction is already claiming instead of waiting on them.
    async fn claim_first(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<Option<Job>> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE jobs SET ");
        push_patch(&mut builder, patch);
        builder.push(" WHERE id = (SELECT id FROM jobs");
        push_filter(&mut builder, filter);
        builder.push(order_clause(JobOrder::Claim));
        builder.push(" LIMIT 1 FOR UPDATE SKIP LOCKED) RETURNING ");
        builder.push(COLUMNS);

        let row = builder
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(row.map(Job::try_from).transpose()?)
    }
}

async fn apply_op(tx: &mut Transaction<'_, Postgres>, op: WriteOp) -> DbResult<WriteOutcome> {
    let outcome = match op {
        WriteOp::Insert(job) => {
            insert_row(&mut **tx, &job).await?;
            WriteOutcome::Inserted
        }
        WriteOp::ConditionalUpdate {
            id,
            predicate,
            patch,
        } => WriteOutcome::Updated(conditional_update_row(&mut **tx, &id, &predicate, &patch).await?),
        WriteOp::UpdateWhere { filter, patch } => {
            WriteOutcome::Affected(update_where_rows(&mut **tx, &filter, &patch).await?)
        }
        WriteOp::Delete(id) => WriteOutcome::Deleted(delete_row(&mut **tx, &id).await?),
    };
    Ok(outcome)
}

async fn insert_row<'e, E: PgExecutor<'e>>(executor: E, job: &Job) -> DbResult<()> {
    let failed_attempts = i32::try_from(job.meta_data.failed_attempts).map_err(|_| {
        DbError::InvalidRow(format!(
            "job {}: failed_attempts {} out of range",
            job.id, job.meta_data.failed_attempts
        ))
    })?;
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (id, worker_name, active, payload, failed_attempts, errors, attempts,
                          created, failed, timeout, priority, is_deleted, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(job.id.as_str())
    .bind(&job.worker_name)
    .bind(job.active)
    .bind(&job.payload)
    .bind(failed_attempts)
    .bind(&job.meta_data.errors)
    .bind(job.attempts)
    .bind(job.created)
    .bind(&job.failed)
    .bind(job.timeout)
    .bind(job.priority)
    .bind(job.is_deleted)
    .bind(job.status.as_str())
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            Err(DbError::Duplicate(job.id.clone()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn conditional_update_row<'e, E: PgExecutor<'e>>(
    executor: E,
    id: &JobId,
    predicate: &JobFilter,
    patch: &JobPatch,
) -> DbResult<Option<Job>> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE jobs SET ");
    push_patch(&mut builder, patch);
    push_filter(&mut builder, &predicate.clone().with_id(id));
    builder.push(" RETURNING ").push(COLUMNS);

    let row = builder
        .build_query_as::<JobRow>()
        .fetch_optional(executor)
        .await?;
    if row.is_none() {
        debug!(job_id = %id, "Conditional update did not apply");
    }
    row.map(Job::try_from).transpose()
}

async fn update_where_rows<'e, E: PgExecutor<'e>>(
    executor: E,
    filter: &JobFilter,
    patch: &JobPatch,
) -> DbResult<u64> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE jobs SET ");
    push_patch(&mut builder, patch);
    push_filter(&mut builder, filter);
    let result = builder.build().execute(executor).await?;
    Ok(result.rows_affected())
}

async fn delete_row<'e, E: PgExecutor<'e>>(executor: E, id: &JobId) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id.as_str())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    builder.push(" WHERE TRUE");
    if let Some(id) = &filter.id {
        builder.push(" AND id = ").push_bind(id.as_str().to_string());
    }
    if let Some(pattern) = &filter.id_like {
        builder.push(" AND id LIKE ").push_bind(pattern.clone());
    }
    if let Some(worker_name) = &filter.worker_name {
        builder
            .push(" AND worker_name = ")
            .push_bind(worker_name.clone());
    }
    if let Some(active) = filter.active {
        builder.push(" AND active = ").push_bind(active);
    }
    match filter.failed {
        Some(true) => {
            builder.push(" AND failed <> ''");
        }
        Some(false) => {
            builder.push(" AND failed = ''");
        }
        None => {}
    }
    if let Some(is_deleted) = filter.is_deleted {
        builder.push(" AND is_deleted = ").push_bind(is_deleted);
    }
}

fn push_patch(builder: &mut QueryBuilder<'_, Postgres>, patch: &JobPatch) {
    if patch.is_empty() {
        builder.push("id = id");
        return;
    }

    let mut set = builder.separated(", ");
    if let Some(active) = patch.active {
        set.push("active = ");
        set.push_bind_unseparated(active);
    }
    if let Some(failed) = &patch.failed {
        set.push("failed = ");
        set.push_bind_unseparated(failed.clone());
    }
    if let Some(status) = patch.status {
        set.push("status = ");
        set.push_bind_unseparated(status.as_str());
    }
    if let Some(is_deleted) = patch.is_deleted {
        set.push("is_deleted = ");
        set.push_bind_unseparated(is_deleted);
    }
    if let Some(message) = &patch.append_error {
        set.push("failed_attempts = failed_attempts + 1");
        set.push("errors = array_append(errors, ");
        set.push_bind_unseparated(message.clone());
        set.push_unseparated("::text)");
    }
}

fn order_clause(order: JobOrder) -> &'static str {
    match order {
        JobOrder::Unordered => "",
        JobOrder::Claim => " ORDER BY priority DESC, created ASC, id COLLATE \"C\" ASC",
        JobOrder::CreatedAsc => " ORDER BY created ASC, id COLLATE \"C\" ASC",
    }
}
