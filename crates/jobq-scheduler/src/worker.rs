//! Worker that processes jobs from the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use jobq_config::WorkerConfig;
use jobq_core::Job;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::JobQueue;
use crate::{QueueError, QueueResult};

/// Executes the work a job describes.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. An `Err` carries the failure reason recorded on the job.
    async fn handle(&self, job: &Job) -> Result<(), String>;
}

/// A worker that claims and executes jobs.
///
/// A named worker only takes jobs pinned to its name. An unnamed worker
/// takes whatever `claim_next` hands out under the queue's pin policy.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            config,
            queue,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Claim up to one batch of jobs and run them to completion.
    /// Returns how many jobs were claimed.
    pub async fn poll_once(&self) -> QueueResult<usize> {
        let jobs = self.claim_batch().await?;
        let claimed = jobs.len();

        let results = join_all(jobs.iter().map(|job| self.execute(job))).await;
        for result in results {
            result?;
        }
        Ok(claimed)
    }

    /// Run the worker loop until `shutdown` is cancelled. A batch in flight
    /// always runs to completion first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.config.name, "Starting worker");

        while !shutdown.is_cancelled() {
            let delay = match self.poll_once().await {
                Ok(0) => Some(self.config.poll_interval),
                Ok(claimed) => {
                    debug!(worker = %self.config.name, claimed, "Processed batch");
                    None
                }
                Err(e) => {
                    warn!(worker = %self.config.name, error = %e, "Failed to process jobs");
                    Some(self.config.error_backoff)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        info!(worker = %self.config.name, "Worker stopped");
    }

    async fn claim_batch(&self) -> QueueResult<Vec<Job>> {
        let mut claimed = Vec::with_capacity(self.config.batch);

        if self.config.name.is_empty() {
            while claimed.len() < self.config.batch {
                match self.queue.claim_next().await? {
                    Some(job) => claimed.push(job),
                    None => break,
                }
            }
            return Ok(claimed);
        }

        let limit = i64::try_from(self.config.batch).unwrap_or(i64::MAX);
        let candidates = self
            .queue
            .claim_next_for_worker(&self.config.name, limit)
            .await?;
        for candidate in candidates {
            match self.queue.claim(&candidate.id).await {
                Ok(Some(job)) => claimed.push(job),
                Ok(None) | Err(QueueError::NotFound(_)) => {
                    debug!(job_id = %candidate.id, "Candidate taken before claim");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }

    async fn execute(&self, job: &Job) -> QueueResult<()> {
        let outcome = if job.timeout > 0 {
            let limit = Duration::from_millis(job.timeout.unsigned_abs());
            match timeout(limit, self.handler.handle(job)).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}ms", job.timeout)),
            }
        } else {
            self.handler.handle(job).await
        };

        let recorded = match outcome {
            Ok(()) => self.queue.complete(&job.id).await?,
            Err(reason) => {
                let reason = if reason.is_empty() {
                    "handler failed without a reason".to_string()
                } else {
                    reason
                };
                warn!(job_id = %job.id, reason = %reason, "Job run failed");
                self.queue.record_failure(&job.id, &reason).await?.is_some()
            }
        };
        if !recorded {
            debug!(job_id = %job.id, "Job cancelled while running, outcome discarded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{
        JobFilter, JobId, JobPatch, JobQuery, JobStatus, JobStore, StoreResult, WriteOp,
        WriteOutcome,
    };
    use jobq_db::MemoryJobStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Handler that records every job it sees and fails payloads carrying `"fail"`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<(), String> {
            self.seen.lock().unwrap().push(job.id.to_string());
            if let Some(ms) = job.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
                sleep(Duration::from_millis(ms)).await;
            }
            match job.payload.get("fail").and_then(|v| v.as_str()) {
                Some(reason) => Err(reason.to_string()),
                None => Ok(()),
            }
        }
    }

    fn setup() -> (Arc<JobQueue>, Arc<Recorder>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new())));
        (queue, Arc::new(Recorder::default()))
    }

    fn worker(name: &str, batch: usize, queue: &Arc<JobQueue>, handler: &Arc<Recorder>) -> Worker {
        let mut config = WorkerConfig::new(name);
        config.batch = batch;
        config.poll_interval = Duration::from_millis(10);
        config.error_backoff = Duration::from_millis(10);
        Worker::new(config, queue.clone(), handler.clone())
    }

    async fn all_jobs(queue: &JobQueue) -> Vec<Job> {
        queue.list_ordered_including_deleted().await.unwrap()
    }

    #[tokio::test]
    async fn test_success_finishes_job() {
        let (queue, handler) = setup();
        let id = queue.enqueue(Job::builder("").id("ok").build()).await.unwrap();

        let worker = worker("", 1, &queue, &handler);
        assert_eq!(worker.poll_once().await.unwrap(), 1);

        assert!(queue.get(&id).await.unwrap().is_none());
        let jobs = all_jobs(&queue).await;
        assert!(jobs[0].is_deleted);
        assert!(!jobs[0].active);
        assert_eq!(jobs[0].status, JobStatus::Finished);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["ok"]);

        assert_eq!(worker.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_marks_job_failed() {
        let (queue, handler) = setup();
        let id = queue
            .enqueue(
                Job::builder("")
                    .id("bad")
                    .payload(serde_json::json!({ "fail": "boom" }))
                    .build(),
            )
            .await
            .unwrap();

        let worker = worker("", 1, &queue, &handler);
        assert_eq!(worker.poll_once().await.unwrap(), 1);

        let job = queue.get(&id).await.unwrap().unwrap();
        assert!(!job.active);
        assert_eq!(job.failed, "boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.meta_data.errors, vec!["boom"]);
        assert!(queue.list_active().await.unwrap().is_empty());
        assert!(queue.work_in_progress().await.unwrap().is_none());

        // Failed jobs are not retried.
        assert_eq!(worker.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_job_is_retried_up_to_attempts() {
        let (queue, handler) = setup();
        let id = queue
            .enqueue(
                Job::builder("")
                    .id("flaky")
                    .attempts(3)
                    .payload(serde_json::json!({ "fail": "boom" }))
                    .build(),
            )
            .await
            .unwrap();
        let worker = worker("", 1, &queue, &handler);

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert!(!job.active);
        assert!(job.is_eligible());
        assert_eq!(job.meta_data.failed_attempts, 1);
        assert!(queue.list_active().await.unwrap().is_empty());

        assert_eq!(worker.poll_once().await.unwrap(), 1);
        assert_eq!(worker.poll_once().await.unwrap(), 1);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert!(!job.active);
        assert_eq!(job.failed, "boom");
        assert_eq!(job.meta_data.failed_attempts, 3);

        assert_eq!(worker.poll_once().await.unwrap(), 0);
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_outcome_is_discarded() {
        let (queue, handler) = setup();
        let id = queue
            .enqueue(
                Job::builder("")
                    .id("long")
                    .payload(serde_json::json!({ "sleep_ms": 200 }))
                    .build(),
            )
            .await
            .unwrap();
        let worker = Arc::new(worker("", 1, &queue, &handler));

        let polling = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.poll_once().await })
        };
        timeout(Duration::from_secs(5), async {
            while queue.list_active().await.unwrap().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        queue.cancel(&id).await.unwrap().unwrap();

        assert_eq!(polling.await.unwrap().unwrap(), 1);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert!(!job.is_deleted);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.is_eligible());
    }

    #[tokio::test]
    async fn test_timeout_marks_job_failed() {
        let (queue, handler) = setup();
        let id = queue
            .enqueue(
                Job::builder("")
                    .id("slow")
                    .timeout(20)
                    .payload(serde_json::json!({ "sleep_ms": 2000 }))
                    .build(),
            )
            .await
            .unwrap();

        let worker = worker("", 1, &queue, &handler);
        worker.poll_once().await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert!(job.failed.contains("timed out"));
        assert!(!job.active);
    }

    #[tokio::test]
    async fn test_named_worker_only_takes_its_jobs() {
        let (queue, handler) = setup();
        queue.enqueue(Job::builder("alice").id("a1").priority(1).build()).await.unwrap();
        queue.enqueue(Job::builder("alice").id("a2").priority(2).build()).await.unwrap();
        queue.enqueue(Job::builder("alice").id("a3").priority(0).build()).await.unwrap();
        queue.enqueue(Job::builder("bob").id("b1").build()).await.unwrap();
        queue.enqueue(Job::builder("").id("open").build()).await.unwrap();

        let alice = worker("alice", 2, &queue, &handler);
        assert_eq!(alice.poll_once().await.unwrap(), 2);
        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2"]);

        assert_eq!(alice.poll_once().await.unwrap(), 1);
        assert_eq!(alice.poll_once().await.unwrap(), 0);

        let live: Vec<_> = queue
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(live, vec![JobId::from("b1"), JobId::from("open")]);
    }

    #[tokio::test]
    async fn test_unnamed_worker_batch() {
        let (queue, handler) = setup();
        for i in 0..5 {
            queue
                .enqueue(Job::builder("").id(format!("j{}", i)).priority(i).build())
                .await
                .unwrap();
        }

        let worker = worker("", 3, &queue, &handler);
        assert_eq!(worker.poll_once().await.unwrap(), 3);
        assert_eq!(worker.poll_once().await.unwrap(), 2);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let (queue, handler) = setup();
        for i in 0..4 {
            queue
                .enqueue(Job::builder("").id(format!("r{}", i)).build())
                .await
                .unwrap();
        }

        let worker = Arc::new(worker("", 1, &queue, &handler));
        let shutdown = CancellationToken::new();
        let running = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        timeout(Duration::from_secs(5), async {
            while queue.count().await.unwrap() > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_run_returns_when_already_cancelled() {
        let (queue, handler) = setup();
        queue.enqueue(Job::builder("idle").id("left").build()).await.unwrap();
        let worker = worker("idle", 1, &queue, &handler);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        timeout(Duration::from_secs(5), worker.run(shutdown)).await.unwrap();
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_cancel() {
        let (queue, handler) = setup();
        let mut config = WorkerConfig::new("idle");
        config.poll_interval = Duration::from_secs(3600);
        let worker = Worker::new(config, queue, handler);
        let shutdown = CancellationToken::new();

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        timeout(Duration::from_secs(5), worker.run(shutdown)).await.unwrap();
    }

    /// What a rival does to the first previewed candidate before our claim.
    #[derive(Clone, Copy)]
    enum Rival {
        Claims,
        Deletes,
    }

    /// Store that lets a rival act between a worker's preview and its claim, once.
    struct RivalStore {
        inner: MemoryJobStore,
        rival: Rival,
        pending: AtomicBool,
    }

    #[async_trait]
    impl JobStore for RivalStore {
        fn name(&self) -> &'static str {
            "rival"
        }

        async fn transactionally(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<WriteOutcome>> {
            self.inner.transactionally(ops).await
        }

        async fn insert(&self, job: &Job) -> StoreResult<()> {
            self.inner.insert(job).await
        }

        async fn conditional_update(
            &self,
            id: &JobId,
            predicate: &JobFilter,
            patch: &JobPatch,
        ) -> StoreResult<Option<Job>> {
            self.inner.conditional_update(id, predicate, patch).await
        }

        async fn update_where(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
            self.inner.update_where(filter, patch).await
        }

        async fn query(&self, query: &JobQuery) -> StoreResult<Vec<Job>> {
            let snapshot = self.inner.query(query).await?;
            let is_preview = query.filter.worker_name.is_some();
            if is_preview && self.pending.swap(false, Ordering::SeqCst) {
                if let Some(first) = snapshot.first() {
                    let patch = match self.rival {
                        Rival::Claims => JobPatch::claim(),
                        Rival::Deletes => JobPatch::tombstone(),
                    };
                    self.inner
                        .conditional_update(&first.id, &JobFilter::any(), &patch)
                        .await?;
                }
            }
            Ok(snapshot)
        }

        async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
            self.inner.count(filter).await
        }

        async fn delete(&self, id: &JobId) -> StoreResult<bool> {
            self.inner.delete(id).await
        }

        async fn delete_all(&self) -> StoreResult<u64> {
            self.inner.delete_all().await
        }
    }

    async fn raced_named_worker(rival: Rival) -> (Arc<JobQueue>, Arc<Recorder>, usize) {
        let (_, handler) = setup();
        let store = Arc::new(RivalStore {
            inner: MemoryJobStore::new(),
            rival,
            pending: AtomicBool::new(true),
        });
        let queue = Arc::new(JobQueue::new(store));
        queue
            .enqueue(Job::builder("alice").id("first").priority(9).build())
            .await
            .unwrap();
        queue
            .enqueue(Job::builder("alice").id("second").priority(1).build())
            .await
            .unwrap();

        let claimed = worker("alice", 2, &queue, &handler).poll_once().await.unwrap();
        (queue, handler, claimed)
    }

    #[tokio::test]
    async fn test_named_worker_skips_candidate_claimed_by_rival() {
        let (queue, handler, claimed) = raced_named_worker(Rival::Claims).await;

        assert_eq!(claimed, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["second"]);
        let first = queue.get(&JobId::from("first")).await.unwrap().unwrap();
        assert!(first.active);
    }

    #[tokio::test]
    async fn test_named_worker_skips_candidate_deleted_by_rival() {
        let (queue, handler, claimed) = raced_named_worker(Rival::Deletes).await;

        assert_eq!(claimed, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["second"]);
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
