//! Worker pool for processing jobs from one queue type.
//!
//! Each worker runs as an independent async task that repeatedly fetches a
//! batch of jobs, executes them one by one through a [`JobHandler`], and
//! settles each job:
//!
//! - success: `completed`, retry counter dropped, acked, session counted
//! - failure below the attempt ceiling: `retrying`, requeued onto the regular
//!   lane, `queued_after_failure`
//! - failure at the ceiling: `failed`, retry counter dropped, acked, session
//!   counted
//!
//! # Features
//!
//! - Configurable number of workers and batch size
//! - Graceful shutdown with broadcast channel
//! - Jobs fetched but not started are handed back on shutdown
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{ClaimedJob, Job, JobState, JobStatus};
use super::queue::QueueError;
use super::session::CleanupOutcome;
use super::status::JobStatusStore;
use super::Scheduler;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// The pool configuration cannot run.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Executes the work a job describes.
///
/// Returning an error (or exceeding the pool's job timeout) counts as one
/// failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, progress: &ProgressReporter) -> anyhow::Result<()>;
}

/// Lets a handler publish intermediate progress for the job it is running.
#[derive(Clone)]
pub struct ProgressReporter {
    statuses: JobStatusStore,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(statuses: JobStatusStore, job_id: impl Into<String>) -> Self {
        Self {
            statuses,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Writes a `processing` status with `progress` percent and a message.
    pub async fn report(&self, progress: u8, message: impl Into<String>) -> Result<(), StoreError> {
        let status = JobStatus::new(&self.job_id, JobState::Processing)
            .with_progress(progress)
            .with_message(message);
        self.statuses.set_status(&status).await
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Queue type the workers consume.
    pub queue_type: String,
    /// Jobs claimed per fetch.
    pub batch_size: usize,
    /// Pause after an empty fetch or a store error.
    pub poll_interval: Duration,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Attempts before a job is marked failed.
    pub max_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_type: "default".to_string(),
            batch_size: 5,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration for the given queue type.
    pub fn new(queue_type: impl Into<String>) -> Self {
        Self {
            queue_type: queue_type.into(),
            ..Default::default()
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig("num_workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(PoolError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(PoolError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed permanently.
    pub jobs_failed: u64,
    /// Total number of failed attempts that were requeued.
    pub jobs_retried: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the number of jobs that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that runs many workers against one queue type.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    scheduler: Scheduler,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(scheduler: Scheduler, handler: Arc<dyn JobHandler>, config: WorkerPoolConfig) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            scheduler,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Jobs left in the processing list by earlier crashed workers are not
    /// touched; see [`QueueManager::recover_processing`](super::QueueManager::recover_processing).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// `PoolError::InvalidConfig` if the configuration cannot run.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("{}-worker-{}", self.config.queue_type, i),
                self.scheduler.clone(),
                Arc::clone(&self.handler),
                self.config.clone(),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.stats),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            queue_type = %self.config.queue_type,
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the job they are executing, hand back any fetched jobs
    /// they have not started, and exit.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue_type = %self.config.queue_type, "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = async move {
            for joined in join_all(handles).await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes jobs from the queue.
pub struct Worker {
    id: String,
    scheduler: Scheduler,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
    shutdown_rx: broadcast::Receiver<()>,
    stopping: bool,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    fn new(
        id: String,
        scheduler: Scheduler,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            scheduler,
            handler,
            config,
            shutdown_rx,
            stopping: false,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Main worker loop.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        while !self.shutdown_requested() {
            let fetched = self
                .scheduler
                .manager()
                .fetch_jobs(&self.config.queue_type, self.config.batch_size)
                .await;

            match fetched {
                Ok(jobs) if jobs.is_empty() => {
                    debug!(worker_id = %self.id, "No jobs available");
                    self.pause().await;
                }
                Ok(jobs) => {
                    self.process_batch(jobs).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch jobs");
                    self.pause().await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs fetched jobs in order, handing back the rest once shutdown starts.
    async fn process_batch(&mut self, jobs: Vec<ClaimedJob>) {
        let mut jobs = jobs.into_iter();

        while let Some(claimed) = jobs.next() {
            if self.shutdown_requested() {
                self.return_unstarted(std::iter::once(claimed).chain(jobs.by_ref()))
                    .await;
                break;
            }
            self.process_job(claimed).await;
        }
    }

    async fn return_unstarted(&self, jobs: impl Iterator<Item = ClaimedJob>) {
        for claimed in jobs {
            match self.scheduler.manager().return_job_to_queue(&claimed).await {
                Ok(_) => debug!(
                    worker_id = %self.id,
                    job_id = %claimed.job().job_id,
                    "Returned unstarted job to queue"
                ),
                Err(e) => error!(
                    worker_id = %self.id,
                    job_id = %claimed.job().job_id,
                    error = %e,
                    "Failed to return unstarted job; it stays in processing"
                ),
            }
        }
    }

    /// Executes one job and settles it.
    async fn process_job(&self, claimed: ClaimedJob) {
        let job = claimed.job();
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job.job_id,
            team_id = %job.team_id,
            session_id = ?job.session_id,
            "Processing job"
        );

        if let Err(e) = self
            .scheduler
            .statuses()
            .set_state(&job.job_id, JobState::Processing)
            .await
        {
            warn!(worker_id = %self.id, job_id = %job.job_id, error = %e, "Failed to write processing status");
        }

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();

        let reporter = ProgressReporter::new(self.scheduler.statuses().clone(), &job.job_id);
        let execution = self.handler.execute(job, &reporter);
        let result = match tokio::time::timeout(self.config.job_timeout, execution).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.config.job_timeout)),
        };
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        match result {
            Ok(()) => self.complete(&claimed, duration).await,
            Err(reason) => self.fail(&claimed, &reason, duration).await,
        }
    }

    async fn complete(&self, claimed: &ClaimedJob, duration: Duration) {
        let job = claimed.job();

        self.write_status(JobStatus::new(&job.job_id, JobState::Completed))
            .await;
        if let Err(e) = self.scheduler.retries().delete(&job.job_id).await {
            warn!(worker_id = %self.id, job_id = %job.job_id, error = %e, "Failed to clear retry counter");
        }
        self.ack(claimed).await;

        self.stats.record_completion(duration);
        self.metrics
            .record_job(&job.queue_type, "completed", duration.as_secs_f64());
        info!(
            worker_id = %self.id,
            job_id = %job.job_id,
            duration_ms = duration.as_millis(),
            "Job completed successfully"
        );

        self.count_toward_session(job).await;
    }

    async fn fail(&self, claimed: &ClaimedJob, reason: &str, duration: Duration) {
        let job = claimed.job();

        let attempts = match self.scheduler.retries().increment(&job.job_id).await {
            Ok(attempts) => attempts,
            Err(e) => {
                // Without a count the job cannot be failed safely; retry it.
                error!(worker_id = %self.id, job_id = %job.job_id, error = %e, "Failed to increment retry counter");
                0
            }
        };

        if attempts < i64::from(self.config.max_attempts) {
            warn!(
                worker_id = %self.id,
                job_id = %job.job_id,
                attempts = attempts,
                max_attempts = self.config.max_attempts,
                error = reason,
                "Job failed, requeueing for retry"
            );

            self.write_status(JobStatus::new(&job.job_id, JobState::Retrying).with_error(reason))
                .await;
            if let Err(e) = self.scheduler.manager().requeue_job(claimed).await {
                error!(worker_id = %self.id, job_id = %job.job_id, error = %e, "Failed to requeue job");
                return;
            }
            self.write_status(
                JobStatus::new(&job.job_id, JobState::QueuedAfterFailure).with_error(reason),
            )
            .await;

            self.stats.record_retry();
            self.metrics.record_retry(&job.queue_type);
            return;
        }

        error!(
            worker_id = %self.id,
            job_id = %job.job_id,
            attempts = attempts,
            error = reason,
            "Job failed permanently"
        );

        self.write_status(JobStatus::new(&job.job_id, JobState::Failed).with_error(reason))
            .await;
        if let Err(e) = self.scheduler.retries().delete(&job.job_id).await {
            warn!(worker_id = %self.id, job_id = %job.job_id, error = %e, "Failed to clear retry counter");
        }
        self.ack(claimed).await;

        self.stats.record_failure(duration);
        self.metrics
            .record_job(&job.queue_type, "failed", duration.as_secs_f64());

        self.count_toward_session(job).await;
    }

    async fn ack(&self, claimed: &ClaimedJob) {
        match self.scheduler.manager().ack_job(claimed).await {
            Ok(true) => {}
            Ok(false) => warn!(
                worker_id = %self.id,
                job_id = %claimed.job().job_id,
                "Finished job was no longer in the processing list"
            ),
            Err(e) => error!(
                worker_id = %self.id,
                job_id = %claimed.job().job_id,
                error = %e,
                "Failed to ack job"
            ),
        }
    }

    async fn count_toward_session(&self, job: &Job) {
        match self.scheduler.sessions().check_and_cleanup_session(job).await {
            Ok(CleanupOutcome::Cleaned { event, .. }) => info!(
                worker_id = %self.id,
                session_id = %event.session_id,
                "Worker finished the last job of its session"
            ),
            Ok(_) => {}
            Err(e) => error!(
                worker_id = %self.id,
                job_id = %job.job_id,
                session_id = ?job.session_id,
                error = %e,
                "Session check failed"
            ),
        }
    }

    async fn write_status(&self, status: JobStatus) {
        if let Err(e) = self.scheduler.statuses().set_status(&status).await {
            warn!(
                worker_id = %self.id,
                job_id = %status.job_id,
                status = %status.status,
                error = %e,
                "Failed to write job status"
            );
        }
    }

    /// Waits `poll_interval`, returning early on shutdown.
    async fn pause(&mut self) {
        if self.stopping {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown_rx.recv() => {
                self.stopping = true;
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        if !self.stopping {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    self.stopping = true;
                }
                // Only shutdown is ever sent, so a lag still means shutdown
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.stopping = true,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        self.stopping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::events::BroadcastEventBus;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` executions, then succeeds.
    struct FlakyHandler {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyHandler {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn execute(&self, _job: &Job, progress: &ProgressReporter) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("render crashed on call {}", call);
            }
            progress.report(50, "halfway").await?;
            Ok(())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn execute(&self, _job: &Job, _progress: &ProgressReporter) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BroadcastEventBus::default()),
            SchedulerConfig::default()
                .with_key_prefix("test")
                .with_fetch_timeout(Duration::ZERO),
        )
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig::new("rasterizer")
            .with_num_workers(1)
            .with_poll_interval(Duration::from_millis(10))
            .with_max_attempts(3)
    }

    fn worker(
        scheduler: &Scheduler,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> (broadcast::Sender<()>, Worker) {
        let (tx, rx) = broadcast::channel(1);
        let worker = Worker::new(
            "test-worker".to_string(),
            scheduler.clone(),
            handler,
            config,
            rx,
            Arc::new(SharedPoolStats::new()),
        );
        (tx, worker)
    }

    async fn enqueue_one(scheduler: &Scheduler, id: &str) {
        scheduler
            .producer()
            .enqueue(
                "rasterizer",
                vec![Job::new(id, "rasterizer", "team-a", serde_json::Value::Null)],
                false,
            )
            .await
            .unwrap();
    }

    async fn claim(scheduler: &Scheduler) -> ClaimedJob {
        scheduler
            .manager()
            .fetch_jobs("rasterizer", 1)
            .await
            .unwrap()
            .pop()
            .expect("a job should be queued")
    }

    #[tokio::test]
    async fn test_failed_attempt_is_requeued_then_completes() {
        let scheduler = scheduler();
        let (_tx, worker) = worker(&scheduler, Arc::new(FlakyHandler::new(1)), config());
        enqueue_one(&scheduler, "j1").await;

        worker.process_job(claim(&scheduler).await).await;

        let status = scheduler.statuses().get_status("j1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::QueuedAfterFailure);
        assert!(status.error.unwrap().contains("render crashed"));
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 1);

        let lengths = scheduler.manager().get_queue_lengths("rasterizer").await.unwrap();
        assert_eq!((lengths.pending, lengths.processing), (1, 0));

        worker.process_job(claim(&scheduler).await).await;

        let status = scheduler.statuses().get_status("j1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.progress, 100);
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 0);
        assert_eq!(
            scheduler.manager().get_queue_lengths("rasterizer").await.unwrap().total(),
            0
        );
    }

    #[tokio::test]
    async fn test_two_failures_then_success_counts_attempts() {
        let scheduler = scheduler();
        let (_tx, worker) = worker(
            &scheduler,
            Arc::new(FlakyHandler::new(2)),
            config().with_max_attempts(3),
        );
        enqueue_one(&scheduler, "j1").await;

        worker.process_job(claim(&scheduler).await).await;
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 1);
        assert_eq!(
            scheduler.statuses().get_status("j1").await.unwrap().unwrap().status,
            JobState::QueuedAfterFailure
        );

        worker.process_job(claim(&scheduler).await).await;
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 2);

        worker.process_job(claim(&scheduler).await).await;
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 0);
        assert_eq!(
            scheduler.statuses().get_status("j1").await.unwrap().unwrap().status,
            JobState::Completed
        );

        let stats = worker.stats.to_pool_stats(1);
        assert_eq!((stats.jobs_completed, stats.jobs_retried), (1, 2));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_failed() {
        let scheduler = scheduler();
        let (_tx, worker) = worker(
            &scheduler,
            Arc::new(FlakyHandler::new(usize::MAX)),
            config().with_max_attempts(2),
        );
        enqueue_one(&scheduler, "j1").await;

        worker.process_job(claim(&scheduler).await).await;
        worker.process_job(claim(&scheduler).await).await;

        let status = scheduler.statuses().get_status("j1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(scheduler.retries().current("j1").await.unwrap(), 0);
        assert_eq!(
            scheduler.manager().get_queue_lengths("rasterizer").await.unwrap().total(),
            0
        );

        let stats = worker.stats.to_pool_stats(1);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_retried, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let scheduler = scheduler();
        let (_tx, worker) = worker(
            &scheduler,
            Arc::new(SlowHandler),
            config().with_job_timeout(Duration::from_millis(20)),
        );
        enqueue_one(&scheduler, "j1").await;

        worker.process_job(claim(&scheduler).await).await;

        let status = scheduler.statuses().get_status("j1").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::QueuedAfterFailure);
        assert!(status.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unstarted_jobs_returned_on_shutdown() {
        let scheduler = scheduler();
        let handler = Arc::new(FlakyHandler::new(0));
        let (tx, mut worker) = worker(&scheduler, handler.clone(), config());
        for id in ["a", "b", "c"] {
            enqueue_one(&scheduler, id).await;
        }

        let batch = scheduler.manager().fetch_jobs("rasterizer", 3).await.unwrap();
        assert_eq!(batch.len(), 3);

        tx.send(()).unwrap();
        worker.process_batch(batch).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let lengths = scheduler.manager().get_queue_lengths("rasterizer").await.unwrap();
        assert_eq!((lengths.pending, lengths.processing), (3, 0));
        let status = scheduler.statuses().get_status("a").await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Queued);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_shuts_down() {
        let scheduler = scheduler();
        for i in 0..6 {
            enqueue_one(&scheduler, &format!("j{}", i)).await;
        }

        let mut pool = WorkerPool::new(
            scheduler.clone(),
            Arc::new(FlakyHandler::new(0)),
            config().with_num_workers(2).with_batch_size(2),
        );
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().jobs_completed < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(pool.stats().jobs_completed, 6);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut pool = WorkerPool::new(
            scheduler(),
            Arc::new(FlakyHandler::new(0)),
            config().with_batch_size(0),
        );
        assert!(matches!(pool.start().await, Err(PoolError::InvalidConfig(_))));
        assert!(!pool.is_running());
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            jobs_retried: 7,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.active_workers, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));

        let err = PoolError::InvalidConfig("batch_size must be at least 1".to_string());
        assert!(err.to_string().contains("batch_size"));
    }
}
