use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::jobs::{ClaimedJob, FailOutcome, JobKind, JobQueue};
use crate::config::BackoffPolicy;

/// Work done for one claimed job. An `Err` sends the job back through its retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ClaimedJob) -> Result<()>;
}

/// One job kind with its own concurrency limit and backoff.
#[derive(Clone)]
pub struct Lane {
    pub kind: JobKind,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub handler: Arc<dyn JobHandler>,
}

impl Lane {
    pub fn new(
        kind: JobKind,
        concurrency: usize,
        backoff: BackoffPolicy,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            kind,
            concurrency: concurrency.max(1),
            backoff,
            handler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Requeued,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.completed + self.requeued + self.failed
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Requeued => self.requeued += 1,
            JobOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: DrainReport) {
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

async fn run_job(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    backoff: BackoffPolicy,
    worker_id: Arc<str>,
    job: ClaimedJob,
) -> JobOutcome {
    let job_id = job.id;
    let kind = job.kind;
    info!(job_id, kind = %kind, attempt = job.attempts, worker = %worker_id, "processing job");
    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(db_err) = queue.complete(job_id).await {
                error!(job_id, error = %db_err, "failed to mark job complete");
            } else {
                info!(job_id, kind = %kind, "job completed");
            }
            JobOutcome::Completed
        }
        Err(err) => {
            let err_str = format!("{err:#}");
            match queue.fail(&job, &err_str, backoff).await {
                Ok(FailOutcome::Requeued { run_at }) => {
                    warn!(job_id, kind = %kind, attempt = job.attempts, %run_at, error = %err_str, "job failed; requeued");
                    JobOutcome::Requeued
                }
                Ok(FailOutcome::Superseded) => {
                    info!(job_id, kind = %kind, error = %err_str, "job failed; a queued duplicate takes the retry");
                    JobOutcome::Requeued
                }
                Ok(FailOutcome::Failed) => {
                    error!(job_id, kind = %kind, attempts = job.attempts, error = %err_str, "job failed permanently");
                    JobOutcome::Failed
                }
                Err(db_err) => {
                    error!(job_id, error = %db_err, "failed to record job failure");
                    JobOutcome::Failed
                }
            }
        }
    }
}

pub struct WorkerManager {
    queue: Arc<dyn JobQueue>,
    worker_id: Arc<str>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl WorkerManager {
    pub fn new(queue: Arc<dyn JobQueue>, poll_interval: Duration) -> Self {
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
        Self {
            queue,
            worker_id: Arc::from(worker_id),
            poll_interval,
            error_backoff: Duration::from_secs(5),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn spawn_job(&self, set: &mut JoinSet<JobOutcome>, lane: &Lane, job: ClaimedJob) {
        set.spawn(run_job(
            self.queue.clone(),
            lane.handler.clone(),
            lane.backoff,
            self.worker_id.clone(),
            job,
        ));
    }

    /// Claim and run jobs of one kind forever, never more than `lane.concurrency` at once.
    pub async fn process(&self, lane: Lane) -> Result<()> {
        info!(kind = %lane.kind, concurrency = lane.concurrency, worker = %self.worker_id, "lane started");
        let mut set: JoinSet<JobOutcome> = JoinSet::new();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while set.len() < lane.concurrency {
                match self.queue.claim(lane.kind, &self.worker_id).await {
                    Ok(Some(job)) => self.spawn_job(&mut set, &lane, job),
                    Ok(None) => break,
                    Err(e) => {
                        error!(kind = %lane.kind, error = %e, "error claiming job; backing off");
                        tokio::time::sleep(self.error_backoff).await;
                        break;
                    }
                }
            }

            tokio::select! {
                Some(res) = set.join_next(), if !set.is_empty() => {
                    if let Err(join_err) = res {
                        error!(kind = %lane.kind, error = %join_err, "job task panicked");
                    }
                }
                _ = ticker.tick() => {
                    if set.is_empty() {
                        debug!(kind = %lane.kind, "idle tick");
                    }
                }
            }
        }
    }

    /// Run every job of `lane.kind` that is runnable now, then return.
    pub async fn drain(&self, lane: &Lane) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut set: JoinSet<JobOutcome> = JoinSet::new();
        loop {
            while set.len() < lane.concurrency {
                match self.queue.claim(lane.kind, &self.worker_id).await? {
                    Some(job) => self.spawn_job(&mut set, lane, job),
                    None => break,
                }
            }
            match set.join_next().await {
                Some(Ok(outcome)) => report.record(outcome),
                Some(Err(join_err)) => {
                    error!(kind = %lane.kind, error = %join_err, "job task panicked");
                    report.failed += 1;
                }
                None => break,
            }
        }
        Ok(report)
    }

    /// Drain lanes in order, repeating while any lane still finds work. Jobs that enqueue
    /// follow-ups on other lanes are picked up on the next pass.
    pub async fn drain_all(&self, lanes: &[Lane]) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let mut pass = DrainReport::default();
            for lane in lanes {
                pass.merge(self.drain(lane).await?);
            }
            if pass.processed() == 0 {
                break;
            }
            total.merge(pass);
        }
        Ok(total)
    }

    /// Run every lane concurrently. Returns the first lane error, if any.
    pub async fn run_all(self: Arc<Self>, lanes: Vec<Lane>) -> Result<()> {
        let mut tasks = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let manager = self.clone();
            tasks.push(tokio::spawn(async move {
                let kind = lane.kind;
                let res = manager.process(lane).await;
                if let Err(e) = &res {
                    error!(kind = %kind, error = %e, "lane stopped");
                }
                res
            }));
        }
        let mut first_err: Option<anyhow::Error> = None;
        for r in join_all(tasks).await {
            let err = match r {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_err) => anyhow::anyhow!(join_err),
            };
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::jobs::{JobAction, JobSpec, JobStatus, MemoryJobQueue};
    use crate::models::GamingService;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Flaky {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &ClaimedJob) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("upstream 503");
            }
            Ok(())
        }
    }

    fn no_wait() -> BackoffPolicy {
        BackoffPolicy::Fixed {
            delay: Duration::ZERO,
        }
    }

    async fn seed(queue: &MemoryJobQueue, kind: JobKind, n: usize, max_attempts: u32) {
        for i in 0..n {
            queue
                .enqueue(JobSpec {
                    kind,
                    payload: json!({ "n": i }),
                    dedupe_key: Some(format!("job-{i}")),
                    max_attempts,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn drain_respects_lane_concurrency() {
        let queue = MemoryJobQueue::new();
        let kind = JobKind::new(GamingService::Xbox, JobAction::SyncProgress);
        seed(&queue, kind, 8, 3).await;
        let handler = Arc::new(Flaky::new(0));
        let manager = WorkerManager::new(Arc::new(queue.clone()), Duration::from_millis(10));
        let lane = Lane::new(kind, 3, no_wait(), handler.clone());

        let report = manager.drain(&lane).await.unwrap();
        assert_eq!(report.completed, 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.count(kind, JobStatus::Done).await, 8);
    }

    #[tokio::test]
    async fn failing_job_is_retried_then_isolated() {
        let queue = MemoryJobQueue::new();
        let kind = JobKind::new(GamingService::Ra, JobAction::AddTitle);
        seed(&queue, kind, 1, 2).await;
        let handler = Arc::new(Flaky::new(usize::MAX));
        let manager = WorkerManager::new(Arc::new(queue.clone()), Duration::from_millis(10));
        let lane = Lane::new(kind, 1, no_wait(), handler.clone());

        let report = manager.drain_all(std::slice::from_ref(&lane)).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let jobs = queue.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].last_error.as_deref(), Some("upstream 503"));
    }
}
