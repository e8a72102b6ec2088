//! Durable job queue. Postgres (`sync_jobs`, claimed with `FOR UPDATE SKIP LOCKED`) in
//! production, an in-memory queue for tests and dry runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use crate::models::GamingService;
use crate::util::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobAction {
    Discover,
    AddTitle,
    RefreshTitle,
    SyncProgress,
}

impl JobAction {
    pub const ALL: [JobAction; 4] = [
        JobAction::Discover,
        JobAction::AddTitle,
        JobAction::RefreshTitle,
        JobAction::SyncProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Discover => "discover",
            JobAction::AddTitle => "add_title",
            JobAction::RefreshTitle => "refresh_title",
            JobAction::SyncProgress => "sync_progress",
        }
    }
}

/// Queue name such as `psn.sync_progress`. Each kind has its own concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKind {
    pub service: GamingService,
    pub action: JobAction,
}

impl JobKind {
    pub fn new(service: GamingService, action: JobAction) -> Self {
        Self { service, action }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.service.slug(), self.action.as_str())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (svc, action) = raw.split_once('.')?;
        let service = svc.parse().ok()?;
        let action = JobAction::ALL.into_iter().find(|a| a.as_str() == action)?;
        Some(Self { service, action })
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service.slug(), self.action.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub payload: Value,
    /// A queued job with the same key absorbs this one.
    pub dedupe_key: Option<String>,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued(i64),
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: JobKind,
    pub payload: Value,
    /// Includes the current run.
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { run_at: DateTime<Utc> },
    /// A queued job with the same dedupe key already covers the retry; this one is closed.
    Superseded,
    Failed,
}

/// Result of putting abandoned `running` jobs back in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedLocks {
    pub requeued: u64,
    pub superseded: u64,
}

const SUPERSEDED: &str = "superseded by a queued job with the same dedupe key";

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, spec: JobSpec) -> SyncResult<EnqueueResult>;

    /// Claim the oldest runnable job of `kind`, bumping its attempt counter.
    async fn claim(&self, kind: JobKind, worker_id: &str) -> SyncResult<Option<ClaimedJob>>;

    async fn complete(&self, job_id: i64) -> SyncResult<()>;

    /// Requeue with backoff, or mark `failed` once attempts are exhausted. At most one job per
    /// dedupe key is ever queued, so a retry that would collide is closed as superseded.
    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        backoff: BackoffPolicy,
    ) -> SyncResult<FailOutcome>;

    /// Put `running` jobs locked for longer than `older_than` back in the queue, under the same
    /// one-queued-per-key rule as `fail`.
    async fn release_stale_locks(&self, older_than: Duration) -> SyncResult<ReleasedLocks>;
}

fn next_run(job: &ClaimedJob, backoff: BackoffPolicy) -> Option<DateTime<Utc>> {
    if job.attempts >= job.max_attempts {
        return None;
    }
    let delay = chrono::Duration::from_std(backoff.delay_for(job.attempts))
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    Some(Utc::now() + delay)
}

#[derive(Clone)]
pub struct PgJobQueue {
    db: Db,
}

impl PgJobQueue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn supersede(&self, job_id: i64, error: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = 'done', finished_at = now(), locked_at = NULL, \
             locked_by = NULL, last_error = $2, updated_at = now() WHERE id = $1",
        )
        .persistent(false)
        .bind(job_id)
        .bind(format!("{SUPERSEDED}; last error: {error}"))
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    #[instrument(skip(self, spec), fields(kind = %spec.kind))]
    async fn enqueue(&self, spec: JobSpec) -> SyncResult<EnqueueResult> {
        let id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO sync_jobs (kind, payload, dedupe_key, max_attempts) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (dedupe_key) WHERE status = 'queued' DO NOTHING \
             RETURNING id",
        )
        .persistent(false)
        .bind(spec.kind.name())
        .bind(&spec.payload)
        .bind(&spec.dedupe_key)
        .bind(spec.max_attempts as i32)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(id.map_or(EnqueueResult::Duplicate, EnqueueResult::Enqueued))
    }

    async fn claim(&self, kind: JobKind, worker_id: &str) -> SyncResult<Option<ClaimedJob>> {
        let mut tx = self.db.pool.begin().await?;
        let rec = sqlx::query(
            "SELECT id, payload, attempts, max_attempts FROM sync_jobs \
             WHERE status = 'queued' AND kind = $1 AND run_at <= now() \
             ORDER BY run_at ASC, id ASC \
             FOR UPDATE SKIP LOCKED LIMIT 1",
        )
        .persistent(false)
        .bind(kind.name())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = rec else {
            tx.rollback().await?;
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        sqlx::query(
            "UPDATE sync_jobs \
             SET status = 'running', locked_at = now(), locked_by = $2, \
                 attempts = attempts + 1, updated_at = now() \
             WHERE id = $1",
        )
        .persistent(false)
        .bind(id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        Ok(Some(ClaimedJob {
            id,
            kind,
            payload: row.try_get("payload")?,
            attempts: (attempts + 1).max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
        }))
    }

    async fn complete(&self, job_id: i64) -> SyncResult<()> {
        sqlx::query(
            "UPDATE sync_jobs \
             SET status = 'done', finished_at = now(), updated_at = now(), last_error = NULL \
             WHERE id = $1",
        )
        .persistent(false)
        .bind(job_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        backoff: BackoffPolicy,
    ) -> SyncResult<FailOutcome> {
        let outcome = match next_run(job, backoff) {
            Some(run_at) => {
                let requeued = sqlx::query(
                    "UPDATE sync_jobs SET status = 'queued', run_at = $2, locked_at = NULL, \
                     locked_by = NULL, last_error = $3, updated_at = now() WHERE id = $1",
                )
                .persistent(false)
                .bind(job.id)
                .bind(run_at)
                .bind(error)
                .execute(&self.db.pool)
                .await;
                match requeued {
                    Ok(_) => FailOutcome::Requeued { run_at },
                    // sync_jobs_dedupe_queued_idx: an equal-key job was queued while this one ran.
                    Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                        self.supersede(job.id, error).await?;
                        FailOutcome::Superseded
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                sqlx::query(
                    "UPDATE sync_jobs \
                     SET status = 'failed', finished_at = now(), last_error = $2, updated_at = now() \
                     WHERE id = $1",
                )
                .persistent(false)
                .bind(job.id)
                .bind(error)
                .execute(&self.db.pool)
                .await?;
                FailOutcome::Failed
            }
        };
        Ok(outcome)
    }

    /// Per dedupe key, the oldest stale job is requeued unless a queued job already holds the
    /// key; every other stale job with that key is closed as superseded.
    #[instrument(skip(self))]
    async fn release_stale_locks(&self, older_than: Duration) -> SyncResult<ReleasedLocks> {
        let requeue_flags: Vec<bool> = sqlx::query_scalar(
            "WITH stale AS ( \
                 SELECT id, dedupe_key FROM sync_jobs \
                 WHERE status = 'running' AND locked_at < now() - make_interval(secs => $1) \
                 FOR UPDATE SKIP LOCKED \
             ), decided AS ( \
                 SELECT s.id, ( \
                     s.dedupe_key IS NULL OR ( \
                         NOT EXISTS (SELECT 1 FROM sync_jobs q \
                                     WHERE q.dedupe_key = s.dedupe_key AND q.status = 'queued') \
                         AND s.id = (SELECT min(t.id) FROM stale t WHERE t.dedupe_key = s.dedupe_key) \
                     )) AS requeue \
                 FROM stale s \
             ) \
             UPDATE sync_jobs j SET \
                 status = CASE WHEN d.requeue THEN 'queued' ELSE 'done' END, \
                 finished_at = CASE WHEN d.requeue THEN NULL ELSE now() END, \
                 last_error = CASE WHEN d.requeue THEN j.last_error ELSE $2 END, \
                 locked_at = NULL, locked_by = NULL, updated_at = now() \
             FROM decided d WHERE j.id = d.id \
             RETURNING d.requeue",
        )
        .persistent(false)
        .bind(older_than.as_secs_f64())
        .bind(SUPERSEDED)
        .fetch_all(&self.db.pool)
        .await?;
        let released = tally_released(&requeue_flags);
        if released != ReleasedLocks::default() {
            warn!(
                requeued = released.requeued,
                superseded = released.superseded,
                "released stale job locks"
            );
        }
        Ok(released)
    }
}

fn tally_released(requeue_flags: &[bool]) -> ReleasedLocks {
    let requeued = requeue_flags.iter().filter(|r| **r).count() as u64;
    ReleasedLocks {
        requeued,
        superseded: requeue_flags.len() as u64 - requeued,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemoryJob {
    pub id: i64,
    pub kind: JobKind,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    jobs: Vec<MemoryJob>,
}

impl MemoryQueueState {
    fn has_queued(&self, dedupe_key: Option<&str>) -> bool {
        dedupe_key.is_some_and(|key| {
            self.jobs
                .iter()
                .any(|j| j.status == JobStatus::Queued && j.dedupe_key.as_deref() == Some(key))
        })
    }
}

/// Same claim/retry semantics as `PgJobQueue`, without durability.
#[derive(Default, Clone)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<MemoryQueueState>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<MemoryJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn count(&self, kind: JobKind, status: JobStatus) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.kind == kind && j.status == status)
            .count()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> SyncResult<EnqueueResult> {
        let mut st = self.state.lock().await;
        if st.has_queued(spec.dedupe_key.as_deref()) {
            return Ok(EnqueueResult::Duplicate);
        }
        st.next_id += 1;
        let id = st.next_id;
        st.jobs.push(MemoryJob {
            id,
            kind: spec.kind,
            payload: spec.payload,
            dedupe_key: spec.dedupe_key,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: spec.max_attempts.max(1),
            run_at: Utc::now(),
            locked_at: None,
            last_error: None,
        });
        Ok(EnqueueResult::Enqueued(id))
    }

    async fn claim(&self, kind: JobKind, _worker_id: &str) -> SyncResult<Option<ClaimedJob>> {
        let mut st = self.state.lock().await;
        let now = Utc::now();
        let next = st
            .jobs
            .iter_mut()
            .filter(|j| j.kind == kind && j.status == JobStatus::Queued && j.run_at <= now)
            .min_by_key(|j| (j.run_at, j.id));
        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.locked_at = Some(now);
            job.attempts += 1;
            ClaimedJob {
                id: job.id,
                kind: job.kind,
                payload: job.payload.clone(),
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            }
        }))
    }

    async fn complete(&self, job_id: i64) -> SyncResult<()> {
        let mut st = self.state.lock().await;
        let job = st
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| SyncError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Done;
        job.locked_at = None;
        job.last_error = None;
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        backoff: BackoffPolicy,
    ) -> SyncResult<FailOutcome> {
        let mut st = self.state.lock().await;
        let idx = st
            .jobs
            .iter()
            .position(|j| j.id == job.id)
            .ok_or_else(|| SyncError::NotFound(format!("job {}", job.id)))?;
        let covered = st.has_queued(st.jobs[idx].dedupe_key.as_deref());
        let row = &mut st.jobs[idx];
        row.locked_at = None;
        row.last_error = Some(error.to_string());
        Ok(match next_run(job, backoff) {
            Some(_) if covered => {
                row.status = JobStatus::Done;
                row.last_error = Some(format!("{SUPERSEDED}; last error: {error}"));
                FailOutcome::Superseded
            }
            Some(run_at) => {
                row.status = JobStatus::Queued;
                row.run_at = run_at;
                FailOutcome::Requeued { run_at }
            }
            None => {
                row.status = JobStatus::Failed;
                info!(job_id = job.id, kind = %job.kind, "job exhausted its attempts");
                FailOutcome::Failed
            }
        })
    }

    async fn release_stale_locks(&self, older_than: Duration) -> SyncResult<ReleasedLocks> {
        let mut st = self.state.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut stale: Vec<usize> = st
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.status == JobStatus::Running && j.locked_at.is_some_and(|at| at <= cutoff)
            })
            .map(|(i, _)| i)
            .collect();
        stale.sort_by_key(|&i| st.jobs[i].id);

        let mut flags = Vec::with_capacity(stale.len());
        for i in stale {
            let requeue = !st.has_queued(st.jobs[i].dedupe_key.as_deref());
            let row = &mut st.jobs[i];
            row.locked_at = None;
            if requeue {
                row.status = JobStatus::Queued;
            } else {
                row.status = JobStatus::Done;
                row.last_error = Some(SUPERSEDED.to_string());
            }
            flags.push(requeue);
        }
        Ok(tally_released(&flags))
    }
}
