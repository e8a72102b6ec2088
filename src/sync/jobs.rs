//! Job payloads, enqueue helpers and the handlers that run each job kind.
//!
//! Discovery fans out into title and progress jobs; a title job queues the progress job
//! for the account that asked for it, so a title is always stored before its progress is
//! merged.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ProgressRun, SyncDepth, SyncEngine};
use crate::config::{RetryPolicy, SyncConfig};
use crate::database_ops::jobs::{ClaimedJob, EnqueueResult, JobAction, JobKind, JobQueue, JobSpec};
use crate::database_ops::worker_manager::{JobHandler, Lane};
use crate::error::SyncResult;
use crate::models::{GamingService, TitleRef, TrackedAccount};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPayload {
    pub account_id: Uuid,
    pub depth: SyncDepth,
}

/// Payload of `add_title` and `refresh_title`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitlePayload {
    /// Account whose progress is queued once the title is stored.
    pub account_id: Option<Uuid>,
    pub title: TitleRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub account_id: Uuid,
    pub title: TitleRef,
}

pub fn discover_key(service: GamingService, account_id: Uuid) -> String {
    format!("{}.discover:{account_id}", service.slug())
}

pub fn title_key(action: JobAction, title: &TitleRef, account_id: Option<Uuid>) -> String {
    let base = format!(
        "{}.{}:{}",
        title.gaming_service.slug(),
        action.as_str(),
        title.service_title_id
    );
    match account_id {
        Some(id) => format!("{base}:{id}"),
        None => base,
    }
}

pub fn progress_key(account_id: Uuid, title: &TitleRef) -> String {
    format!(
        "{}.sync_progress:{account_id}:{}",
        title.gaming_service.slug(),
        title.service_title_id
    )
}

/// Builds job specs with the configured retry policy and dedupe keys.
#[derive(Clone)]
pub struct JobPlanner {
    queue: Arc<dyn JobQueue>,
    config: Arc<SyncConfig>,
}

impl JobPlanner {
    pub fn new(queue: Arc<dyn JobQueue>, config: Arc<SyncConfig>) -> Self {
        Self { queue, config }
    }

    pub fn retry_policy(&self, action: JobAction) -> RetryPolicy {
        match action {
            JobAction::Discover => self.config.discovery_job_retry,
            JobAction::AddTitle | JobAction::RefreshTitle => self.config.title_job_retry,
            JobAction::SyncProgress => self.config.progress_job_retry,
        }
    }

    async fn push<P: Serialize>(
        &self,
        service: GamingService,
        action: JobAction,
        payload: &P,
        dedupe_key: String,
    ) -> SyncResult<EnqueueResult> {
        let spec = JobSpec {
            kind: JobKind::new(service, action),
            payload: serde_json::to_value(payload)?,
            dedupe_key: Some(dedupe_key),
            max_attempts: self.retry_policy(action).max_attempts,
        };
        let res = self.queue.enqueue(spec).await?;
        if res == EnqueueResult::Duplicate {
            debug!(service = %service, action = action.as_str(), "job already queued");
        }
        Ok(res)
    }

    pub async fn discover(
        &self,
        account: &TrackedAccount,
        depth: SyncDepth,
    ) -> SyncResult<EnqueueResult> {
        let payload = DiscoverPayload {
            account_id: account.id,
            depth,
        };
        self.push(
            account.gaming_service,
            JobAction::Discover,
            &payload,
            discover_key(account.gaming_service, account.id),
        )
        .await
    }

    /// `action` is `AddTitle` or `RefreshTitle`.
    pub async fn title(
        &self,
        action: JobAction,
        title: &TitleRef,
        account_id: Option<Uuid>,
    ) -> SyncResult<EnqueueResult> {
        let payload = TitlePayload {
            account_id,
            title: title.clone(),
        };
        self.push(
            title.gaming_service,
            action,
            &payload,
            title_key(action, title, account_id),
        )
        .await
    }

    pub async fn progress(&self, account_id: Uuid, title: &TitleRef) -> SyncResult<EnqueueResult> {
        let payload = ProgressPayload {
            account_id,
            title: title.clone(),
        };
        self.push(
            title.gaming_service,
            JobAction::SyncProgress,
            &payload,
            progress_key(account_id, title),
        )
        .await
    }
}

/// Runs one job action against the engine.
pub struct SyncJobHandler {
    action: JobAction,
    engine: Arc<SyncEngine>,
    planner: JobPlanner,
}

impl SyncJobHandler {
    pub fn new(action: JobAction, engine: Arc<SyncEngine>, planner: JobPlanner) -> Self {
        Self {
            action,
            engine,
            planner,
        }
    }

    /// `None` when the account was deleted after the job was queued.
    async fn account(&self, account_id: Uuid) -> Result<Option<TrackedAccount>> {
        let account = self.engine.store.get_tracked_account(account_id).await?;
        if account.is_none() {
            warn!(%account_id, "tracked account no longer exists; dropping job");
        }
        Ok(account)
    }

    async fn run_discover(&self, payload: DiscoverPayload) -> Result<()> {
        let Some(account) = self.account(payload.account_id).await? else {
            return Ok(());
        };
        let Some(found) = self
            .engine
            .discover_account(&account, payload.depth)
            .await
            .with_context(|| format!("discover account {}", account.id))?
        else {
            return Ok(());
        };
        let result = &found.result;
        for id in &result.missing_title_ids {
            if let Some(remote) = result.remote(id) {
                self.planner
                    .title(JobAction::AddTitle, &remote.title, Some(account.id))
                    .await?;
            }
        }
        for id in &result.stale_title_ids {
            if let Some(remote) = result.remote(id) {
                self.planner
                    .title(JobAction::RefreshTitle, &remote.title, Some(account.id))
                    .await?;
            }
        }
        for remote in &found.changed {
            self.planner.progress(account.id, &remote.title).await?;
        }
        info!(
            account_id = %account.id,
            missing = result.missing_title_ids.len(),
            stale = result.stale_title_ids.len(),
            changed = found.changed.len(),
            "discovery queued follow-up jobs"
        );
        Ok(())
    }

    async fn run_title(&self, payload: TitlePayload) -> Result<()> {
        let game = self
            .engine
            .add_title(&payload.title)
            .await
            .with_context(|| {
                format!(
                    "{} title {}",
                    self.action.as_str(),
                    payload.title.service_title_id
                )
            })?;
        debug!(game_id = %game.id, "title stored");
        if let Some(account_id) = payload.account_id {
            self.planner.progress(account_id, &game.title_ref()).await?;
        }
        Ok(())
    }

    async fn run_progress(&self, payload: ProgressPayload) -> Result<()> {
        let Some(account) = self.account(payload.account_id).await? else {
            return Ok(());
        };
        let run = self
            .engine
            .sync_progress(&account, &payload.title)
            .await
            .with_context(|| {
                format!("sync progress for title {}", payload.title.service_title_id)
            })?;
        match run {
            ProgressRun::Merged { .. } => {}
            ProgressRun::MarkedStale { game_id, missing } => {
                // The next discovery sees the stale flag and queues the refresh.
                warn!(%game_id, ?missing, "progress deferred until the title is refreshed");
            }
            ProgressRun::AccountUnresolved => {
                warn!(account_id = %account.id, "account unresolved; progress skipped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &ClaimedJob) -> Result<()> {
        let payload = job.payload.clone();
        match self.action {
            JobAction::Discover => {
                self.run_discover(serde_json::from_value(payload).context("discover payload")?)
                    .await
            }
            JobAction::AddTitle | JobAction::RefreshTitle => {
                self.run_title(serde_json::from_value(payload).context("title payload")?)
                    .await
            }
            JobAction::SyncProgress => {
                self.run_progress(serde_json::from_value(payload).context("progress payload")?)
                    .await
            }
        }
    }
}

/// One lane per (configured service, action).
pub fn lanes(engine: Arc<SyncEngine>, planner: &JobPlanner) -> Vec<Lane> {
    let cfg = engine.config.clone();
    let mut services: Vec<GamingService> = engine.services.services().collect();
    services.sort_by_key(|s| s.as_str());
    let mut out = Vec::new();
    for service in services {
        for action in JobAction::ALL {
            let concurrency = match action {
                JobAction::Discover => cfg.discovery_concurrency,
                JobAction::AddTitle | JobAction::RefreshTitle => cfg.title_concurrency,
                JobAction::SyncProgress => cfg.progress_concurrency(service),
            };
            let handler = Arc::new(SyncJobHandler::new(action, engine.clone(), planner.clone()));
            out.push(Lane::new(
                JobKind::new(service, action),
                concurrency,
                planner.retry_policy(action).backoff,
                handler,
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::BackoffPolicy;
    use crate::database_ops::jobs::{JobStatus, MemoryJobQueue};
    use crate::database_ops::memory::MemorySyncStore;
    use crate::database_ops::store::SyncStore;
    use crate::database_ops::worker_manager::WorkerManager;
    use crate::models::TrackedEventKind;
    use crate::normalization::ProgressMetric;
    use crate::sync::testing::{
        earned, mapped_title, summary, tracked_account, with_platinum, FakeService,
    };
    use crate::sync::ServiceRegistry;

    struct Harness {
        store: Arc<MemorySyncStore>,
        queue: Arc<MemoryJobQueue>,
        planner: JobPlanner,
        manager: WorkerManager,
        lanes: Vec<Lane>,
    }

    fn harness(fake: Arc<FakeService>) -> Harness {
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffPolicy::Fixed {
                delay: Duration::ZERO,
            },
        };
        let config = Arc::new(SyncConfig {
            title_job_retry: retry,
            progress_job_retry: retry,
            discovery_job_retry: retry,
            ..SyncConfig::default()
        });
        let store = Arc::new(MemorySyncStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            ServiceRegistry::new().with(fake),
            config.clone(),
        ));
        let planner = JobPlanner::new(queue.clone(), config);
        let lanes = lanes(engine, &planner);
        let manager = WorkerManager::new(queue.clone(), Duration::from_millis(10));
        Harness {
            store,
            queue,
            planner,
            manager,
            lanes,
        }
    }

    impl Harness {
        async fn sync(&self, account: &TrackedAccount, depth: SyncDepth) {
            self.planner.discover(account, depth).await.unwrap();
            self.manager.drain_all(&self.lanes).await.unwrap();
        }

        async fn event_kinds(&self) -> Vec<TrackedEventKind> {
            self.store.events().await.into_iter().map(|e| e.kind).collect()
        }
    }

    #[test]
    fn dedupe_keys_scope_by_account_and_title() {
        let title = TitleRef::new(
            GamingService::Psn,
            "NPWR1",
            crate::models::TitleDiscriminator::None,
        );
        let account = Uuid::nil();
        assert_eq!(
            progress_key(account, &title),
            format!("psn.sync_progress:{account}:NPWR1")
        );
        assert_eq!(title_key(JobAction::RefreshTitle, &title, None), "psn.refresh_title:NPWR1");
        assert_eq!(
            discover_key(GamingService::Ra, account),
            format!("ra.discover:{account}")
        );
    }

    #[tokio::test]
    async fn ra_mastery_is_emitted_once() {
        let title = mapped_title(GamingService::Ra, "1", 2, |_| Some(10));
        let fake = Arc::new(
            FakeService::new(GamingService::Ra)
                .with_account("retro", "retro")
                .with_title(title),
        );
        fake.set_titles(
            "retro",
            vec![summary(GamingService::Ra, "1", ProgressMetric::AchievementCount(2))],
        );
        fake.set_earned("retro", "1", vec![earned("a0", true), earned("a1", true)]);

        let h = harness(fake.clone());
        let account = tracked_account(GamingService::Ra, "retro", 48);
        h.store.insert_account(account.clone()).await;

        h.sync(&account, SyncDepth::Full).await;
        assert_eq!(h.event_kinds().await, vec![TrackedEventKind::RaNewMastery]);

        h.sync(&account, SyncDepth::Partial).await;
        assert_eq!(h.event_kinds().await, vec![TrackedEventKind::RaNewMastery]);
        assert_eq!(FakeService::calls(&fake.fetch_earned_calls), 1);
        assert_eq!(FakeService::calls(&fake.resolve_calls), 1);
    }

    #[tokio::test]
    async fn psn_completion_fires_once_without_platinum() {
        let title = mapped_title(GamingService::Psn, "NPWR9", 3, |_| None);
        let fake = Arc::new(
            FakeService::new(GamingService::Psn)
                .with_account("alice", "psn-alice")
                .with_title(title),
        );
        fake.set_titles(
            "psn-alice",
            vec![summary(GamingService::Psn, "NPWR9", ProgressMetric::EarnedTrophies(2))],
        );
        fake.set_earned("psn-alice", "NPWR9", vec![earned("a0", false), earned("a1", false)]);

        let h = harness(fake.clone());
        let account = tracked_account(GamingService::Psn, "alice", 48);
        h.store.insert_account(account.clone()).await;
        h.sync(&account, SyncDepth::Full).await;
        assert!(h.event_kinds().await.is_empty());

        fake.set_titles(
            "psn-alice",
            vec![summary(GamingService::Psn, "NPWR9", ProgressMetric::EarnedTrophies(3))],
        );
        fake.set_earned(
            "psn-alice",
            "NPWR9",
            vec![earned("a0", false), earned("a1", false), earned("a2", false)],
        );
        h.sync(&account, SyncDepth::Partial).await;
        h.sync(&account, SyncDepth::Partial).await;
        assert_eq!(h.event_kinds().await, vec![TrackedEventKind::PsnNewCompletion]);
    }

    #[tokio::test]
    async fn psn_platinum_unlock_emits_both_events() {
        let title = with_platinum(mapped_title(GamingService::Psn, "NPWR5", 2, |_| None), 1);
        let fake = Arc::new(
            FakeService::new(GamingService::Psn)
                .with_account("bob", "psn-bob")
                .with_title(title),
        );
        fake.set_titles(
            "psn-bob",
            vec![summary(GamingService::Psn, "NPWR5", ProgressMetric::EarnedTrophies(2))],
        );
        fake.set_earned("psn-bob", "NPWR5", vec![earned("a0", false), earned("a1", false)]);

        let h = harness(fake);
        let account = tracked_account(GamingService::Psn, "bob", 48);
        h.store.insert_account(account.clone()).await;
        h.sync(&account, SyncDepth::Full).await;
        assert_eq!(
            h.event_kinds().await,
            vec![TrackedEventKind::PsnNewPlatinum, TrackedEventKind::PsnNewCompletion]
        );
    }

    #[tokio::test]
    async fn xbox_unknown_achievement_stays_stale_until_refreshed() {
        let title = mapped_title(GamingService::Xbox, "4000", 2, |_| Some(10));
        let fake = Arc::new(
            FakeService::new(GamingService::Xbox)
                .with_account("gt", "2533")
                .with_title(title.clone()),
        );
        fake.set_titles(
            "2533",
            vec![summary(GamingService::Xbox, "4000", ProgressMetric::Gamerscore(10))],
        );
        fake.set_earned("2533", "4000", vec![earned("a0", false)]);

        let h = harness(fake.clone());
        let account = tracked_account(GamingService::Xbox, "gt", 48);
        h.store.insert_account(account.clone()).await;
        h.sync(&account, SyncDepth::Full).await;

        let game = h.store.find_game(GamingService::Xbox, "4000").await.unwrap().unwrap();
        let progress = h.store.find_progress(account.id, game.id).await.unwrap().unwrap();
        assert_eq!(h.store.list_earned(progress.id).await.unwrap().len(), 1);

        // a new achievement shows up remotely before the definition is refreshed
        fake.set_titles(
            "2533",
            vec![summary(GamingService::Xbox, "4000", ProgressMetric::Gamerscore(20))],
        );
        fake.set_earned("2533", "4000", vec![earned("a0", false), earned("a9", false)]);
        h.sync(&account, SyncDepth::Partial).await;

        let game = h.store.get_game(game.id).await.unwrap().unwrap();
        assert!(game.is_stale);
        assert_eq!(h.store.list_earned(progress.id).await.unwrap().len(), 1);
        assert!(h.event_kinds().await.is_empty());

        // once the service serves the new definition, the next discovery refreshes and merges
        let mut updated = title;
        let mut extra = updated.achievements[1].clone();
        extra.service_achievement_id = "a9".into();
        updated.achievements.push(extra);
        fake.set_title(updated);
        h.sync(&account, SyncDepth::Partial).await;

        let game = h.store.get_game(game.id).await.unwrap().unwrap();
        assert!(!game.is_stale);
        let progress = h.store.find_progress(account.id, game.id).await.unwrap().unwrap();
        assert_eq!(h.store.list_earned(progress.id).await.unwrap().len(), 2);
        let refresh = JobKind::new(GamingService::Xbox, JobAction::RefreshTitle);
        assert_eq!(h.queue.count(refresh, JobStatus::Done).await, 1);
    }

    #[tokio::test]
    async fn one_failing_title_does_not_block_its_siblings() {
        let fake = Arc::new(
            FakeService::new(GamingService::Ra)
                .with_account("retro", "retro")
                .with_title(mapped_title(GamingService::Ra, "1", 1, |_| Some(5)))
                .with_title(mapped_title(GamingService::Ra, "2", 1, |_| Some(5))),
        );
        fake.fail_title("2", 404);
        fake.set_titles(
            "retro",
            vec![
                summary(GamingService::Ra, "1", ProgressMetric::AchievementCount(1)),
                summary(GamingService::Ra, "2", ProgressMetric::AchievementCount(1)),
            ],
        );
        fake.set_earned("retro", "1", vec![earned("a0", false)]);
        fake.set_earned("retro", "2", vec![earned("a0", false)]);

        let h = harness(fake.clone());
        let account = tracked_account(GamingService::Ra, "retro", 48);
        h.store.insert_account(account.clone()).await;
        h.sync(&account, SyncDepth::Full).await;

        let add = JobKind::new(GamingService::Ra, JobAction::AddTitle);
        assert_eq!(h.queue.count(add, JobStatus::Done).await, 1);
        assert_eq!(h.queue.count(add, JobStatus::Failed).await, 1);
        let failed = h
            .queue
            .jobs()
            .await
            .into_iter()
            .find(|j| j.status == JobStatus::Failed)
            .unwrap();
        assert_eq!(failed.attempts, 2);
        assert!(failed.last_error.unwrap().contains("http 404"));
        assert_eq!(h.store.count_progress_rows(account.id).await.unwrap(), 1);
    }
}
