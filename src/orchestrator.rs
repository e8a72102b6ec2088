//! Entry points that turn a trigger (CLI call or schedule tick) into queued work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::database_ops::jobs::EnqueueResult;
use crate::models::{GamingService, TrackedAccount};
use crate::sync::jobs::JobPlanner;
use crate::sync::{SyncDepth, SyncEngine};

/// Outcome of a batch where one item failing never stops the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record<T, E>(&mut self, res: &std::result::Result<T, E>) {
        match res {
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct Orchestrator {
    engine: Arc<SyncEngine>,
    planner: JobPlanner,
}

impl Orchestrator {
    pub fn new(engine: Arc<SyncEngine>, planner: JobPlanner) -> Self {
        Self { engine, planner }
    }

    async fn enqueue_discovery(
        &self,
        accounts: &[TrackedAccount],
        depth: SyncDepth,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut queued = 0usize;
        for account in accounts {
            if self.engine.services.get(account.gaming_service).is_err() {
                warn!(account_id = %account.id, service = %account.gaming_service, "service not configured; skipping account");
                continue;
            }
            let res = self.planner.discover(account, depth).await;
            match &res {
                Ok(EnqueueResult::Enqueued(_)) => queued += 1,
                Ok(EnqueueResult::Duplicate) => {}
                Err(e) => error!(account_id = %account.id, error = %e, "failed to enqueue discovery"),
            }
            report.record(&res);
        }
        info!(?depth, accounts = accounts.len(), queued, failed = report.failed, "discovery jobs enqueued");
        report
    }

    /// Queue a partial discovery for every high-priority account.
    #[instrument(skip(self))]
    pub async fn run_partial_sync_for_priority_accounts(&self) -> Result<BatchReport> {
        let accounts = self
            .engine
            .store
            .list_priority_accounts(None)
            .await
            .context("list priority accounts")?;
        Ok(self.enqueue_discovery(&accounts, SyncDepth::Partial).await)
    }

    #[instrument(skip(self))]
    pub async fn run_full_sync_for_priority_accounts(&self) -> Result<BatchReport> {
        let accounts = self
            .engine
            .store
            .list_priority_accounts(None)
            .await
            .context("list priority accounts")?;
        Ok(self.enqueue_discovery(&accounts, SyncDepth::Full).await)
    }

    /// Queue discovery for one account regardless of priority.
    #[instrument(skip(self))]
    pub async fn sync_account(&self, account_id: Uuid, depth: SyncDepth) -> Result<EnqueueResult> {
        let account = self.engine.load_account(account_id).await?;
        self.engine
            .services
            .get(account.gaming_service)
            .with_context(|| format!("account {account_id}"))?;
        Ok(self.planner.discover(&account, depth).await?)
    }

    /// Refetch up to `limit` stale games of one service inline, `concurrency` at a time.
    #[instrument(skip(self))]
    pub async fn refresh_stale_titles(
        &self,
        service: GamingService,
        limit: i64,
        concurrency: usize,
    ) -> Result<BatchReport> {
        let stale = self
            .engine
            .store
            .list_stale_games(service, limit)
            .await
            .context("list stale games")?;
        info!(service = %service, stale = stale.len(), "refreshing stale titles");

        let results: Vec<_> = stream::iter(stale)
            .map(|game| {
                let engine = self.engine.clone();
                async move {
                    let res = engine.add_title(&game.title_ref()).await;
                    if let Err(e) = &res {
                        warn!(game_id = %game.id, title = %game.service_title_id, error = %e, "stale refresh failed");
                    }
                    res
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for res in &results {
            report.record(res);
        }
        info!(service = %service, succeeded = report.succeeded, failed = report.failed, "stale refresh finished");
        Ok(report)
    }

    /// Enqueue partial syncs every `partial_every` and full syncs every `full_every` until
    /// ctrl-c. Both fire once at startup.
    pub async fn schedule(&self, partial_every: Duration, full_every: Duration) -> Result<()> {
        let mut partial = tokio::time::interval(partial_every);
        partial.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut full = tokio::time::interval(full_every);
        full.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            partial_secs = partial_every.as_secs(),
            full_secs = full_every.as_secs(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = partial.tick() => {
                    if let Err(e) = self.run_partial_sync_for_priority_accounts().await {
                        error!(error = %e, "partial sync tick failed");
                    }
                }
                _ = full.tick() => {
                    if let Err(e) = self.run_full_sync_for_priority_accounts().await {
                        error!(error = %e, "full sync tick failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
            }
        }
    }
}
