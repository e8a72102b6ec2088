//! The sync engine: discovery, title upserts, progress merges and milestone events.

pub mod discovery;
pub mod jobs;
pub mod merge;
pub mod milestones;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::database_ops::store::SyncStore;
use crate::error::{SyncError, SyncResult};
use crate::models::{Game, TitleRef, TrackedAccount, TrackedEvent};
use crate::normalization::RemoteTitleSummary;

pub use discovery::DiscoveryResult;
pub use merge::{MergeOutcome, ProgressSyncStatus};
pub use milestones::MilestoneSettings;
pub use service::{AchievementService, ServiceRegistry, SyncDepth};

/// Discovery output for one account, with the remote id it ran under.
#[derive(Debug, Clone)]
pub struct AccountDiscovery {
    pub service_account_id: String,
    pub result: DiscoveryResult,
    /// Existing titles whose remote progress moved.
    pub changed: Vec<RemoteTitleSummary>,
}

#[derive(Debug, Clone)]
pub enum ProgressRun {
    Merged {
        outcome: MergeOutcome,
        events: Vec<TrackedEvent>,
    },
    MarkedStale {
        game_id: Uuid,
        missing: Vec<String>,
    },
    /// The service does not know the account's user name.
    AccountUnresolved,
}

pub struct SyncEngine {
    pub store: Arc<dyn SyncStore>,
    pub services: ServiceRegistry,
    pub config: Arc<SyncConfig>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        services: ServiceRegistry,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            services,
            config,
        }
    }

    pub async fn load_account(&self, account_id: Uuid) -> SyncResult<TrackedAccount> {
        self.store
            .get_tracked_account(account_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("tracked account {account_id}")))
    }

    /// Resolve the remote id if needed, then classify the account's remote titles.
    /// `None` when the service does not know the account.
    #[instrument(skip(self, account), fields(account_id = %account.id, service = %account.gaming_service))]
    pub async fn discover_account(
        &self,
        account: &TrackedAccount,
        depth: SyncDepth,
    ) -> SyncResult<Option<AccountDiscovery>> {
        let service = self.services.get(account.gaming_service)?;
        let store = self.store.as_ref();
        let Some(service_account_id) =
            discovery::ensure_service_account_id(store, service.as_ref(), account).await?
        else {
            warn!(user = %account.account_user_name, "skipping discovery for unresolved account");
            return Ok(None);
        };
        let result =
            discovery::discover(store, service.as_ref(), account, &service_account_id, depth)
                .await?;
        let changed = discovery::titles_needing_progress_update(store, account, &result).await?;
        Ok(Some(AccountDiscovery {
            service_account_id,
            result,
            changed,
        }))
    }

    /// Fetch a title definition and upsert it. Also used to refresh stale titles.
    #[instrument(skip(self), fields(service = %title.gaming_service, title = %title.service_title_id))]
    pub async fn add_title(&self, title: &TitleRef) -> SyncResult<Game> {
        let service = self.services.get(title.gaming_service)?;
        let mapped = service.fetch_title(title).await?;
        merge::add_title(self.store.as_ref(), &mapped).await
    }

    /// Fetch an account's earned set for one title, merge it and emit milestones.
    #[instrument(skip(self, account), fields(account_id = %account.id, title = %title.service_title_id))]
    pub async fn sync_progress(
        &self,
        account: &TrackedAccount,
        title: &TitleRef,
    ) -> SyncResult<ProgressRun> {
        let service = self.services.get(account.gaming_service)?;
        let store = self.store.as_ref();
        let Some(service_account_id) =
            discovery::ensure_service_account_id(store, service.as_ref(), account).await?
        else {
            return Ok(ProgressRun::AccountUnresolved);
        };

        let game = match store
            .find_game(title.gaming_service, &title.service_title_id)
            .await?
        {
            Some(game) => game,
            None => {
                info!("title not stored yet; adding it first");
                self.add_title(title).await?
            }
        };

        let earned = service.fetch_earned(&service_account_id, title).await?;
        match merge::sync_title_progress(store, &game, account.id, &earned).await? {
            ProgressSyncStatus::Merged(outcome) => {
                let settings = MilestoneSettings::from(&*self.config);
                let events =
                    milestones::emit_milestones(store, account, &outcome, &settings).await?;
                info!(
                    earned = outcome.earned.len(),
                    total = outcome.achievements.len(),
                    new = outcome.newly_earned.len(),
                    events = events.len(),
                    "progress merged"
                );
                Ok(ProgressRun::Merged { outcome, events })
            }
            ProgressSyncStatus::MarkedStale { game_id, missing } => {
                Ok(ProgressRun::MarkedStale { game_id, missing })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemorySyncStore;
    use crate::models::GamingService;
    use crate::sync::testing::{earned, mapped_title, tracked_account, FakeService};

    #[tokio::test]
    async fn progress_for_an_unknown_title_adds_it_first() {
        let store = Arc::new(MemorySyncStore::new());
        let mut account = tracked_account(GamingService::Xbox, "gt", 48);
        account.service_account_id = Some("2533".into());
        store.insert_account(account.clone()).await;

        let title = mapped_title(GamingService::Xbox, "1234", 2, |_| Some(50));
        let fake = Arc::new(FakeService::new(GamingService::Xbox).with_title(title.clone()));
        fake.set_earned("2533", "1234", vec![earned("a1", false)]);
        let engine = SyncEngine::new(
            store.clone(),
            ServiceRegistry::new().with(fake.clone()),
            Arc::new(SyncConfig::default()),
        );

        let run = engine
            .sync_progress(&account, &title.game.title_ref())
            .await
            .unwrap();
        let ProgressRun::Merged { outcome, events } = run else {
            panic!("expected a merge")
        };
        assert!(outcome.created);
        assert_eq!(outcome.earned.len(), 1);
        assert!(events.is_empty());
        assert_eq!(FakeService::calls(&fake.fetch_title_calls), 1);
        assert_eq!(store.games().await.len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_service_is_an_error() {
        let store = Arc::new(MemorySyncStore::new());
        let account = tracked_account(GamingService::Psn, "nobody", 48);
        let config = Arc::new(SyncConfig::default());
        let engine = SyncEngine::new(store, ServiceRegistry::new(), config);
        let err = engine
            .discover_account(&account, SyncDepth::Full)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no configured clients"));
    }
}
