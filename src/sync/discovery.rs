//! Remote title discovery and classification against the stored games of a service.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::service::{AchievementService, SyncDepth};
use crate::database_ops::store::SyncStore;
use crate::error::SyncResult;
use crate::models::{LocalProgressTotals, StoredTitle, TrackedAccount};
use crate::normalization::{ProgressMetric, RemoteTitleSummary};

/// Every remote title lands in exactly one of the three id lists.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub all_remote_titles: Vec<RemoteTitleSummary>,
    pub existing_title_ids: Vec<String>,
    pub missing_title_ids: Vec<String>,
    pub stale_title_ids: Vec<String>,
    /// Stored game id per known service title id.
    pub game_ids: HashMap<String, Uuid>,
    /// Depth actually used, after the first-sync fallback.
    pub depth: Option<SyncDepth>,
}

impl DiscoveryResult {
    pub fn remote(&self, service_title_id: &str) -> Option<&RemoteTitleSummary> {
        self.all_remote_titles
            .iter()
            .find(|t| t.service_title_id() == service_title_id)
    }
}

/// Drop repeated title ids, keeping the first occurrence.
pub fn dedupe_titles(titles: Vec<RemoteTitleSummary>) -> Vec<RemoteTitleSummary> {
    let mut seen = HashSet::new();
    titles
        .into_iter()
        .filter(|t| seen.insert(t.service_title_id().to_string()))
        .collect()
}

pub fn classify(remote: Vec<RemoteTitleSummary>, stored: &[StoredTitle]) -> DiscoveryResult {
    let by_id: HashMap<&str, &StoredTitle> = stored
        .iter()
        .map(|s| (s.service_title_id.as_str(), s))
        .collect();
    let mut result = DiscoveryResult::default();
    for title in &remote {
        let id = title.service_title_id().to_string();
        match by_id.get(id.as_str()) {
            None => result.missing_title_ids.push(id),
            Some(s) => {
                result.game_ids.insert(id.clone(), s.game_id);
                if s.is_stale {
                    result.stale_title_ids.push(id);
                } else {
                    result.existing_title_ids.push(id);
                }
            }
        }
    }
    result.all_remote_titles = remote;
    result
}

/// Xbox compares gamerscore, the other services compare earned counts.
pub fn needs_update(metric: ProgressMetric, local: Option<&LocalProgressTotals>) -> bool {
    let Some(local) = local else {
        return true;
    };
    match metric {
        ProgressMetric::Gamerscore(score) => score != local.earned_points,
        ProgressMetric::AchievementCount(n) | ProgressMetric::EarnedTrophies(n) => {
            n != local.earned_count
        }
    }
}

#[instrument(skip_all, fields(account_id = %account.id, service = %account.gaming_service))]
pub async fn discover(
    store: &dyn SyncStore,
    service: &dyn AchievementService,
    account: &TrackedAccount,
    service_account_id: &str,
    depth: SyncDepth,
) -> SyncResult<DiscoveryResult> {
    let depth = if depth == SyncDepth::Partial && store.count_progress_rows(account.id).await? == 0
    {
        info!("no stored progress yet; running a full discovery instead");
        SyncDepth::Full
    } else {
        depth
    };

    let mut remote = service.list_titles(service_account_id, depth).await?;
    if depth == SyncDepth::Partial {
        remote.retain(RemoteTitleSummary::has_progress);
    }
    let remote = dedupe_titles(remote);

    let ids: Vec<String> = remote
        .iter()
        .map(|t| t.service_title_id().to_string())
        .collect();
    let stored = store
        .find_stored_titles(account.gaming_service, &ids)
        .await?;
    let mut result = classify(remote, &stored);
    result.depth = Some(depth);
    info!(
        remote = result.all_remote_titles.len(),
        existing = result.existing_title_ids.len(),
        missing = result.missing_title_ids.len(),
        stale = result.stale_title_ids.len(),
        ?depth,
        "discovery classified titles"
    );
    Ok(result)
}

/// Existing titles whose remote progress differs from the stored aggregate.
#[instrument(skip_all, fields(account_id = %account.id))]
pub async fn titles_needing_progress_update(
    store: &dyn SyncStore,
    account: &TrackedAccount,
    result: &DiscoveryResult,
) -> SyncResult<Vec<RemoteTitleSummary>> {
    let game_ids: Vec<Uuid> = result
        .existing_title_ids
        .iter()
        .filter_map(|id| result.game_ids.get(id).copied())
        .collect();
    let totals = store.local_progress_totals(account.id, &game_ids).await?;
    let out: Vec<RemoteTitleSummary> = result
        .existing_title_ids
        .iter()
        .filter_map(|id| {
            let remote = result.remote(id)?;
            let game_id = result.game_ids.get(id)?;
            needs_update(remote.metric, totals.get(game_id)).then(|| remote.clone())
        })
        .collect();
    debug!(changed = out.len(), existing = game_ids.len(), "progress comparison done");
    Ok(out)
}

/// Remote account id, resolved and persisted on first use. `None` when the service does
/// not know the user name.
#[instrument(skip_all, fields(account_id = %account.id, user = %account.account_user_name))]
pub async fn ensure_service_account_id(
    store: &dyn SyncStore,
    service: &dyn AchievementService,
    account: &TrackedAccount,
) -> SyncResult<Option<String>> {
    if let Some(id) = &account.service_account_id {
        return Ok(Some(id.clone()));
    }
    match service.resolve_account_id(&account.account_user_name).await? {
        Some(id) => {
            store.set_service_account_id(account.id, &id).await?;
            info!(service_account_id = %id, "resolved remote account");
            Ok(Some(id))
        }
        None => {
            info!("remote account not found");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemorySyncStore;
    use crate::models::GamingService;
    use crate::sync::merge::{add_title, sync_title_progress};
    use crate::sync::testing::{earned, mapped_title, summary, tracked_account, FakeService};

    fn stored(id: &str, stale: bool) -> StoredTitle {
        StoredTitle {
            game_id: Uuid::new_v4(),
            service_title_id: id.to_string(),
            is_stale: stale,
        }
    }

    #[test]
    fn classification_partitions_remote_titles() {
        let remote = ["1", "2", "3", "4", "5"]
            .iter()
            .map(|id| summary(GamingService::Ra, id, ProgressMetric::AchievementCount(1)))
            .collect();
        let result = classify(
            remote,
            &[stored("2", false), stored("4", true), stored("9", false)],
        );
        assert_eq!(result.existing_title_ids, vec!["2"]);
        assert_eq!(result.stale_title_ids, vec!["4"]);
        assert_eq!(result.missing_title_ids, vec!["1", "3", "5"]);

        let mut all: Vec<String> = result
            .existing_title_ids
            .iter()
            .chain(&result.missing_title_ids)
            .chain(&result.stale_title_ids)
            .cloned()
            .collect();
        all.sort();
        let mut remote_ids: Vec<String> = result
            .all_remote_titles
            .iter()
            .map(|t| t.service_title_id().to_string())
            .collect();
        remote_ids.sort();
        assert_eq!(all, remote_ids);
    }

    #[test]
    fn gamerscore_is_compared_with_points() {
        let local = LocalProgressTotals {
            earned_count: 3,
            earned_points: 60,
        };
        assert!(!needs_update(ProgressMetric::Gamerscore(60), Some(&local)));
        assert!(needs_update(ProgressMetric::Gamerscore(80), Some(&local)));
        assert!(!needs_update(ProgressMetric::EarnedTrophies(3), Some(&local)));
        assert!(needs_update(ProgressMetric::AchievementCount(0), None));
    }

    #[tokio::test]
    async fn partial_without_local_progress_runs_full() {
        let store = MemorySyncStore::new();
        let account = tracked_account(GamingService::Psn, "alice", 48);
        store.insert_account(account.clone()).await;
        let service = FakeService::new(GamingService::Psn);
        service.set_titles(
            "psn-1",
            vec![
                summary(GamingService::Psn, "NPWR1", ProgressMetric::EarnedTrophies(0)),
                summary(GamingService::Psn, "NPWR2", ProgressMetric::EarnedTrophies(2)),
                summary(GamingService::Psn, "NPWR2", ProgressMetric::EarnedTrophies(2)),
            ],
        );

        let result = discover(&store, &service, &account, "psn-1", SyncDepth::Partial)
            .await
            .unwrap();
        assert_eq!(service.last_depth(), Some(SyncDepth::Full));
        assert_eq!(result.depth, Some(SyncDepth::Full));
        assert_eq!(result.missing_title_ids, vec!["NPWR1", "NPWR2"]);
    }

    #[tokio::test]
    async fn partial_keeps_only_titles_with_progress() {
        let store = MemorySyncStore::new();
        let account = tracked_account(GamingService::Ra, "bob", 48);
        store.insert_account(account.clone()).await;
        let game = add_title(&store, &mapped_title(GamingService::Ra, "10", 2, |_| Some(5)))
            .await
            .unwrap();
        sync_title_progress(&store, &game, account.id, &[earned("a0", false)])
            .await
            .unwrap();

        let service = FakeService::new(GamingService::Ra);
        service.set_titles(
            "bob",
            vec![
                summary(GamingService::Ra, "10", ProgressMetric::AchievementCount(2)),
                summary(GamingService::Ra, "11", ProgressMetric::AchievementCount(0)),
            ],
        );
        let result = discover(&store, &service, &account, "bob", SyncDepth::Partial)
            .await
            .unwrap();
        assert_eq!(result.depth, Some(SyncDepth::Partial));
        assert_eq!(result.all_remote_titles.len(), 1);
        assert_eq!(result.existing_title_ids, vec!["10"]);

        let changed = titles_needing_progress_update(&store, &account, &result)
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].service_title_id(), "10");
    }

    #[tokio::test]
    async fn resolution_is_persisted_once_found() {
        let store = MemorySyncStore::new();
        let account = tracked_account(GamingService::Xbox, "Major Nelson", 48);
        store.insert_account(account.clone()).await;
        let service = FakeService::new(GamingService::Xbox).with_account("Major Nelson", "2533");

        let id = ensure_service_account_id(&store, &service, &account)
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("2533"));
        let reloaded = store.get_tracked_account(account.id).await.unwrap().unwrap();
        assert_eq!(reloaded.service_account_id.as_deref(), Some("2533"));

        ensure_service_account_id(&store, &service, &reloaded)
            .await
            .unwrap();
        assert_eq!(FakeService::calls(&service.resolve_calls), 1);
    }

    #[tokio::test]
    async fn unknown_user_resolves_to_none() {
        let store = MemorySyncStore::new();
        let account = tracked_account(GamingService::Ra, "ghost", 48);
        store.insert_account(account.clone()).await;
        let service = FakeService::new(GamingService::Ra);
        assert_eq!(
            ensure_service_account_id(&store, &service, &account)
                .await
                .unwrap(),
            None
        );
    }
}
