//! Game upserts and progress merges.
//!
//! Earned achievements are resolved against the stored achievement set before anything is
//! written; an earned id the game does not know yet aborts the merge and leaves stored
//! progress untouched.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::database_ops::store::SyncStore;
use crate::error::{SyncError, SyncResult};
use crate::models::{Game, GameAchievement, NewEarnedAchievement, UserGameProgress};
use crate::normalization::{EarnedAchievement, MappedTitle};

/// Result of one create or update merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub game: Game,
    pub progress: UserGameProgress,
    /// Every stored achievement of the game.
    pub achievements: Vec<GameAchievement>,
    /// Earned set after the merge.
    pub earned: Vec<NewEarnedAchievement>,
    /// Achievement ids earned now that were not earned before this merge.
    pub newly_earned: Vec<Uuid>,
    pub created: bool,
}

impl MergeOutcome {
    pub fn is_complete(&self) -> bool {
        is_complete(self.earned.len(), self.achievements.len())
    }

    pub fn added_earned_rows(&self) -> bool {
        !self.newly_earned.is_empty()
    }

    pub fn achievement(&self, id: Uuid) -> Option<&GameAchievement> {
        self.achievements.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone)]
pub enum ProgressSyncStatus {
    Merged(MergeOutcome),
    /// Earned ids were unknown; the game was flagged for refresh and progress left as is.
    MarkedStale { game_id: Uuid, missing: Vec<String> },
}

/// A title with no achievements is never complete.
pub fn is_complete(earned: usize, total: usize) -> bool {
    total > 0 && earned >= total
}

/// Upsert the game and its achievement set. Running it twice stores the same rows.
#[instrument(skip(store, title), fields(service = %title.game.gaming_service, title = %title.game.service_title_id))]
pub async fn add_title(store: &dyn SyncStore, title: &MappedTitle) -> SyncResult<Game> {
    let game = store.upsert_game(&title.game).await?;
    let inserted = store.upsert_achievements(game.id, &title.achievements).await?;
    debug!(game_id = %game.id, inserted, total = title.achievements.len(), "title stored");
    Ok(game)
}

/// Map remote earned ids onto stored achievement ids. Duplicate remote rows collapse to
/// the first one.
pub fn resolve_earned(
    game_id: Uuid,
    achievements: &[GameAchievement],
    earned: &[EarnedAchievement],
) -> SyncResult<Vec<NewEarnedAchievement>> {
    let by_service_id: HashMap<&str, Uuid> = achievements
        .iter()
        .map(|a| (a.service_achievement_id.as_str(), a.id))
        .collect();
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    let mut out = Vec::with_capacity(earned.len());
    for e in earned {
        match by_service_id.get(e.service_achievement_id.as_str()) {
            Some(id) => {
                if seen.insert(*id) {
                    out.push(NewEarnedAchievement {
                        game_achievement_id: *id,
                        earned_on: e.earned_on,
                        earned_hardcore_on: e.earned_hardcore_on,
                    });
                }
            }
            None => missing.push(e.service_achievement_id.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(SyncError::UnresolvedAchievements { game_id, missing });
    }
    Ok(out)
}

#[instrument(skip(store, game, earned), fields(game_id = %game.id, earned = earned.len()))]
pub async fn create_progress(
    store: &dyn SyncStore,
    game: &Game,
    account_id: Uuid,
    earned: &[EarnedAchievement],
) -> SyncResult<MergeOutcome> {
    let achievements = store.list_game_achievements(game.id).await?;
    let resolved = resolve_earned(game.id, &achievements, earned)?;
    let progress = store.create_progress(account_id, game.id, &resolved).await?;
    Ok(MergeOutcome {
        game: game.clone(),
        progress,
        achievements,
        newly_earned: resolved.iter().map(|e| e.game_achievement_id).collect(),
        earned: resolved,
        created: true,
    })
}

/// Replace the earned set of an existing progress row.
#[instrument(skip(store, game, existing, earned), fields(game_id = %game.id, progress_id = %existing.id))]
pub async fn update_progress(
    store: &dyn SyncStore,
    game: &Game,
    existing: &UserGameProgress,
    earned: &[EarnedAchievement],
) -> SyncResult<MergeOutcome> {
    let achievements = store.list_game_achievements(game.id).await?;
    let resolved = resolve_earned(game.id, &achievements, earned)?;
    let before: HashSet<Uuid> = store
        .list_earned(existing.id)
        .await?
        .into_iter()
        .map(|e| e.game_achievement_id)
        .collect();
    store.replace_earned_achievements(existing.id, &resolved).await?;
    let newly_earned = resolved
        .iter()
        .map(|e| e.game_achievement_id)
        .filter(|id| !before.contains(id))
        .collect();
    Ok(MergeOutcome {
        game: game.clone(),
        progress: existing.clone(),
        achievements,
        earned: resolved,
        newly_earned,
        created: false,
    })
}

/// Create or update progress for one account and title.
pub async fn sync_title_progress(
    store: &dyn SyncStore,
    game: &Game,
    account_id: Uuid,
    earned: &[EarnedAchievement],
) -> SyncResult<ProgressSyncStatus> {
    let merged = match store.find_progress(account_id, game.id).await? {
        None => create_progress(store, game, account_id, earned).await,
        Some(existing) => update_progress(store, game, &existing, earned).await,
    };
    match merged {
        Ok(outcome) => Ok(ProgressSyncStatus::Merged(outcome)),
        Err(SyncError::UnresolvedAchievements { game_id, missing }) => {
            warn!(%game_id, missing = missing.len(), "earned achievements unknown; marking game stale");
            store.mark_game_stale(game_id).await?;
            Ok(ProgressSyncStatus::MarkedStale { game_id, missing })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemorySyncStore;
    use crate::models::GamingService;
    use crate::sync::testing::{earned, mapped_title, tracked_account};

    async fn seeded(store: &MemorySyncStore, n: usize) -> (Game, Uuid) {
        let account = tracked_account(GamingService::Xbox, "gamer", 48);
        store.insert_account(account.clone()).await;
        let title = mapped_title(GamingService::Xbox, "1000", n, |_| Some(10));
        let game = add_title(store, &title).await.unwrap();
        (game, account.id)
    }

    #[test]
    fn completion_needs_every_achievement() {
        assert!(is_complete(10, 10));
        assert!(!is_complete(9, 10));
        assert!(!is_complete(0, 0));
    }

    #[tokio::test]
    async fn adding_a_title_twice_is_idempotent() {
        let store = MemorySyncStore::new();
        let title = mapped_title(GamingService::Psn, "NPWR1_00", 3, |_| None);
        let first = add_title(&store, &title).await.unwrap();
        let second = add_title(&store, &title).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.games().await.len(), 1);
        assert_eq!(store.list_game_achievements(first.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn replacing_progress_twice_keeps_one_row_per_achievement() {
        let store = MemorySyncStore::new();
        let (game, account_id) = seeded(&store, 4).await;
        let remote = vec![earned("a0", false), earned("a1", false)];

        let first = sync_title_progress(&store, &game, account_id, &remote).await.unwrap();
        let ProgressSyncStatus::Merged(first) = first else {
            panic!("expected merge")
        };
        assert!(first.created);
        assert_eq!(first.newly_earned.len(), 2);

        let again = sync_title_progress(&store, &game, account_id, &remote).await.unwrap();
        let ProgressSyncStatus::Merged(again) = again else {
            panic!("expected merge")
        };
        assert!(!again.created);
        assert!(again.newly_earned.is_empty());
        assert_eq!(store.list_earned(again.progress.id).await.unwrap().len(), 2);
        assert_eq!(store.count_progress_rows(account_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_reports_only_new_unlocks() {
        let store = MemorySyncStore::new();
        let (game, account_id) = seeded(&store, 4).await;
        sync_title_progress(&store, &game, account_id, &[earned("a0", false)])
            .await
            .unwrap();
        let status = sync_title_progress(
            &store,
            &game,
            account_id,
            &[earned("a0", false), earned("a3", false), earned("a3", false)],
        )
        .await
        .unwrap();
        let ProgressSyncStatus::Merged(outcome) = status else {
            panic!("expected merge")
        };
        assert_eq!(outcome.earned.len(), 2);
        assert_eq!(outcome.newly_earned.len(), 1);
        assert_eq!(
            outcome.achievement(outcome.newly_earned[0]).unwrap().service_achievement_id,
            "a3"
        );
    }

    #[tokio::test]
    async fn unknown_ids_mark_stale_and_leave_progress_alone() {
        let store = MemorySyncStore::new();
        let (game, account_id) = seeded(&store, 2).await;
        sync_title_progress(&store, &game, account_id, &[earned("a0", false)])
            .await
            .unwrap();

        let status = sync_title_progress(
            &store,
            &game,
            account_id,
            &[earned("a0", false), earned("a9", false)],
        )
        .await
        .unwrap();
        match status {
            ProgressSyncStatus::MarkedStale { missing, .. } => assert_eq!(missing, vec!["a9"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.get_game(game.id).await.unwrap().unwrap().is_stale);
        let progress = store.find_progress(account_id, game.id).await.unwrap().unwrap();
        assert_eq!(store.list_earned(progress.id).await.unwrap().len(), 1);
    }
}
