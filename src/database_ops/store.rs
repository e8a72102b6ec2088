use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{
    GameAchievement, Game, GamingService, LocalProgressTotals, NewEarnedAchievement,
    NewTrackedEvent, StoredTitle, TrackedAccount, TrackedEvent, UserEarnedAchievement,
    UserGameProgress,
};
use crate::normalization::{MappedGame, MappedGameAchievement};

/// Persistence used by discovery, merge and the job handlers.
///
/// Games and achievements are upserted by natural key and never deleted. A progress row's
/// earned set is replaced as a whole, inside one transaction.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_tracked_account(&self, id: Uuid) -> SyncResult<Option<TrackedAccount>>;

    /// High-priority accounts, optionally restricted to one service.
    async fn list_priority_accounts(
        &self,
        service: Option<GamingService>,
    ) -> SyncResult<Vec<TrackedAccount>>;

    async fn set_service_account_id(&self, account_id: Uuid, service_account_id: &str)
        -> SyncResult<()>;

    async fn find_stored_titles(
        &self,
        service: GamingService,
        service_title_ids: &[String],
    ) -> SyncResult<Vec<StoredTitle>>;

    async fn find_game(
        &self,
        service: GamingService,
        service_title_id: &str,
    ) -> SyncResult<Option<Game>>;

    async fn get_game(&self, game_id: Uuid) -> SyncResult<Option<Game>>;

    /// Insert or update by (service, service title id). Always clears `is_stale`.
    async fn upsert_game(&self, game: &MappedGame) -> SyncResult<Game>;

    /// Insert new achievements and refresh name/description/rewards on existing ones.
    /// Returns the number of newly inserted rows.
    async fn upsert_achievements(
        &self,
        game_id: Uuid,
        achievements: &[MappedGameAchievement],
    ) -> SyncResult<usize>;

    async fn list_game_achievements(&self, game_id: Uuid) -> SyncResult<Vec<GameAchievement>>;

    async fn mark_game_stale(&self, game_id: Uuid) -> SyncResult<()>;

    async fn list_stale_games(&self, service: GamingService, limit: i64) -> SyncResult<Vec<Game>>;

    async fn find_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
    ) -> SyncResult<Option<UserGameProgress>>;

    async fn count_progress_rows(&self, account_id: Uuid) -> SyncResult<i64>;

    /// Create the progress row and its earned children as one unit.
    async fn create_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<UserGameProgress>;

    /// Delete every earned row of `progress_id` and insert `earned`, in one transaction.
    async fn replace_earned_achievements(
        &self,
        progress_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<()>;

    async fn list_earned(&self, progress_id: Uuid) -> SyncResult<Vec<UserEarnedAchievement>>;

    /// Earned count and points per game for one account. Games without progress are absent.
    async fn local_progress_totals(
        &self,
        account_id: Uuid,
        game_ids: &[Uuid],
    ) -> SyncResult<HashMap<Uuid, LocalProgressTotals>>;

    async fn insert_tracked_event(&self, event: &NewTrackedEvent) -> SyncResult<TrackedEvent>;
}
