//! In-process `SyncStore` used by tests and dry runs. Mirrors the unique keys of the SQL schema.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::SyncStore;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Game, GameAchievement, GamingService, LocalProgressTotals, NewEarnedAchievement,
    NewTrackedEvent, StoredTitle, TrackedAccount, TrackedEvent, UserEarnedAchievement,
    UserGameProgress,
};
use crate::normalization::{MappedGame, MappedGameAchievement};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, TrackedAccount>,
    games: HashMap<Uuid, Game>,
    achievements: HashMap<Uuid, GameAchievement>,
    progress: HashMap<Uuid, UserGameProgress>,
    earned: HashMap<Uuid, UserEarnedAchievement>,
    events: Vec<TrackedEvent>,
}

#[derive(Default, Clone)]
pub struct MemorySyncStore {
    state: Arc<Mutex<State>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: TrackedAccount) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn events(&self) -> Vec<TrackedEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn games(&self) -> Vec<Game> {
        self.state.lock().await.games.values().cloned().collect()
    }
}

fn find_game_key(state: &State, service: GamingService, title_id: &str) -> Option<Uuid> {
    state
        .games
        .values()
        .find(|g| g.gaming_service == service && g.service_title_id == title_id)
        .map(|g| g.id)
}

fn check_earned(state: &State, game_id: Uuid, earned: &[NewEarnedAchievement]) -> SyncResult<()> {
    let mut seen = std::collections::HashSet::new();
    for e in earned {
        match state.achievements.get(&e.game_achievement_id) {
            Some(a) if a.game_id == game_id => {}
            _ => {
                return Err(SyncError::Contract(format!(
                    "achievement {} does not belong to game {game_id}",
                    e.game_achievement_id
                )))
            }
        }
        if !seen.insert(e.game_achievement_id) {
            return Err(SyncError::Contract(format!(
                "duplicate earned achievement {}",
                e.game_achievement_id
            )));
        }
    }
    Ok(())
}

fn insert_earned(state: &mut State, progress_id: Uuid, earned: &[NewEarnedAchievement]) {
    for e in earned {
        let id = Uuid::new_v4();
        state.earned.insert(
            id,
            UserEarnedAchievement {
                id,
                game_progress_id: progress_id,
                game_achievement_id: e.game_achievement_id,
                earned_on: e.earned_on,
                earned_hardcore_on: e.earned_hardcore_on,
            },
        );
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get_tracked_account(&self, id: Uuid) -> SyncResult<Option<TrackedAccount>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn list_priority_accounts(
        &self,
        service: Option<GamingService>,
    ) -> SyncResult<Vec<TrackedAccount>> {
        let st = self.state.lock().await;
        let mut out: Vec<TrackedAccount> = st
            .accounts
            .values()
            .filter(|a| a.is_high_priority)
            .filter(|a| service.map_or(true, |s| a.gaming_service == s))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn set_service_account_id(
        &self,
        account_id: Uuid,
        service_account_id: &str,
    ) -> SyncResult<()> {
        let mut st = self.state.lock().await;
        let account = st
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| SyncError::NotFound(format!("tracked account {account_id}")))?;
        account.service_account_id = Some(service_account_id.to_string());
        Ok(())
    }

    async fn find_stored_titles(
        &self,
        service: GamingService,
        service_title_ids: &[String],
    ) -> SyncResult<Vec<StoredTitle>> {
        let st = self.state.lock().await;
        Ok(st
            .games
            .values()
            .filter(|g| {
                g.gaming_service == service && service_title_ids.contains(&g.service_title_id)
            })
            .map(|g| StoredTitle {
                game_id: g.id,
                service_title_id: g.service_title_id.clone(),
                is_stale: g.is_stale,
            })
            .collect())
    }

    async fn find_game(
        &self,
        service: GamingService,
        service_title_id: &str,
    ) -> SyncResult<Option<Game>> {
        let st = self.state.lock().await;
        Ok(find_game_key(&st, service, service_title_id).and_then(|id| st.games.get(&id).cloned()))
    }

    async fn get_game(&self, game_id: Uuid) -> SyncResult<Option<Game>> {
        Ok(self.state.lock().await.games.get(&game_id).cloned())
    }

    async fn upsert_game(&self, game: &MappedGame) -> SyncResult<Game> {
        let mut st = self.state.lock().await;
        let now = Utc::now();
        let existing = find_game_key(&st, game.gaming_service, &game.service_title_id);
        let row = match existing.and_then(|id| st.games.get_mut(&id)) {
            Some(row) => {
                row.name = game.name.clone();
                row.platforms = game.platforms.clone();
                row.cover_image_url = game.cover_image_url.clone().or(row.cover_image_url.take());
                row.known_player_count = game.known_player_count.or(row.known_player_count);
                row.known_completionist_count = game
                    .known_completionist_count
                    .or(row.known_completionist_count);
                row.xbox_title_kind = game.discriminator.xbox_title_kind();
                row.psn_service_name = game.discriminator.psn_service_name();
                row.is_stale = false;
                row.updated_at = now;
                row.clone()
            }
            None => {
                let row = Game {
                    id: Uuid::new_v4(),
                    gaming_service: game.gaming_service,
                    service_title_id: game.service_title_id.clone(),
                    name: game.name.clone(),
                    platforms: game.platforms.clone(),
                    cover_image_url: game.cover_image_url.clone(),
                    known_player_count: game.known_player_count,
                    known_completionist_count: game.known_completionist_count,
                    is_stale: false,
                    xbox_title_kind: game.discriminator.xbox_title_kind(),
                    psn_service_name: game.discriminator.psn_service_name(),
                    created_at: now,
                    updated_at: now,
                };
                st.games.insert(row.id, row.clone());
                row
            }
        };
        Ok(row)
    }

    async fn upsert_achievements(
        &self,
        game_id: Uuid,
        achievements: &[MappedGameAchievement],
    ) -> SyncResult<usize> {
        let mut st = self.state.lock().await;
        let mut inserted = 0;
        for a in achievements {
            let existing = st
                .achievements
                .values_mut()
                .find(|row| {
                    row.game_id == game_id
                        && row.service_achievement_id == a.service_achievement_id
                });
            match existing {
                Some(row) => {
                    row.name = a.name.clone();
                    row.description = Some(a.description.clone());
                    row.vanilla_points = a.vanilla_points;
                    row.ratio_points = a.ratio_points;
                    row.gamerscore = a.gamerscore;
                    row.earn_rate = a.earn_rate;
                    row.psn_trophy_kind = a.psn_trophy_kind;
                    row.image_url = a.image_url.clone();
                }
                None => {
                    let id = Uuid::new_v4();
                    st.achievements.insert(
                        id,
                        GameAchievement {
                            id,
                            game_id,
                            service_achievement_id: a.service_achievement_id.clone(),
                            name: a.name.clone(),
                            description: Some(a.description.clone()),
                            vanilla_points: a.vanilla_points,
                            ratio_points: a.ratio_points,
                            gamerscore: a.gamerscore,
                            earn_rate: a.earn_rate,
                            psn_trophy_kind: a.psn_trophy_kind,
                            image_url: a.image_url.clone(),
                        },
                    );
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn list_game_achievements(&self, game_id: Uuid) -> SyncResult<Vec<GameAchievement>> {
        let st = self.state.lock().await;
        let mut out: Vec<GameAchievement> = st
            .achievements
            .values()
            .filter(|a| a.game_id == game_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.service_achievement_id.cmp(&b.service_achievement_id));
        Ok(out)
    }

    async fn mark_game_stale(&self, game_id: Uuid) -> SyncResult<()> {
        let mut st = self.state.lock().await;
        let game = st
            .games
            .get_mut(&game_id)
            .ok_or_else(|| SyncError::NotFound(format!("game {game_id}")))?;
        game.is_stale = true;
        game.updated_at = Utc::now();
        Ok(())
    }

    async fn list_stale_games(&self, service: GamingService, limit: i64) -> SyncResult<Vec<Game>> {
        let st = self.state.lock().await;
        let mut out: Vec<Game> = st
            .games
            .values()
            .filter(|g| g.gaming_service == service && g.is_stale)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.updated_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn find_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
    ) -> SyncResult<Option<UserGameProgress>> {
        let st = self.state.lock().await;
        Ok(st
            .progress
            .values()
            .find(|p| p.tracked_account_id == account_id && p.game_id == game_id)
            .cloned())
    }

    async fn count_progress_rows(&self, account_id: Uuid) -> SyncResult<i64> {
        let st = self.state.lock().await;
        Ok(st
            .progress
            .values()
            .filter(|p| p.tracked_account_id == account_id)
            .count() as i64)
    }

    async fn create_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<UserGameProgress> {
        let mut st = self.state.lock().await;
        if st
            .progress
            .values()
            .any(|p| p.tracked_account_id == account_id && p.game_id == game_id)
        {
            return Err(SyncError::Contract(format!(
                "progress for account {account_id} and game {game_id} already exists"
            )));
        }
        check_earned(&st, game_id, earned)?;
        let now = Utc::now();
        let row = UserGameProgress {
            id: Uuid::new_v4(),
            tracked_account_id: account_id,
            game_id,
            created_at: now,
            updated_at: now,
        };
        st.progress.insert(row.id, row.clone());
        insert_earned(&mut st, row.id, earned);
        Ok(row)
    }

    async fn replace_earned_achievements(
        &self,
        progress_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<()> {
        let mut st = self.state.lock().await;
        let game_id = st
            .progress
            .get(&progress_id)
            .map(|p| p.game_id)
            .ok_or_else(|| SyncError::NotFound(format!("progress {progress_id}")))?;
        // Validate before mutating so a bad batch leaves the old set intact.
        check_earned(&st, game_id, earned)?;
        st.earned.retain(|_, e| e.game_progress_id != progress_id);
        insert_earned(&mut st, progress_id, earned);
        if let Some(p) = st.progress.get_mut(&progress_id) {
            p.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_earned(&self, progress_id: Uuid) -> SyncResult<Vec<UserEarnedAchievement>> {
        let st = self.state.lock().await;
        Ok(st
            .earned
            .values()
            .filter(|e| e.game_progress_id == progress_id)
            .cloned()
            .collect())
    }

    async fn local_progress_totals(
        &self,
        account_id: Uuid,
        game_ids: &[Uuid],
    ) -> SyncResult<HashMap<Uuid, LocalProgressTotals>> {
        let st = self.state.lock().await;
        let mut out = HashMap::new();
        for p in st
            .progress
            .values()
            .filter(|p| p.tracked_account_id == account_id && game_ids.contains(&p.game_id))
        {
            let mut totals = LocalProgressTotals::default();
            for e in st.earned.values().filter(|e| e.game_progress_id == p.id) {
                totals.earned_count += 1;
                if let Some(a) = st.achievements.get(&e.game_achievement_id) {
                    totals.earned_points += i64::from(a.reward_value().unwrap_or(0));
                }
            }
            out.insert(p.game_id, totals);
        }
        Ok(out)
    }

    async fn insert_tracked_event(&self, event: &NewTrackedEvent) -> SyncResult<TrackedEvent> {
        let row = TrackedEvent {
            id: Uuid::new_v4(),
            kind: event.kind,
            tracked_account_id: event.tracked_account_id,
            event_data: event.event_data.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().await.events.push(row.clone());
        Ok(row)
    }
}
