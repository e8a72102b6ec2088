use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::SyncStore;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Game, GameAchievement, GamingService, LocalProgressTotals, NewEarnedAchievement,
    NewTrackedEvent, PsnServiceName, StoredTitle, TrackedAccount, TrackedEvent, TrackedEventKind,
    TrophyKind, UserEarnedAchievement, UserGameProgress, XboxTitleKind,
};
use crate::normalization::{MappedGame, MappedGameAchievement};
use crate::util::db::Db;

const GAME_COLUMNS: &str = "id, gaming_service, service_title_id, name, platforms, cover_image_url, \
     known_player_count, known_completionist_count, is_stale, xbox_title_kind, psn_service_name, \
     created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, gaming_service, account_user_name, service_account_id, \
     is_high_priority, created_at";

#[derive(Clone)]
pub struct PgSyncStore {
    db: Db,
}

impl PgSyncStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn parse_service(raw: &str) -> SyncResult<GamingService> {
    raw.parse().map_err(SyncError::Contract)
}

fn account_from_row(row: &PgRow) -> SyncResult<TrackedAccount> {
    Ok(TrackedAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        gaming_service: parse_service(row.try_get("gaming_service")?)?,
        account_user_name: row.try_get("account_user_name")?,
        service_account_id: row.try_get("service_account_id")?,
        is_high_priority: row.try_get("is_high_priority")?,
        created_at: row.try_get("created_at")?,
    })
}

fn game_from_row(row: &PgRow) -> SyncResult<Game> {
    let xbox: Option<String> = row.try_get("xbox_title_kind")?;
    let psn: Option<String> = row.try_get("psn_service_name")?;
    Ok(Game {
        id: row.try_get("id")?,
        gaming_service: parse_service(row.try_get("gaming_service")?)?,
        service_title_id: row.try_get("service_title_id")?,
        name: row.try_get("name")?,
        platforms: row.try_get("platforms")?,
        cover_image_url: row.try_get("cover_image_url")?,
        known_player_count: row.try_get("known_player_count")?,
        known_completionist_count: row.try_get("known_completionist_count")?,
        is_stale: row.try_get("is_stale")?,
        xbox_title_kind: xbox.as_deref().and_then(XboxTitleKind::parse),
        psn_service_name: psn.as_deref().and_then(PsnServiceName::parse),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn achievement_from_row(row: &PgRow) -> SyncResult<GameAchievement> {
    let kind: Option<String> = row.try_get("psn_trophy_kind")?;
    Ok(GameAchievement {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        service_achievement_id: row.try_get("service_achievement_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        vanilla_points: row.try_get("vanilla_points")?,
        ratio_points: row.try_get("ratio_points")?,
        gamerscore: row.try_get("gamerscore")?,
        earn_rate: row.try_get("earn_rate")?,
        psn_trophy_kind: kind.as_deref().and_then(TrophyKind::from_service),
        image_url: row.try_get("image_url")?,
    })
}

fn progress_from_row(row: &PgRow) -> SyncResult<UserGameProgress> {
    Ok(UserGameProgress {
        id: row.try_get("id")?,
        tracked_account_id: row.try_get("tracked_account_id")?,
        game_id: row.try_get("game_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_earned_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    progress_id: Uuid,
    earned: &[NewEarnedAchievement],
) -> SyncResult<()> {
    if earned.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO user_earned_achievements \
         (id, game_progress_id, game_achievement_id, earned_on, earned_hardcore_on) ",
    );
    qb.push_values(earned, |mut b, e| {
        b.push_bind(Uuid::new_v4());
        b.push_bind(progress_id);
        b.push_bind(e.game_achievement_id);
        b.push_bind(e.earned_on);
        b.push_bind(e.earned_hardcore_on);
    });
    qb.build().persistent(false).execute(&mut **tx).await?;
    Ok(())
}

#[async_trait]
impl SyncStore for PgSyncStore {
    #[instrument(skip(self))]
    async fn get_tracked_account(&self, id: Uuid) -> SyncResult<Option<TrackedAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM tracked_accounts WHERE id = $1"
        ))
        .persistent(false)
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_priority_accounts(
        &self,
        service: Option<GamingService>,
    ) -> SyncResult<Vec<TrackedAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM tracked_accounts \
             WHERE is_high_priority AND ($1::text IS NULL OR gaming_service = $1) \
             ORDER BY created_at ASC"
        ))
        .persistent(false)
        .bind(service.map(|s| s.as_str()))
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_service_account_id(
        &self,
        account_id: Uuid,
        service_account_id: &str,
    ) -> SyncResult<()> {
        let res = sqlx::query("UPDATE tracked_accounts SET service_account_id = $2 WHERE id = $1")
            .persistent(false)
            .bind(account_id)
            .bind(service_account_id)
            .execute(&self.db.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("tracked account {account_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, service_title_ids), fields(count = service_title_ids.len()))]
    async fn find_stored_titles(
        &self,
        service: GamingService,
        service_title_ids: &[String],
    ) -> SyncResult<Vec<StoredTitle>> {
        if service_title_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, service_title_id, is_stale FROM games \
             WHERE gaming_service = $1 AND service_title_id = ANY($2)",
        )
        .persistent(false)
        .bind(service.as_str())
        .bind(service_title_ids)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter()
            .map(|r| -> SyncResult<StoredTitle> {
                Ok(StoredTitle {
                    game_id: r.try_get("id")?,
                    service_title_id: r.try_get("service_title_id")?,
                    is_stale: r.try_get("is_stale")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_game(
        &self,
        service: GamingService,
        service_title_id: &str,
    ) -> SyncResult<Option<Game>> {
        let row = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE gaming_service = $1 AND service_title_id = $2"
        ))
        .persistent(false)
        .bind(service.as_str())
        .bind(service_title_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_game(&self, game_id: Uuid) -> SyncResult<Option<Game>> {
        let row = sqlx::query(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = $1"))
            .persistent(false)
            .bind(game_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    #[instrument(skip(self, game), fields(service = %game.gaming_service, title = %game.service_title_id))]
    async fn upsert_game(&self, game: &MappedGame) -> SyncResult<Game> {
        let row = sqlx::query(&format!(
            "INSERT INTO games (id, gaming_service, service_title_id, name, platforms, \
                 cover_image_url, known_player_count, known_completionist_count, is_stale, \
                 xbox_title_kind, psn_service_name, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9, $10, now(), now()) \
             ON CONFLICT (gaming_service, service_title_id) DO UPDATE SET \
                 name = EXCLUDED.name, \
                 platforms = EXCLUDED.platforms, \
                 cover_image_url = COALESCE(EXCLUDED.cover_image_url, games.cover_image_url), \
                 known_player_count = COALESCE(EXCLUDED.known_player_count, games.known_player_count), \
                 known_completionist_count = COALESCE(EXCLUDED.known_completionist_count, games.known_completionist_count), \
                 xbox_title_kind = EXCLUDED.xbox_title_kind, \
                 psn_service_name = EXCLUDED.psn_service_name, \
                 is_stale = false, \
                 updated_at = now() \
             RETURNING {GAME_COLUMNS}"
        ))
        .persistent(false)
        .bind(Uuid::new_v4())
        .bind(game.gaming_service.as_str())
        .bind(&game.service_title_id)
        .bind(&game.name)
        .bind(&game.platforms)
        .bind(&game.cover_image_url)
        .bind(game.known_player_count)
        .bind(game.known_completionist_count)
        .bind(game.discriminator.xbox_title_kind().map(|k| k.as_str()))
        .bind(game.discriminator.psn_service_name().map(|n| n.as_str()))
        .fetch_one(&self.db.pool)
        .await?;
        game_from_row(&row)
    }

    #[instrument(skip(self, achievements), fields(count = achievements.len()))]
    async fn upsert_achievements(
        &self,
        game_id: Uuid,
        achievements: &[MappedGameAchievement],
    ) -> SyncResult<usize> {
        if achievements.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0usize;
        let mut tx = self.db.pool.begin().await?;
        // Postgres caps bind parameters at 65535; 11 per row.
        for chunk in achievements.chunks(1000) {
            let mut qb = QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO game_achievements (id, game_id, service_achievement_id, name, \
                 description, vanilla_points, ratio_points, gamerscore, earn_rate, \
                 psn_trophy_kind, image_url) ",
            );
            qb.push_values(chunk, |mut b, a| {
                b.push_bind(Uuid::new_v4());
                b.push_bind(game_id);
                b.push_bind(&a.service_achievement_id);
                b.push_bind(&a.name);
                b.push_bind(&a.description);
                b.push_bind(a.vanilla_points);
                b.push_bind(a.ratio_points);
                b.push_bind(a.gamerscore);
                b.push_bind(a.earn_rate);
                b.push_bind(a.psn_trophy_kind.map(|k| k.as_str().to_ascii_lowercase()));
                b.push_bind(&a.image_url);
            });
            qb.push(
                " ON CONFLICT (game_id, service_achievement_id) DO UPDATE SET \
                   name = EXCLUDED.name, \
                   description = EXCLUDED.description, \
                   vanilla_points = EXCLUDED.vanilla_points, \
                   ratio_points = EXCLUDED.ratio_points, \
                   gamerscore = EXCLUDED.gamerscore, \
                   earn_rate = EXCLUDED.earn_rate, \
                   psn_trophy_kind = EXCLUDED.psn_trophy_kind, \
                   image_url = COALESCE(EXCLUDED.image_url, game_achievements.image_url), \
                   updated_at = now() \
                 RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().persistent(false).fetch_all(&mut *tx).await?;
            for r in rows {
                if r.try_get::<bool, _>("inserted")? {
                    inserted += 1;
                }
            }
        }
        tx.commit().await?;
        debug!(%game_id, inserted, "achievements upserted");
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn list_game_achievements(&self, game_id: Uuid) -> SyncResult<Vec<GameAchievement>> {
        let rows = sqlx::query(
            "SELECT id, game_id, service_achievement_id, name, description, vanilla_points, \
                    ratio_points, gamerscore, earn_rate, psn_trophy_kind, image_url \
             FROM game_achievements WHERE game_id = $1 ORDER BY service_achievement_id",
        )
        .persistent(false)
        .bind(game_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(achievement_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_game_stale(&self, game_id: Uuid) -> SyncResult<()> {
        sqlx::query("UPDATE games SET is_stale = true, updated_at = now() WHERE id = $1")
            .persistent(false)
            .bind(game_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_stale_games(&self, service: GamingService, limit: i64) -> SyncResult<Vec<Game>> {
        let rows = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE gaming_service = $1 AND is_stale \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .persistent(false)
        .bind(service.as_str())
        .bind(limit.max(0))
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(game_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn find_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
    ) -> SyncResult<Option<UserGameProgress>> {
        let row = sqlx::query(
            "SELECT id, tracked_account_id, game_id, created_at, updated_at \
             FROM user_game_progress WHERE tracked_account_id = $1 AND game_id = $2",
        )
        .persistent(false)
        .bind(account_id)
        .bind(game_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(progress_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn count_progress_rows(&self, account_id: Uuid) -> SyncResult<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_game_progress WHERE tracked_account_id = $1",
        )
        .persistent(false)
        .bind(account_id)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(n)
    }

    #[instrument(skip(self, earned), fields(earned = earned.len()))]
    async fn create_progress(
        &self,
        account_id: Uuid,
        game_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<UserGameProgress> {
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO user_game_progress (id, tracked_account_id, game_id, created_at, updated_at) \
             VALUES ($1, $2, $3, now(), now()) \
             RETURNING id, tracked_account_id, game_id, created_at, updated_at",
        )
        .persistent(false)
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(game_id)
        .fetch_one(&mut *tx)
        .await?;
        let progress = progress_from_row(&row)?;
        insert_earned_rows(&mut tx, progress.id, earned).await?;
        tx.commit().await?;
        Ok(progress)
    }

    #[instrument(skip(self, earned), fields(earned = earned.len()))]
    async fn replace_earned_achievements(
        &self,
        progress_id: Uuid,
        earned: &[NewEarnedAchievement],
    ) -> SyncResult<()> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("DELETE FROM user_earned_achievements WHERE game_progress_id = $1")
            .persistent(false)
            .bind(progress_id)
            .execute(&mut *tx)
            .await?;
        insert_earned_rows(&mut tx, progress_id, earned).await?;
        sqlx::query("UPDATE user_game_progress SET updated_at = now() WHERE id = $1")
            .persistent(false)
            .bind(progress_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_earned(&self, progress_id: Uuid) -> SyncResult<Vec<UserEarnedAchievement>> {
        let rows = sqlx::query(
            "SELECT id, game_progress_id, game_achievement_id, earned_on, earned_hardcore_on \
             FROM user_earned_achievements WHERE game_progress_id = $1",
        )
        .persistent(false)
        .bind(progress_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter()
            .map(|r| -> SyncResult<UserEarnedAchievement> {
                Ok(UserEarnedAchievement {
                    id: r.try_get("id")?,
                    game_progress_id: r.try_get("game_progress_id")?,
                    game_achievement_id: r.try_get("game_achievement_id")?,
                    earned_on: r.try_get("earned_on")?,
                    earned_hardcore_on: r.try_get("earned_hardcore_on")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, game_ids), fields(games = game_ids.len()))]
    async fn local_progress_totals(
        &self,
        account_id: Uuid,
        game_ids: &[Uuid],
    ) -> SyncResult<HashMap<Uuid, LocalProgressTotals>> {
        if game_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT p.game_id, \
                    COUNT(e.id)::bigint AS earned_count, \
                    COALESCE(SUM(COALESCE(a.gamerscore, a.vanilla_points, 0)), 0)::bigint AS earned_points \
             FROM user_game_progress p \
             LEFT JOIN user_earned_achievements e ON e.game_progress_id = p.id \
             LEFT JOIN game_achievements a ON a.id = e.game_achievement_id \
             WHERE p.tracked_account_id = $1 AND p.game_id = ANY($2) \
             GROUP BY p.game_id",
        )
        .persistent(false)
        .bind(account_id)
        .bind(game_ids)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.insert(
                r.try_get("game_id")?,
                LocalProgressTotals {
                    earned_count: r.try_get("earned_count")?,
                    earned_points: r.try_get("earned_points")?,
                },
            );
        }
        Ok(out)
    }

    #[instrument(skip(self, event), fields(kind = event.kind.as_str()))]
    async fn insert_tracked_event(&self, event: &NewTrackedEvent) -> SyncResult<TrackedEvent> {
        let row = sqlx::query(
            "INSERT INTO tracked_events (id, kind, tracked_account_id, event_data, created_at) \
             VALUES ($1, $2, $3, $4, now()) \
             RETURNING id, kind, tracked_account_id, event_data, created_at",
        )
        .persistent(false)
        .bind(Uuid::new_v4())
        .bind(event.kind.as_str())
        .bind(event.tracked_account_id)
        .bind(&event.event_data)
        .fetch_one(&self.db.pool)
        .await?;
        let kind: String = row.try_get("kind")?;
        Ok(TrackedEvent {
            id: row.try_get("id")?,
            kind: TrackedEventKind::parse(&kind)
                .ok_or_else(|| SyncError::Contract(format!("unknown event kind {kind}")))?,
            tracked_account_id: row.try_get("tracked_account_id")?,
            event_data: row.try_get("event_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
