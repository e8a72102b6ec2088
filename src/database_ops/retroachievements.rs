//! RetroAchievements web API client.
//!
//! Every call carries `z` (user) and `y` (web API key). Up to three credentials are pooled,
//! each with its own per-minute bucket.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::SyncConfig;
use crate::error::{GatewayError, SyncError, SyncResult};
use crate::gateway::{
    collect_paginated, ClientPool, Cursor, Endpoint, Gateway, Page, PoolStrategy, ServiceLimiter,
};
use crate::models::{GamingService, TitleRef};
use crate::normalization::retroachievements::{
    RaCompletionPage, RaGameExtended, RaGameProgress, RaRecentGame, RaUserProfile,
};
use crate::normalization::{
    map_earned, map_summary, map_title, EarnedAchievement, MappedTitle, NativeEarned, NativeTitle,
    NativeTitleSummary, RemoteTitleSummary,
};
use crate::sync::service::{AchievementService, SyncDepth};

pub const API_BASE: &str = "https://retroachievements.org/API";

/// Largest page `API_GetUserCompletionProgress` serves.
const COMPLETION_PAGE_SIZE: u64 = 500;

pub struct RaClient {
    gateway: Gateway,
    username: String,
    api_key: String,
}

impl RaClient {
    fn endpoint(&self, method: &str) -> Result<Endpoint, GatewayError> {
        Ok(Endpoint::get(&format!("{API_BASE}/{method}.php"))?
            .query("z", &self.username)
            .query("y", &self.api_key))
    }
}

pub struct RetroAchievementsService {
    pool: ClientPool<RaClient>,
    partial_page_size: u32,
}

impl RetroAchievementsService {
    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        let mut members = Vec::with_capacity(cfg.ra_credentials.len());
        for cred in &cfg.ra_credentials {
            let client = RaClient {
                gateway: Gateway::new(GamingService::Ra, cfg.http_timeout)?,
                username: cred.username.clone(),
                api_key: cred.api_key.clone(),
            };
            members.push((
                client,
                ServiceLimiter::per_minute(GamingService::Ra, cfg.ra_reqs_per_min),
            ));
        }
        info!(
            clients = members.len(),
            per_minute = cfg.ra_reqs_per_min,
            "retroachievements pool ready"
        );
        Ok(Self {
            pool: ClientPool::new(GamingService::Ra, members, PoolStrategy::FirstAvailable)?,
            partial_page_size: cfg.partial_sync_page_size,
        })
    }

    async fn call<T, B>(&self, method: &str, build: B) -> SyncResult<T>
    where
        T: serde::de::DeserializeOwned,
        B: FnOnce(Endpoint) -> Endpoint,
    {
        let client = self.pool.acquire().await;
        let endpoint = build(client.endpoint(method)?);
        Ok(client.gateway.fetch_json(endpoint).await?)
    }

    async fn completion_page(
        &self,
        user: &str,
        cursor: Cursor,
    ) -> Result<Page<NativeTitleSummary>, GatewayError> {
        let offset = cursor.offset();
        let client = self.pool.acquire().await;
        let endpoint = client
            .endpoint("API_GetUserCompletionProgress")?
            .query("u", user)
            .query("c", COMPLETION_PAGE_SIZE)
            .query("o", offset);
        let page: RaCompletionPage = client.gateway.fetch_json(endpoint).await?;
        let items = page
            .results
            .into_iter()
            .map(NativeTitleSummary::RaCompletion)
            .collect();
        Ok(Page::at_offset(items, offset, page.total))
    }
}

fn game_id(title: &TitleRef) -> SyncResult<i64> {
    title.service_title_id.parse().map_err(|_| {
        SyncError::Contract(format!("RA game id is not numeric: {}", title.service_title_id))
    })
}

#[async_trait]
impl AchievementService for RetroAchievementsService {
    fn gaming_service(&self) -> GamingService {
        GamingService::Ra
    }

    #[instrument(skip(self))]
    async fn resolve_account_id(&self, user_name: &str) -> SyncResult<Option<String>> {
        let profile: Result<RaUserProfile, SyncError> = self
            .call("API_GetUserProfile", |e| e.query("u", user_name))
            .await;
        match profile {
            Ok(p) if p.user.is_empty() => Ok(None),
            // Accounts predating ULIDs are addressed by name.
            Ok(p) => Ok(Some(p.ulid.unwrap_or(p.user))),
            Err(SyncError::Gateway(GatewayError::Http { status: 404, .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn list_titles(
        &self,
        account_id: &str,
        depth: SyncDepth,
    ) -> SyncResult<Vec<RemoteTitleSummary>> {
        let natives = match depth {
            SyncDepth::Full => {
                collect_paginated(Cursor::Offset(0), |cursor| {
                    self.completion_page(account_id, cursor)
                })
                .await?
            }
            SyncDepth::Partial => {
                let recent: Vec<RaRecentGame> = self
                    .call("API_GetUserRecentlyPlayedGames", |e| {
                        e.query("u", account_id).query("c", self.partial_page_size)
                    })
                    .await?;
                recent.into_iter().map(NativeTitleSummary::RaRecent).collect()
            }
        };
        debug!(count = natives.len(), ?depth, "ra titles listed");
        Ok(natives.into_iter().map(map_summary).collect())
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_title(&self, title: &TitleRef) -> SyncResult<MappedTitle> {
        let id = game_id(title)?;
        let game: RaGameExtended = self.call("API_GetGameExtended", |e| e.query("i", id)).await?;
        Ok(map_title(NativeTitle::RaGame(game)))
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_earned(
        &self,
        account_id: &str,
        title: &TitleRef,
    ) -> SyncResult<Vec<EarnedAchievement>> {
        let id = game_id(title)?;
        let progress: RaGameProgress = self
            .call("API_GetGameInfoAndUserProgress", |e| e.query("g", id).query("u", account_id))
            .await?;
        Ok(map_earned(NativeEarned::RaProgress(progress)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaCredentials;
    use crate::models::TitleDiscriminator;

    #[test]
    fn service_needs_at_least_one_credential() {
        let cfg = SyncConfig::default();
        assert!(RetroAchievementsService::from_config(&cfg).is_err());

        let cfg = SyncConfig {
            ra_credentials: vec![
                RaCredentials {
                    username: "alice".into(),
                    api_key: "k1".into(),
                },
                RaCredentials {
                    username: "bob".into(),
                    api_key: "k2".into(),
                },
            ],
            ..SyncConfig::default()
        };
        let svc = RetroAchievementsService::from_config(&cfg).unwrap();
        assert_eq!(svc.pool.len(), 2);
    }

    #[test]
    fn endpoint_carries_credentials_but_logs_without_them() {
        let client = RaClient {
            gateway: Gateway::new(GamingService::Ra, std::time::Duration::from_secs(5)).unwrap(),
            username: "alice".into(),
            api_key: "secret".into(),
        };
        let e = client.endpoint("API_GetGameExtended").unwrap().query("i", 1);
        assert_eq!(
            e.log_url(),
            "https://retroachievements.org/API/API_GetGameExtended.php"
        );
    }

    #[test]
    fn non_numeric_game_ids_are_contract_errors() {
        let t = TitleRef::new(GamingService::Ra, "abc", TitleDiscriminator::None);
        assert!(matches!(game_id(&t), Err(SyncError::Contract(_))));
    }
}
