use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::auth::PsnAuthenticator;
use crate::auth::{AuthTokenCache, PgCredentialCache};
use crate::config::SyncConfig;
use crate::error::{GatewayError, SyncResult};
use crate::gateway::{collect_paginated, Cursor, Endpoint, Gateway, Page};
use crate::models::{GamingService, PsnServiceName, TitleRef};
use crate::normalization::playstation::{
    PsnTitleGroups, PsnTitlesPage, PsnTrophy, PsnTrophyPage, PsnUserTrophy,
};
use crate::normalization::{
    map_earned, map_summary, map_title, EarnedAchievement, MappedTitle, NativeEarned, NativeTitle,
    NativeTitleSummary, RemoteTitleSummary,
};
use crate::sync::service::{AchievementService, SyncDepth};
use crate::util::db::Db;

const API_BASE: &str = "https://m.np.playstation.com/api";
const TITLES_PAGE_SIZE: u64 = 800;
const CREDENTIAL_KEY: &str = "psn";

/// Retry a lookup that may miss transiently (PSN search is eventually consistent).
///
/// A hit returns at once. A miss or a transient error is retried until `attempts` runs
/// are spent; a miss on the last run is `Ok(None)`, a transient error on the last run is
/// returned. Other errors are returned immediately.
pub async fn resolve_with_retry<F, Fut>(
    attempts: u32,
    delay: Duration,
    mut search: F,
) -> SyncResult<Option<String>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<Option<String>>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match search(attempt).await {
            Ok(Some(id)) => return Ok(Some(id)),
            Ok(None) => debug!(attempt, "account search missed"),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, error = %e, "account search failed; retrying")
            }
            Err(e) => return Err(e),
        }
        if attempt < attempts && !delay.is_zero() {
            tokio::time::sleep(delay * attempt).await;
        }
    }
    Ok(None)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    domain_responses: Vec<DomainResponse>,
}

#[derive(Debug, Deserialize)]
struct DomainResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    social_metadata: SocialMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialMetadata {
    account_id: String,
    online_id: String,
}

/// Exact (case-insensitive) online id match; fuzzy neighbours are ignored.
fn pick_account(resp: SearchResponse, online_id: &str) -> Option<String> {
    resp.domain_responses
        .into_iter()
        .flat_map(|d| d.results)
        .find(|r| r.social_metadata.online_id.eq_ignore_ascii_case(online_id))
        .map(|r| r.social_metadata.account_id)
}

pub struct PlaystationService {
    gateway: Gateway,
    auth: AuthTokenCache,
    resolution_attempts: u32,
    resolution_delay: Duration,
    partial_page_size: u32,
}

impl PlaystationService {
    pub fn from_config(cfg: &SyncConfig, db: Db) -> SyncResult<Self> {
        let Some(npsso) = cfg.psn_npsso.clone() else {
            return Err(GatewayError::NoClients {
                service: GamingService::Psn,
            }
            .into());
        };
        let gateway = Gateway::new(GamingService::Psn, cfg.http_timeout)?;
        let authenticator = PsnAuthenticator::new(gateway.clone(), cfg.http_timeout, npsso)?;
        Ok(Self {
            gateway,
            auth: AuthTokenCache::new(
                CREDENTIAL_KEY,
                Arc::new(authenticator),
                Arc::new(PgCredentialCache::new(db)),
            ),
            resolution_attempts: cfg.psn_resolution_attempts,
            resolution_delay: Duration::from_secs(1),
            partial_page_size: cfg.partial_sync_page_size,
        })
    }

    async fn bearer(&self) -> SyncResult<String> {
        Ok(self.auth.use_credential().await?.access_token)
    }

    async fn search_once(&self, user_name: &str) -> SyncResult<Option<String>> {
        let token = self.bearer().await?;
        let resp: SearchResponse = self
            .gateway
            .fetch_json(
                Endpoint::post(&format!("{API_BASE}/search/v1/universalSearch"))?
                    .bearer(&token)
                    .json(json!({
                        "searchTerm": user_name,
                        "domainRequests": [{ "domain": "SocialAllAccounts" }]
                    })),
            )
            .await?;
        Ok(pick_account(resp, user_name))
    }

    async fn titles_page(
        &self,
        token: &str,
        account_id: &str,
        limit: u64,
        cursor: Cursor,
    ) -> Result<Page<NativeTitleSummary>, GatewayError> {
        let offset = cursor.offset();
        let page: PsnTitlesPage = self
            .gateway
            .fetch_json(
                Endpoint::get(&format!("{API_BASE}/trophy/v1/users/{account_id}/trophyTitles"))?
                    .bearer(token)
                    .query("limit", limit)
                    .query("offset", offset),
            )
            .await?;
        let items = page
            .trophy_titles
            .into_iter()
            .map(NativeTitleSummary::Psn)
            .collect();
        let mut out = Page::at_offset(items, offset, page.total_item_count);
        if let Some(next) = page.next_offset {
            out.next = Some(Cursor::Offset(next));
        }
        Ok(out)
    }
}

fn service_name(title: &TitleRef) -> PsnServiceName {
    title
        .discriminator
        .psn_service_name()
        .unwrap_or(PsnServiceName::Trophy)
}

#[async_trait]
impl AchievementService for PlaystationService {
    fn gaming_service(&self) -> GamingService {
        GamingService::Psn
    }

    #[instrument(skip(self))]
    async fn resolve_account_id(&self, user_name: &str) -> SyncResult<Option<String>> {
        resolve_with_retry(self.resolution_attempts, self.resolution_delay, |_| {
            self.search_once(user_name)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_titles(
        &self,
        account_id: &str,
        depth: SyncDepth,
    ) -> SyncResult<Vec<RemoteTitleSummary>> {
        let token = self.bearer().await?;
        let natives = match depth {
            SyncDepth::Full => {
                collect_paginated(Cursor::Offset(0), |cursor| {
                    self.titles_page(&token, account_id, TITLES_PAGE_SIZE, cursor)
                })
                .await?
            }
            // Titles come back most recently updated first.
            SyncDepth::Partial => {
                let limit = self.partial_page_size as u64;
                self.titles_page(&token, account_id, limit, Cursor::Offset(0))
                    .await?
                    .items
            }
        };
        debug!(count = natives.len(), ?depth, "psn titles listed");
        Ok(natives.into_iter().map(map_summary).collect())
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_title(&self, title: &TitleRef) -> SyncResult<MappedTitle> {
        let token = self.bearer().await?;
        let id = &title.service_title_id;
        let svc = service_name(title);
        let groups: PsnTitleGroups = self
            .gateway
            .fetch_json(
                Endpoint::get(&format!(
                    "{API_BASE}/trophy/v1/npCommunicationIds/{id}/trophyGroups"
                ))?
                .bearer(&token)
                .query("npServiceName", svc.as_str()),
            )
            .await?;
        let trophies: PsnTrophyPage<PsnTrophy> = self
            .gateway
            .fetch_json(
                Endpoint::get(&format!(
                    "{API_BASE}/trophy/v1/npCommunicationIds/{id}/trophyGroups/all/trophies"
                ))?
                .bearer(&token)
                .query("npServiceName", svc.as_str()),
            )
            .await?;
        Ok(map_title(NativeTitle::PsnTrophyTitle {
            np_communication_id: id.clone(),
            service_name: svc,
            groups,
            trophies: trophies.trophies,
        }))
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_earned(
        &self,
        account_id: &str,
        title: &TitleRef,
    ) -> SyncResult<Vec<EarnedAchievement>> {
        let token = self.bearer().await?;
        let id = &title.service_title_id;
        let page: PsnTrophyPage<PsnUserTrophy> = self
            .gateway
            .fetch_json(
                Endpoint::get(&format!(
                    "{API_BASE}/trophy/v1/users/{account_id}/npCommunicationIds/{id}/trophyGroups/all/trophies"
                ))?
                .bearer(&token)
                .query("npServiceName", service_name(title).as_str()),
            )
            .await?;
        Ok(map_earned(NativeEarned::Psn(page.trophies)))
    }
}
