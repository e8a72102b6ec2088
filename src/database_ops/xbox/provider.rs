//! Xbox Live achievements, title history and TitleHub.
//!
//! Title history is served by two contracts: v1 lists Xbox 360 titles, v2 lists Xbox One
//! and later. Both are paged with continuation tokens and merged into one title list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::headers::{
    achievements_contract, build_xbox_live_headers, contract_versions, CorrelationVector,
    XboxLiveConfig,
};
use super::xbl_auth::XboxAuthenticator;
use crate::auth::{AuthTokenCache, Credential, LocalCredentialCache};
use crate::config::SyncConfig;
use crate::error::{GatewayError, SyncError, SyncResult};
use crate::gateway::{collect_paginated, Cursor, Endpoint, Gateway, Page, ServiceLimiter};
use crate::models::{GamingService, TitleRef, XboxTitleKind};
use crate::normalization::xbox::{
    AchievementPage, LegacyAchievement, LegacyTitleHistoryEntry, ModernAchievement,
    ModernTitleHistoryEntry, TitleHistoryPage, TitleHubResponse, TitleHubTitle,
};
use crate::normalization::{
    map_earned, map_summary, map_title, EarnedAchievement, MappedTitle, NativeEarned, NativeTitle,
    NativeTitleSummary, RemoteTitleSummary,
};
use crate::sync::service::{AchievementService, SyncDepth};

const ACHIEVEMENTS_HOST: &str = "https://achievements.xboxlive.com";
const PROFILE_HOST: &str = "https://profile.xboxlive.com";
const TITLEHUB_HOST: &str = "https://titlehub.xboxlive.com";
const HISTORY_PAGE_SIZE: u32 = 100;
const ACHIEVEMENT_PAGE_SIZE: u32 = 1000;
const CREDENTIAL_KEY: &str = "xbox";

/// Body shapes that carry one page of items plus paging info.
trait XblPage<T> {
    fn into_page(self) -> Page<T>;
}

impl<T> XblPage<T> for TitleHistoryPage<T> {
    fn into_page(self) -> Page<T> {
        Page {
            items: self.titles,
            total: self.paging_info.total_records,
            next: self.paging_info.continuation_token.map(Cursor::Token),
        }
    }
}

impl<T> XblPage<T> for AchievementPage<T> {
    fn into_page(self) -> Page<T> {
        Page {
            items: self.achievements,
            total: self.paging_info.total_records,
            next: self.paging_info.continuation_token.map(Cursor::Token),
        }
    }
}

struct PageRequest<'a> {
    url: String,
    contract: &'static str,
    authorization: &'a str,
    query: Vec<(&'static str, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    #[serde(default)]
    profile_users: Vec<ProfileUser>,
}

#[derive(Debug, Deserialize)]
struct ProfileUser {
    id: String,
}

pub struct XboxService {
    gateway: Gateway,
    auth: AuthTokenCache,
    cv: CorrelationVector,
    config: XboxLiveConfig,
    partial_page_size: u32,
}

impl XboxService {
    pub fn from_config(cfg: &SyncConfig) -> SyncResult<Self> {
        let (Some(client_id), Some(refresh_token)) =
            (cfg.xbox_client_id.clone(), cfg.xbox_refresh_token.clone())
        else {
            return Err(GatewayError::NoClients {
                service: GamingService::Xbox,
            }
            .into());
        };
        let config = XboxLiveConfig::from_env();
        // Token exchanges do not count against the API bucket.
        let auth_gateway = Gateway::new(GamingService::Xbox, cfg.http_timeout)?;
        let authenticator =
            XboxAuthenticator::new(auth_gateway, client_id, refresh_token, config.clone());
        let gateway = Gateway::new(GamingService::Xbox, cfg.http_timeout)?
            .with_limiter(ServiceLimiter::per_minute(GamingService::Xbox, cfg.xbox_reqs_per_min));
        Ok(Self {
            gateway,
            auth: AuthTokenCache::new(
                CREDENTIAL_KEY,
                Arc::new(authenticator),
                Arc::new(LocalCredentialCache::default()),
            ),
            cv: CorrelationVector::new(),
            config,
            partial_page_size: cfg.partial_sync_page_size,
        })
    }

    fn headers(&self, authorization: &str, contract: &str) -> Vec<(String, String)> {
        build_xbox_live_headers(authorization, contract, &self.cv.next(), &self.config)
    }

    async fn credential(&self) -> SyncResult<Credential> {
        self.auth.use_credential().await
    }

    /// xuid of the authenticated account; title definitions are read through it.
    fn own_xuid(cred: &Credential) -> SyncResult<String> {
        cred.extra
            .get("xuid")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| SyncError::Contract("xbox credential has no xuid claim".into()))
    }

    async fn page<T, B>(
        &self,
        req: &PageRequest<'_>,
        cursor: Cursor,
    ) -> Result<Page<T>, GatewayError>
    where
        B: DeserializeOwned + XblPage<T>,
    {
        let mut endpoint = Endpoint::get(&req.url)?;
        for (k, v) in &req.query {
            endpoint = endpoint.query(k, v);
        }
        if let Some(token) = cursor.token() {
            endpoint = endpoint.query("continuationToken", token);
        }
        let endpoint = endpoint.headers(self.headers(req.authorization, req.contract));
        let body: B = self.gateway.fetch_json(endpoint).await?;
        Ok(body.into_page())
    }

    async fn all_pages<T, B>(&self, req: PageRequest<'_>) -> SyncResult<Vec<T>>
    where
        B: DeserializeOwned + XblPage<T>,
    {
        Ok(collect_paginated(Cursor::Offset(0), |cursor| self.page::<T, B>(&req, cursor)).await?)
    }

    async fn first_page<T, B>(&self, req: PageRequest<'_>) -> SyncResult<Vec<T>>
    where
        B: DeserializeOwned + XblPage<T>,
    {
        Ok(self.page::<T, B>(&req, Cursor::Offset(0)).await?.items)
    }

    fn history_request<'a>(
        &self,
        xuid: &str,
        kind: XboxTitleKind,
        authorization: &'a str,
        max_items: u32,
    ) -> PageRequest<'a> {
        PageRequest {
            url: format!("{ACHIEVEMENTS_HOST}/users/xuid({xuid})/history/titles"),
            contract: achievements_contract(kind),
            authorization,
            query: vec![("maxItems", max_items.to_string())],
        }
    }

    fn achievements_request<'a>(
        &self,
        xuid: &str,
        title_id: &str,
        kind: XboxTitleKind,
        authorization: &'a str,
        unlocked_only: bool,
    ) -> PageRequest<'a> {
        // Full 360 definitions come from `titleachievements`; `achievements` only lists
        // what the user has touched on that contract.
        let path = match (kind, unlocked_only) {
            (XboxTitleKind::Legacy, false) => "titleachievements",
            _ => "achievements",
        };
        let mut query = vec![
            ("titleId", title_id.to_string()),
            ("maxItems", ACHIEVEMENT_PAGE_SIZE.to_string()),
        ];
        if unlocked_only {
            query.push(("unlockedOnly", "true".to_string()));
        }
        PageRequest {
            url: format!("{ACHIEVEMENTS_HOST}/users/xuid({xuid})/{path}"),
            contract: achievements_contract(kind),
            authorization,
            query,
        }
    }

    async fn title_detail(
        &self,
        xuid: &str,
        title_id: &str,
        authorization: &str,
    ) -> SyncResult<Option<TitleHubTitle>> {
        let endpoint = Endpoint::get(&format!(
            "{TITLEHUB_HOST}/users/xuid({xuid})/titles/titleid({title_id})/decoration/detail"
        ))?
        .headers(self.headers(authorization, contract_versions::TITLEHUB));
        match self.gateway.fetch_json::<TitleHubResponse>(endpoint).await {
            Ok(resp) => Ok(resp.titles.into_iter().next()),
            Err(GatewayError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn title_kind(title: &TitleRef) -> XboxTitleKind {
    title
        .discriminator
        .xbox_title_kind()
        .unwrap_or(XboxTitleKind::Modern)
}

/// Merge both history contracts. A title listed by both keeps its modern entry.
fn merge_history(
    legacy: Vec<LegacyTitleHistoryEntry>,
    modern: Vec<ModernTitleHistoryEntry>,
) -> Vec<RemoteTitleSummary> {
    let mut by_id: HashMap<String, RemoteTitleSummary> = HashMap::new();
    for entry in legacy {
        let s = map_summary(NativeTitleSummary::XboxLegacy(entry));
        by_id.insert(s.title.service_title_id.clone(), s);
    }
    for entry in modern {
        let s = map_summary(NativeTitleSummary::XboxModern(entry));
        by_id.insert(s.title.service_title_id.clone(), s);
    }
    let mut out: Vec<RemoteTitleSummary> = by_id.into_values().collect();
    out.sort_by(|a, b| {
        b.last_played
            .cmp(&a.last_played)
            .then_with(|| a.title.service_title_id.cmp(&b.title.service_title_id))
    });
    out
}

#[async_trait]
impl AchievementService for XboxService {
    fn gaming_service(&self) -> GamingService {
        GamingService::Xbox
    }

    #[instrument(skip(self))]
    async fn resolve_account_id(&self, user_name: &str) -> SyncResult<Option<String>> {
        let cred = self.credential().await?;
        let endpoint = Endpoint::get(&format!(
            "{PROFILE_HOST}/users/gt({})/profile/settings",
            urlencoding::encode(user_name)
        ))?
        .query("settings", "Gamertag")
        .headers(self.headers(&cred.access_token, contract_versions::PROFILE));
        match self.gateway.fetch_json::<ProfileResponse>(endpoint).await {
            Ok(resp) => Ok(resp.profile_users.into_iter().next().map(|u| u.id)),
            Err(GatewayError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn list_titles(
        &self,
        account_id: &str,
        depth: SyncDepth,
    ) -> SyncResult<Vec<RemoteTitleSummary>> {
        let cred = self.credential().await?;
        let auth = cred.access_token.as_str();
        let titles = match depth {
            SyncDepth::Full => {
                let legacy_req = self.history_request(
                    account_id,
                    XboxTitleKind::Legacy,
                    auth,
                    HISTORY_PAGE_SIZE,
                );
                let modern_req = self.history_request(
                    account_id,
                    XboxTitleKind::Modern,
                    auth,
                    HISTORY_PAGE_SIZE,
                );
                let legacy = self
                    .all_pages::<_, TitleHistoryPage<LegacyTitleHistoryEntry>>(legacy_req)
                    .await?;
                let modern = self
                    .all_pages::<_, TitleHistoryPage<ModernTitleHistoryEntry>>(modern_req)
                    .await?;
                merge_history(legacy, modern)
            }
            SyncDepth::Partial => {
                let size = self.partial_page_size;
                let legacy_req =
                    self.history_request(account_id, XboxTitleKind::Legacy, auth, size);
                let modern_req =
                    self.history_request(account_id, XboxTitleKind::Modern, auth, size);
                let legacy = self
                    .first_page::<_, TitleHistoryPage<LegacyTitleHistoryEntry>>(legacy_req)
                    .await?;
                let modern = self
                    .first_page::<_, TitleHistoryPage<ModernTitleHistoryEntry>>(modern_req)
                    .await?;
                let mut merged = merge_history(legacy, modern);
                merged.truncate(size as usize);
                merged
            }
        };
        debug!(count = titles.len(), ?depth, "xbox titles listed");
        Ok(titles)
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_title(&self, title: &TitleRef) -> SyncResult<MappedTitle> {
        let cred = self.credential().await?;
        let xuid = Self::own_xuid(&cred)?;
        let auth = cred.access_token.as_str();
        let title_id = title.service_title_id.clone();
        let kind = title_kind(title);
        let detail = match self.title_detail(&xuid, &title_id, auth).await {
            Ok(d) => d,
            Err(e) if !e.is_transient() => {
                warn!(title_id = %title_id, error = %e, "titlehub detail unavailable");
                None
            }
            Err(e) => return Err(e),
        };
        let req = self.achievements_request(&xuid, &title_id, kind, auth, false);
        let native = match kind {
            XboxTitleKind::Legacy => NativeTitle::XboxLegacyTitle {
                detail,
                achievements: self
                    .all_pages::<LegacyAchievement, AchievementPage<LegacyAchievement>>(req)
                    .await?,
                title_id,
            },
            XboxTitleKind::Modern => NativeTitle::XboxModernTitle {
                detail,
                achievements: self
                    .all_pages::<ModernAchievement, AchievementPage<ModernAchievement>>(req)
                    .await?,
                title_id,
            },
        };
        Ok(map_title(native))
    }

    #[instrument(skip(self), fields(title = %title.service_title_id))]
    async fn fetch_earned(
        &self,
        account_id: &str,
        title: &TitleRef,
    ) -> SyncResult<Vec<EarnedAchievement>> {
        let cred = self.credential().await?;
        let auth = cred.access_token.as_str();
        let kind = title_kind(title);
        let req = self.achievements_request(account_id, &title.service_title_id, kind, auth, true);
        let native = match kind {
            XboxTitleKind::Legacy => NativeEarned::XboxLegacy(
                self.all_pages::<LegacyAchievement, AchievementPage<LegacyAchievement>>(req)
                    .await?,
            ),
            XboxTitleKind::Modern => NativeEarned::XboxModern(
                self.all_pages::<ModernAchievement, AchievementPage<ModernAchievement>>(req)
                    .await?,
            ),
        };
        Ok(map_earned(native))
    }
}
