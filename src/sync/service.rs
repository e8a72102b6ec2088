use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, SyncResult};
use crate::models::{GamingService, TitleRef};
use crate::normalization::{EarnedAchievement, MappedTitle, RemoteTitleSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDepth {
    /// Every title the account has ever touched.
    Full,
    /// Recently played titles only.
    Partial,
}

/// One external achievement service, already normalized.
///
/// Implementations own their gateway, rate limits and credentials; callers only see
/// mapped records.
#[async_trait]
pub trait AchievementService: Send + Sync {
    fn gaming_service(&self) -> GamingService;

    /// Remote account id for a user name, or `None` when the service does not know it.
    async fn resolve_account_id(&self, user_name: &str) -> SyncResult<Option<String>>;

    async fn list_titles(
        &self,
        account_id: &str,
        depth: SyncDepth,
    ) -> SyncResult<Vec<RemoteTitleSummary>>;

    async fn fetch_title(&self, title: &TitleRef) -> SyncResult<MappedTitle>;

    /// Earned achievements only.
    async fn fetch_earned(
        &self,
        account_id: &str,
        title: &TitleRef,
    ) -> SyncResult<Vec<EarnedAchievement>>;
}

#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<GamingService, Arc<dyn AchievementService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn AchievementService>) {
        self.services.insert(service.gaming_service(), service);
    }

    pub fn with(mut self, service: Arc<dyn AchievementService>) -> Self {
        self.register(service);
        self
    }

    pub fn get(&self, service: GamingService) -> SyncResult<Arc<dyn AchievementService>> {
        self.services
            .get(&service)
            .cloned()
            .ok_or_else(|| GatewayError::NoClients { service }.into())
    }

    pub fn services(&self) -> impl Iterator<Item = GamingService> + '_ {
        self.services.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
