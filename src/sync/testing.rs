//! Fixtures and a scripted `AchievementService` for the sync tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::service::{AchievementService, SyncDepth};
use crate::error::{GatewayError, SyncError, SyncResult};
use crate::models::{
    GamingService, PsnServiceName, TitleDiscriminator, TitleRef, TrackedAccount, TrophyKind,
    XboxTitleKind,
};
use crate::normalization::{
    EarnedAchievement, MappedGame, MappedGameAchievement, MappedTitle, ProgressMetric,
    RemoteTitleSummary,
};

pub fn tracked_account(service: GamingService, name: &str, hours_old: i64) -> TrackedAccount {
    TrackedAccount {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        gaming_service: service,
        account_user_name: name.to_string(),
        service_account_id: None,
        is_high_priority: true,
        created_at: Utc::now() - chrono::Duration::hours(hours_old),
    }
}

fn discriminator(service: GamingService) -> TitleDiscriminator {
    match service {
        GamingService::Ra => TitleDiscriminator::None,
        GamingService::Xbox => TitleDiscriminator::Xbox(XboxTitleKind::Modern),
        GamingService::Psn => TitleDiscriminator::Psn(PsnServiceName::Trophy2),
    }
}

/// A title named `Title {id}` with achievements `a0..a{n-1}`. `points(i)` lands in the
/// service's reward column.
pub fn mapped_title(
    service: GamingService,
    id: &str,
    n: usize,
    points: impl Fn(usize) -> Option<i32>,
) -> MappedTitle {
    let achievements = (0..n)
        .map(|i| {
            let value = points(i);
            MappedGameAchievement {
                service_achievement_id: format!("a{i}"),
                name: format!("Achievement {i}"),
                description: String::new(),
                vanilla_points: if service == GamingService::Ra { value } else { None },
                ratio_points: None,
                gamerscore: if service == GamingService::Xbox { value } else { None },
                earn_rate: None,
                psn_trophy_kind: (service == GamingService::Psn).then_some(TrophyKind::Bronze),
                image_url: None,
                is_earned: false,
                earned_on: None,
            }
        })
        .collect();
    MappedTitle {
        game: MappedGame {
            gaming_service: service,
            service_title_id: id.to_string(),
            name: format!("Title {id}"),
            platforms: Vec::new(),
            cover_image_url: None,
            known_player_count: None,
            known_completionist_count: None,
            discriminator: discriminator(service),
        },
        achievements,
    }
}

/// Turn the trophy at `index` into the platinum.
pub fn with_platinum(mut title: MappedTitle, index: usize) -> MappedTitle {
    if let Some(a) = title.achievements.get_mut(index) {
        a.psn_trophy_kind = Some(TrophyKind::Platinum);
    }
    title
}

pub fn earned(id: &str, hardcore: bool) -> EarnedAchievement {
    let at = Utc::now() - chrono::Duration::days(1);
    EarnedAchievement {
        service_achievement_id: id.to_string(),
        earned_on: Some(at),
        earned_hardcore_on: hardcore.then_some(at),
    }
}

pub fn summary(service: GamingService, id: &str, metric: ProgressMetric) -> RemoteTitleSummary {
    RemoteTitleSummary {
        title: TitleRef::new(service, id, discriminator(service)),
        name: format!("Title {id}"),
        metric,
        last_played: Some(Utc::now()),
    }
}

#[derive(Default)]
struct Script {
    accounts: HashMap<String, String>,
    titles: HashMap<String, Vec<RemoteTitleSummary>>,
    definitions: HashMap<String, MappedTitle>,
    earned: HashMap<(String, String), Vec<EarnedAchievement>>,
    failing_titles: HashMap<String, u16>,
    last_depth: Option<SyncDepth>,
}

/// Scripted service. Everything it returns is set up front and can be changed between
/// runs through the `set_*` methods.
pub struct FakeService {
    service: GamingService,
    script: Mutex<Script>,
    resolve_misses: AtomicU32,
    pub resolve_calls: AtomicU32,
    pub list_calls: AtomicU32,
    pub fetch_title_calls: AtomicU32,
    pub fetch_earned_calls: AtomicU32,
}

impl FakeService {
    pub fn new(service: GamingService) -> Self {
        Self {
            service,
            script: Mutex::new(Script::default()),
            resolve_misses: AtomicU32::new(0),
            resolve_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            fetch_title_calls: AtomicU32::new(0),
            fetch_earned_calls: AtomicU32::new(0),
        }
    }

    pub fn with_account(self, user_name: &str, account_id: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .accounts
            .insert(user_name.to_string(), account_id.to_string());
        self
    }

    /// The first `n` resolve calls report "not found".
    pub fn with_resolve_misses(self, n: u32) -> Self {
        self.resolve_misses.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_title(self, title: MappedTitle) -> Self {
        self.set_title(title);
        self
    }

    pub fn set_title(&self, title: MappedTitle) {
        self.script
            .lock()
            .unwrap()
            .definitions
            .insert(title.game.service_title_id.clone(), title);
    }

    pub fn set_titles(&self, account_id: &str, titles: Vec<RemoteTitleSummary>) {
        self.script
            .lock()
            .unwrap()
            .titles
            .insert(account_id.to_string(), titles);
    }

    pub fn set_earned(&self, account_id: &str, title_id: &str, earned: Vec<EarnedAchievement>) {
        self.script
            .lock()
            .unwrap()
            .earned
            .insert((account_id.to_string(), title_id.to_string()), earned);
    }

    /// `fetch_title` for this id answers with the given HTTP status.
    pub fn fail_title(&self, title_id: &str, status: u16) {
        self.script
            .lock()
            .unwrap()
            .failing_titles
            .insert(title_id.to_string(), status);
    }

    pub fn last_depth(&self) -> Option<SyncDepth> {
        self.script.lock().unwrap().last_depth
    }

    pub fn calls(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AchievementService for FakeService {
    fn gaming_service(&self) -> GamingService {
        self.service
    }

    async fn resolve_account_id(&self, user_name: &str) -> SyncResult<Option<String>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let missed = self
            .resolve_misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if missed {
            return Ok(None);
        }
        Ok(self.script.lock().unwrap().accounts.get(user_name).cloned())
    }

    async fn list_titles(
        &self,
        account_id: &str,
        depth: SyncDepth,
    ) -> SyncResult<Vec<RemoteTitleSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.last_depth = Some(depth);
        Ok(script.titles.get(account_id).cloned().unwrap_or_default())
    }

    async fn fetch_title(&self, title: &TitleRef) -> SyncResult<MappedTitle> {
        self.fetch_title_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        if let Some(status) = script.failing_titles.get(&title.service_title_id) {
            return Err(GatewayError::Http {
                service: self.service,
                status: *status,
                body: "scripted failure".into(),
            }
            .into());
        }
        script
            .definitions
            .get(&title.service_title_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("title {}", title.service_title_id)))
    }

    async fn fetch_earned(
        &self,
        account_id: &str,
        title: &TitleRef,
    ) -> SyncResult<Vec<EarnedAchievement>> {
        self.fetch_earned_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        Ok(script
            .earned
            .get(&(account_id.to_string(), title.service_title_id.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
