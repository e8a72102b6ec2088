//! Pure mapping from each service's native records into the shapes the merge engine stores.
//!
//! Every service payload is carried as a variant of [`NativeTitle`], [`NativeEarned`] or
//! [`NativeTitleSummary`] and mapped by exhaustive match, so adding a service means adding
//! variants rather than touching the engine.

pub mod platform;
pub mod playstation;
pub mod retroachievements;
pub mod xbox;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{GamingService, PsnServiceName, TitleDiscriminator, TitleRef, TrophyKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedGame {
    pub gaming_service: GamingService,
    pub service_title_id: String,
    pub name: String,
    pub platforms: Vec<String>,
    pub cover_image_url: Option<String>,
    pub known_player_count: Option<i64>,
    pub known_completionist_count: Option<i64>,
    pub discriminator: TitleDiscriminator,
}

impl MappedGame {
    pub fn title_ref(&self) -> TitleRef {
        TitleRef::new(
            self.gaming_service,
            self.service_title_id.clone(),
            self.discriminator,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedGameAchievement {
    pub service_achievement_id: String,
    pub name: String,
    pub description: String,
    pub vanilla_points: Option<i32>,
    pub ratio_points: Option<i32>,
    pub gamerscore: Option<i32>,
    /// Percentage of players who earned it.
    pub earn_rate: Option<f64>,
    pub psn_trophy_kind: Option<TrophyKind>,
    pub image_url: Option<String>,
    pub is_earned: bool,
    pub earned_on: Option<DateTime<Utc>>,
}

/// One unlocked achievement as reported for a specific account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarnedAchievement {
    pub service_achievement_id: String,
    pub earned_on: Option<DateTime<Utc>>,
    /// RA only: unlock time in hardcore mode.
    pub earned_hardcore_on: Option<DateTime<Utc>>,
}

impl EarnedAchievement {
    pub fn new(id: impl Into<String>, earned_on: Option<DateTime<Utc>>) -> Self {
        Self {
            service_achievement_id: id.into(),
            earned_on,
            earned_hardcore_on: None,
        }
    }
}

/// Title definition plus its full achievement set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedTitle {
    pub game: MappedGame,
    pub achievements: Vec<MappedGameAchievement>,
}

/// Per-service number compared against the locally stored aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressMetric {
    /// RA: achievements earned.
    AchievementCount(i64),
    /// Xbox: gamerscore earned.
    Gamerscore(i64),
    /// PSN: trophies earned.
    EarnedTrophies(i64),
}

impl ProgressMetric {
    pub fn value(self) -> i64 {
        match self {
            ProgressMetric::AchievementCount(n)
            | ProgressMetric::Gamerscore(n)
            | ProgressMetric::EarnedTrophies(n) => n,
        }
    }
}

/// One entry of an account's remote title list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTitleSummary {
    pub title: TitleRef,
    pub name: String,
    pub metric: ProgressMetric,
    pub last_played: Option<DateTime<Utc>>,
}

impl RemoteTitleSummary {
    pub fn service_title_id(&self) -> &str {
        &self.title.service_title_id
    }

    pub fn has_progress(&self) -> bool {
        self.metric.value() > 0
    }
}

pub enum NativeTitle {
    RaGame(retroachievements::RaGameExtended),
    XboxLegacyTitle {
        detail: Option<xbox::TitleHubTitle>,
        title_id: String,
        achievements: Vec<xbox::LegacyAchievement>,
    },
    XboxModernTitle {
        detail: Option<xbox::TitleHubTitle>,
        title_id: String,
        achievements: Vec<xbox::ModernAchievement>,
    },
    PsnTrophyTitle {
        np_communication_id: String,
        service_name: PsnServiceName,
        groups: playstation::PsnTitleGroups,
        trophies: Vec<playstation::PsnTrophy>,
    },
}

pub enum NativeEarned {
    RaProgress(retroachievements::RaGameProgress),
    XboxLegacy(Vec<xbox::LegacyAchievement>),
    XboxModern(Vec<xbox::ModernAchievement>),
    Psn(Vec<playstation::PsnUserTrophy>),
}

pub enum NativeTitleSummary {
    RaCompletion(retroachievements::RaCompletionEntry),
    RaRecent(retroachievements::RaRecentGame),
    XboxLegacy(xbox::LegacyTitleHistoryEntry),
    XboxModern(xbox::ModernTitleHistoryEntry),
    Psn(playstation::PsnTrophyTitle),
}

pub fn map_title(native: NativeTitle) -> MappedTitle {
    match native {
        NativeTitle::RaGame(game) => retroachievements::map_game(game),
        NativeTitle::XboxLegacyTitle {
            detail,
            title_id,
            achievements,
        } => xbox::map_legacy_title(&title_id, detail, achievements),
        NativeTitle::XboxModernTitle {
            detail,
            title_id,
            achievements,
        } => xbox::map_modern_title(&title_id, detail, achievements),
        NativeTitle::PsnTrophyTitle {
            np_communication_id,
            service_name,
            groups,
            trophies,
        } => playstation::map_title(&np_communication_id, service_name, groups, trophies),
    }
}

/// Earned entries only; locked achievements are dropped.
pub fn map_earned(native: NativeEarned) -> Vec<EarnedAchievement> {
    match native {
        NativeEarned::RaProgress(progress) => retroachievements::map_earned(progress),
        NativeEarned::XboxLegacy(list) => list.iter().filter_map(xbox::legacy_earned).collect(),
        NativeEarned::XboxModern(list) => list.iter().filter_map(xbox::modern_earned).collect(),
        NativeEarned::Psn(list) => list.iter().filter_map(playstation::map_earned).collect(),
    }
}

pub fn map_summary(native: NativeTitleSummary) -> RemoteTitleSummary {
    match native {
        NativeTitleSummary::RaCompletion(entry) => retroachievements::map_completion_entry(entry),
        NativeTitleSummary::RaRecent(entry) => retroachievements::map_recent_game(entry),
        NativeTitleSummary::XboxLegacy(entry) => xbox::map_legacy_history(entry),
        NativeTitleSummary::XboxModern(entry) => xbox::map_modern_history(entry),
        NativeTitleSummary::Psn(entry) => playstation::map_trophy_title(entry),
    }
}

/// Parse the handful of timestamp shapes the services emit.
///
/// Returns `None` for empty strings and for the `0001-01-01` placeholder Xbox uses for
/// locked achievements.
pub fn parse_service_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // RA: "2023-04-01 18:22:05", UTC without offset.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_sentinels_are_not_earned() {
        assert_eq!(parse_service_timestamp(Some("0001-01-01T00:00:00Z")), None);
        assert_eq!(parse_service_timestamp(Some("  ")), None);
        assert_eq!(parse_service_timestamp(None), None);
    }

    #[test]
    fn timestamps_parse_rfc3339_and_ra_format() {
        let xbox = parse_service_timestamp(Some("2021-06-01T10:00:00.1234567Z")).unwrap();
        assert_eq!(xbox.format("%Y-%m-%d").to_string(), "2021-06-01");
        let ra = parse_service_timestamp(Some("2023-04-01 18:22:05")).unwrap();
        assert_eq!(ra.to_rfc3339(), "2023-04-01T18:22:05+00:00");
    }

    #[test]
    fn metric_value_is_service_neutral() {
        assert_eq!(ProgressMetric::Gamerscore(120).value(), 120);
        assert_eq!(ProgressMetric::EarnedTrophies(0).value(), 0);
    }
}
