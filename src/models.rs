//! Rows and enums shared by the stores, the normalizers and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// External service a tracked account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GamingService {
    Ra,
    Xbox,
    Psn,
}

impl GamingService {
    pub const ALL: [GamingService; 3] =
        [GamingService::Ra, GamingService::Xbox, GamingService::Psn];

    pub fn as_str(self) -> &'static str {
        match self {
            GamingService::Ra => "RA",
            GamingService::Xbox => "XBOX",
            GamingService::Psn => "PSN",
        }
    }

    /// Lowercase prefix used for job kinds and cache keys (`ra.sync_progress`).
    pub fn slug(self) -> &'static str {
        match self {
            GamingService::Ra => "ra",
            GamingService::Xbox => "xbox",
            GamingService::Psn => "psn",
        }
    }
}

impl fmt::Display for GamingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GamingService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RA" | "RETROACHIEVEMENTS" => Ok(GamingService::Ra),
            "XBOX" => Ok(GamingService::Xbox),
            "PSN" | "PLAYSTATION" => Ok(GamingService::Psn),
            other => Err(format!("unknown gaming service: {other}")),
        }
    }
}

/// Xbox splits title history and achievements between the pre-unification (Xbox 360)
/// contract and the modern one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XboxTitleKind {
    Legacy,
    Modern,
}

impl XboxTitleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            XboxTitleKind::Legacy => "legacy",
            XboxTitleKind::Modern => "modern",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "legacy" => Some(XboxTitleKind::Legacy),
            "modern" => Some(XboxTitleKind::Modern),
            _ => None,
        }
    }
}

/// PSN trophy service generation: `trophy` for PS3/PS4/Vita, `trophy2` for PS5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsnServiceName {
    Trophy,
    Trophy2,
}

impl PsnServiceName {
    pub fn as_str(self) -> &'static str {
        match self {
            PsnServiceName::Trophy => "trophy",
            PsnServiceName::Trophy2 => "trophy2",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trophy" => Some(PsnServiceName::Trophy),
            "trophy2" => Some(PsnServiceName::Trophy2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrophyKind {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl TrophyKind {
    /// PSN reports trophy types lower-cased (`"platinum"`).
    pub fn from_service(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bronze" => Some(TrophyKind::Bronze),
            "silver" => Some(TrophyKind::Silver),
            "gold" => Some(TrophyKind::Gold),
            "platinum" => Some(TrophyKind::Platinum),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrophyKind::Bronze => "Bronze",
            TrophyKind::Silver => "Silver",
            TrophyKind::Gold => "Gold",
            TrophyKind::Platinum => "Platinum",
        }
    }
}

/// Service-specific discriminator a title needs to be fetched again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TitleDiscriminator {
    #[default]
    None,
    Xbox(XboxTitleKind),
    Psn(PsnServiceName),
}

impl TitleDiscriminator {
    pub fn xbox_title_kind(self) -> Option<XboxTitleKind> {
        match self {
            TitleDiscriminator::Xbox(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn psn_service_name(self) -> Option<PsnServiceName> {
        match self {
            TitleDiscriminator::Psn(name) => Some(name),
            _ => None,
        }
    }

    pub fn from_parts(xbox: Option<XboxTitleKind>, psn: Option<PsnServiceName>) -> Self {
        match (xbox, psn) {
            (Some(kind), _) => TitleDiscriminator::Xbox(kind),
            (None, Some(name)) => TitleDiscriminator::Psn(name),
            (None, None) => TitleDiscriminator::None,
        }
    }
}

/// Everything a job needs to address one remote title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TitleRef {
    pub gaming_service: GamingService,
    pub service_title_id: String,
    #[serde(default)]
    pub discriminator: TitleDiscriminator,
}

impl TitleRef {
    pub fn new(
        gaming_service: GamingService,
        service_title_id: impl Into<String>,
        discriminator: TitleDiscriminator,
    ) -> Self {
        Self {
            gaming_service,
            service_title_id: service_title_id.into(),
            discriminator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub gaming_service: GamingService,
    pub account_user_name: String,
    /// Resolved lazily on first sync, then persisted.
    pub service_account_id: Option<String>,
    pub is_high_priority: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: Uuid,
    pub gaming_service: GamingService,
    pub service_title_id: String,
    pub name: String,
    pub platforms: Vec<String>,
    pub cover_image_url: Option<String>,
    pub known_player_count: Option<i64>,
    pub known_completionist_count: Option<i64>,
    pub is_stale: bool,
    pub xbox_title_kind: Option<XboxTitleKind>,
    pub psn_service_name: Option<PsnServiceName>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    pub fn title_ref(&self) -> TitleRef {
        TitleRef::new(
            self.gaming_service,
            self.service_title_id.clone(),
            TitleDiscriminator::from_parts(self.xbox_title_kind, self.psn_service_name),
        )
    }
}

/// Slim projection used by discovery classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTitle {
    pub game_id: Uuid,
    pub service_title_id: String,
    pub is_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAchievement {
    pub id: Uuid,
    pub game_id: Uuid,
    pub service_achievement_id: String,
    pub name: String,
    pub description: Option<String>,
    pub vanilla_points: Option<i32>,
    pub ratio_points: Option<i32>,
    pub gamerscore: Option<i32>,
    pub earn_rate: Option<f64>,
    pub psn_trophy_kind: Option<TrophyKind>,
    pub image_url: Option<String>,
}

impl GameAchievement {
    /// The value compared against the point-unlock threshold.
    pub fn reward_value(&self) -> Option<i32> {
        self.gamerscore.or(self.vanilla_points)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGameProgress {
    pub id: Uuid,
    pub tracked_account_id: Uuid,
    pub game_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEarnedAchievement {
    pub id: Uuid,
    pub game_progress_id: Uuid,
    pub game_achievement_id: Uuid,
    pub earned_on: Option<DateTime<Utc>>,
    pub earned_hardcore_on: Option<DateTime<Utc>>,
}

/// Earned row resolved against stored achievement ids, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEarnedAchievement {
    pub game_achievement_id: Uuid,
    pub earned_on: Option<DateTime<Utc>>,
    /// RA hardcore unlock time; `None` on other services.
    pub earned_hardcore_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackedEventKind {
    RaNewMastery,
    RaNewCompletion,
    PsnNewPlatinum,
    PsnNewCompletion,
    XboxNewCompletion,
    NewHundredPointUnlock,
}

impl TrackedEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackedEventKind::RaNewMastery => "RA_NEW_MASTERY",
            TrackedEventKind::RaNewCompletion => "RA_NEW_COMPLETION",
            TrackedEventKind::PsnNewPlatinum => "PSN_NEW_PLATINUM",
            TrackedEventKind::PsnNewCompletion => "PSN_NEW_COMPLETION",
            TrackedEventKind::XboxNewCompletion => "XBOX_NEW_COMPLETION",
            TrackedEventKind::NewHundredPointUnlock => "NEW_HUNDRED_POINT_UNLOCK",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            TrackedEventKind::RaNewMastery,
            TrackedEventKind::RaNewCompletion,
            TrackedEventKind::PsnNewPlatinum,
            TrackedEventKind::PsnNewCompletion,
            TrackedEventKind::XboxNewCompletion,
            TrackedEventKind::NewHundredPointUnlock,
        ]
        .into_iter()
        .find(|k| k.as_str() == raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrackedEvent {
    pub kind: TrackedEventKind,
    pub tracked_account_id: Uuid,
    pub event_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: Uuid,
    pub kind: TrackedEventKind,
    pub tracked_account_id: Uuid,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Locally stored earned totals for one account+title.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalProgressTotals {
    pub earned_count: i64,
    pub earned_points: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trophy_kind_maps_lowercase_service_values() {
        assert_eq!(TrophyKind::from_service("platinum"), Some(TrophyKind::Platinum));
        assert_eq!(TrophyKind::from_service("bronze"), Some(TrophyKind::Bronze));
        assert_eq!(TrophyKind::from_service("copper"), None);
        assert_eq!(TrophyKind::Gold.as_str(), "Gold");
    }

    #[test]
    fn gaming_service_parses_aliases() {
        assert_eq!("ra".parse::<GamingService>(), Ok(GamingService::Ra));
        assert_eq!("PlayStation".parse::<GamingService>(), Ok(GamingService::Psn));
        assert!("steam".parse::<GamingService>().is_err());
    }

    #[test]
    fn discriminator_round_trips_through_game_columns() {
        let d = TitleDiscriminator::from_parts(Some(XboxTitleKind::Legacy), None);
        assert_eq!(d.xbox_title_kind(), Some(XboxTitleKind::Legacy));
        assert_eq!(d.psn_service_name(), None);
        assert_eq!(TitleDiscriminator::from_parts(None, None), TitleDiscriminator::None);
    }

    #[test]
    fn event_kind_parse_matches_as_str() {
        for kind in [
            TrackedEventKind::RaNewMastery,
            TrackedEventKind::PsnNewPlatinum,
            TrackedEventKind::NewHundredPointUnlock,
        ] {
            assert_eq!(TrackedEventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
