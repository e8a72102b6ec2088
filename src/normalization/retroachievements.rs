use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

use super::platform::canonical_platform;
use super::{
    parse_service_timestamp, EarnedAchievement, MappedGame, MappedGameAchievement, MappedTitle,
    ProgressMetric, RemoteTitleSummary,
};
use crate::models::{GamingService, TitleDiscriminator, TitleRef};

pub const MEDIA_BASE: &str = "https://media.retroachievements.org";

/// `API_GetGameExtended` and `API_GetGameInfoAndUserProgress` share this shape; the user
/// variant fills the `DateEarned*` fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RaGameExtended {
    #[serde(rename = "ID", deserialize_with = "lenient_i64")]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub console_name: Option<String>,
    #[serde(default)]
    pub image_icon: Option<String>,
    #[serde(default)]
    pub image_box_art: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_distinct_players: Option<i64>,
    #[serde(default, deserialize_with = "achievement_map")]
    pub achievements: BTreeMap<String, RaAchievement>,
}

pub type RaGameProgress = RaGameExtended;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RaAchievement {
    #[serde(rename = "ID", deserialize_with = "lenient_i64")]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub points: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub true_ratio: Option<i64>,
    #[serde(default)]
    pub badge_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_awarded: Option<i64>,
    #[serde(default)]
    pub date_earned: Option<String>,
    #[serde(default)]
    pub date_earned_hardcore: Option<String>,
}

/// `API_GetUserCompletionProgress` result row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RaCompletionEntry {
    #[serde(rename = "GameID", deserialize_with = "lenient_i64")]
    pub game_id: i64,
    pub title: String,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_awarded: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_awarded_hardcore: Option<i64>,
    #[serde(default)]
    pub most_recent_awarded_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RaCompletionPage {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub results: Vec<RaCompletionEntry>,
}

/// `API_GetUserRecentlyPlayedGames` row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RaRecentGame {
    #[serde(rename = "GameID", deserialize_with = "lenient_i64")]
    pub game_id: i64,
    pub title: String,
    #[serde(default)]
    pub last_played: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_achieved: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub num_achieved_hardcore: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaUserProfile {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "ULID", default)]
    pub ulid: Option<String>,
}

pub fn badge_url(badge_name: &str) -> String {
    format!("{MEDIA_BASE}/Badge/{badge_name}.png")
}

fn media_url(path: Option<&str>) -> Option<String> {
    let path = path?.trim();
    if path.is_empty() {
        return None;
    }
    if path.starts_with("http") {
        Some(path.to_string())
    } else {
        Some(format!("{MEDIA_BASE}{path}"))
    }
}

fn to_i32(v: Option<i64>) -> Option<i32> {
    v.and_then(|n| i32::try_from(n).ok())
}

pub fn map_game(game: RaGameExtended) -> MappedTitle {
    let players = game.num_distinct_players.filter(|n| *n > 0);
    let achievements = game
        .achievements
        .into_values()
        .map(|a| {
            let earned_on = parse_service_timestamp(a.date_earned.as_deref())
                .or_else(|| parse_service_timestamp(a.date_earned_hardcore.as_deref()));
            MappedGameAchievement {
                service_achievement_id: a.id.to_string(),
                name: a.title,
                description: a.description.unwrap_or_default(),
                vanilla_points: to_i32(a.points),
                ratio_points: to_i32(a.true_ratio),
                gamerscore: None,
                earn_rate: match (a.num_awarded, players) {
                    (Some(n), Some(p)) => Some(n as f64 / p as f64 * 100.0),
                    _ => None,
                },
                psn_trophy_kind: None,
                image_url: a.badge_name.as_deref().map(badge_url),
                is_earned: earned_on.is_some(),
                earned_on,
            }
        })
        .collect();

    let game_row = MappedGame {
        gaming_service: GamingService::Ra,
        service_title_id: game.id.to_string(),
        name: game.title,
        platforms: game
            .console_name
            .as_deref()
            .map(|c| vec![canonical_platform(c)])
            .unwrap_or_default(),
        cover_image_url: media_url(game.image_box_art.as_deref())
            .or_else(|| media_url(game.image_icon.as_deref())),
        known_player_count: game.num_distinct_players,
        known_completionist_count: None,
        discriminator: TitleDiscriminator::None,
    };
    MappedTitle {
        game: game_row,
        achievements,
    }
}

pub fn map_earned(progress: RaGameProgress) -> Vec<EarnedAchievement> {
    progress
        .achievements
        .into_values()
        .filter_map(|a| {
            let hardcore = parse_service_timestamp(a.date_earned_hardcore.as_deref());
            let earned_on = parse_service_timestamp(a.date_earned.as_deref()).or(hardcore);
            earned_on.map(|on| EarnedAchievement {
                service_achievement_id: a.id.to_string(),
                earned_on: Some(on),
                earned_hardcore_on: hardcore,
            })
        })
        .collect()
}

fn ra_title_ref(game_id: i64) -> TitleRef {
    TitleRef::new(GamingService::Ra, game_id.to_string(), TitleDiscriminator::None)
}

pub fn map_completion_entry(entry: RaCompletionEntry) -> RemoteTitleSummary {
    let earned = entry
        .num_awarded
        .unwrap_or(0)
        .max(entry.num_awarded_hardcore.unwrap_or(0));
    RemoteTitleSummary {
        title: ra_title_ref(entry.game_id),
        name: entry.title,
        metric: ProgressMetric::AchievementCount(earned),
        last_played: parse_service_timestamp(entry.most_recent_awarded_date.as_deref()),
    }
}

pub fn map_recent_game(entry: RaRecentGame) -> RemoteTitleSummary {
    let earned = entry
        .num_achieved
        .unwrap_or(0)
        .max(entry.num_achieved_hardcore.unwrap_or(0));
    RemoteTitleSummary {
        title: ra_title_ref(entry.game_id),
        name: entry.title,
        metric: ProgressMetric::AchievementCount(earned),
        last_played: parse_service_timestamp(entry.last_played.as_deref()),
    }
}

/// RA returns numeric ids as numbers on newer endpoints and as strings on older ones.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    lenient_opt_i64(d)?.ok_or_else(|| serde::de::Error::custom("expected integer"))
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Achievements come as an id-keyed object, or as `[]` when the game has none.
fn achievement_map<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, RaAchievement>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Map(BTreeMap<String, RaAchievement>),
        List(Vec<RaAchievement>),
        Null(()),
    }
    Ok(match Shape::deserialize(d)? {
        Shape::Map(m) => m,
        Shape::List(list) => list.into_iter().map(|a| (a.id.to_string(), a)).collect(),
        Shape::Null(()) => BTreeMap::new(),
    })
}
