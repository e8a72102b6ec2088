use serde::{Deserialize, Deserializer};

use super::platform::canonical_platform;
use super::{
    parse_service_timestamp, EarnedAchievement, MappedGame, MappedGameAchievement, MappedTitle,
    ProgressMetric, RemoteTitleSummary,
};
use crate::models::{GamingService, TitleDiscriminator, TitleRef, XboxTitleKind};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingInfo {
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub total_records: Option<u64>,
}

/// `/history/titles` on contract v1 (Xbox 360 titles).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTitleHistoryEntry {
    #[serde(deserialize_with = "id_string")]
    pub title_id: String,
    pub name: String,
    #[serde(default)]
    pub current_achievements: i64,
    #[serde(default)]
    pub current_gamerscore: i64,
    #[serde(default)]
    pub last_played: Option<String>,
}

/// `/history/titles` on contract v2 (Xbox One and later).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModernTitleHistoryEntry {
    #[serde(deserialize_with = "id_string")]
    pub title_id: String,
    pub name: String,
    #[serde(default)]
    pub earned_achievements: i64,
    #[serde(default)]
    pub current_gamerscore: i64,
    #[serde(default)]
    pub last_unlock: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleHistoryPage<T> {
    #[serde(default = "Vec::new")]
    pub titles: Vec<T>,
    #[serde(default)]
    pub paging_info: PagingInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rarity {
    #[serde(default)]
    pub current_percentage: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAchievement {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub locked_description: Option<String>,
    /// Flat gamerscore on the legacy contract.
    #[serde(default)]
    pub gamerscore: Option<i32>,
    #[serde(default)]
    pub image_id: Option<i64>,
    #[serde(default)]
    pub time_unlocked: Option<String>,
    #[serde(default)]
    pub rarity: Option<Rarity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progression {
    #[serde(default)]
    pub time_unlocked: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModernAchievement {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub locked_description: Option<String>,
    #[serde(default)]
    pub progress_state: Option<String>,
    #[serde(default)]
    pub progression: Progression,
    #[serde(default)]
    pub media_assets: Vec<MediaAsset>,
    #[serde(default)]
    pub rewards: Vec<Reward>,
    #[serde(default)]
    pub rarity: Option<Rarity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementPage<T> {
    #[serde(default = "Vec::new")]
    pub achievements: Vec<T>,
    #[serde(default)]
    pub paging_info: PagingInfo,
}

/// Title detail from titlehub (`decoration/detail,image`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleHubTitle {
    #[serde(deserialize_with = "id_string")]
    pub title_id: String,
    pub name: String,
    #[serde(default)]
    pub display_image: Option<String>,
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TitleHubResponse {
    #[serde(default)]
    pub titles: Vec<TitleHubTitle>,
}

fn modern_gamerscore(a: &ModernAchievement) -> Option<i32> {
    a.rewards
        .iter()
        .find(|r| r.kind.as_deref() == Some("Gamerscore"))
        .and_then(|r| r.value.as_deref())
        .and_then(|v| v.trim().parse().ok())
}

fn legacy_image_url(image_id: i64) -> String {
    format!("https://image-ssl.xboxlive.com/global/t.00000000/ach/0/{image_id:x}")
}

fn description_of(description: Option<String>, locked: Option<String>) -> String {
    description
        .filter(|d| !d.trim().is_empty())
        .or(locked)
        .unwrap_or_default()
}

fn xbox_game(
    title_id: &str,
    detail: Option<TitleHubTitle>,
    kind: XboxTitleKind,
) -> MappedGame {
    let (name, cover, platforms) = match detail {
        Some(d) => (
            d.name,
            d.display_image,
            d.devices.iter().map(|p| canonical_platform(p)).collect(),
        ),
        None => (
            format!("Xbox title {title_id}"),
            None,
            match kind {
                XboxTitleKind::Legacy => vec![canonical_platform("Xbox360")],
                XboxTitleKind::Modern => Vec::new(),
            },
        ),
    };
    MappedGame {
        gaming_service: GamingService::Xbox,
        service_title_id: title_id.to_string(),
        name,
        platforms,
        cover_image_url: cover,
        known_player_count: None,
        known_completionist_count: None,
        discriminator: TitleDiscriminator::Xbox(kind),
    }
}

pub fn map_legacy_achievement(a: LegacyAchievement) -> MappedGameAchievement {
    let earned_on = parse_service_timestamp(a.time_unlocked.as_deref());
    MappedGameAchievement {
        service_achievement_id: a.id,
        name: a.name,
        description: description_of(a.description, a.locked_description),
        vanilla_points: None,
        ratio_points: None,
        gamerscore: a.gamerscore,
        earn_rate: a.rarity.and_then(|r| r.current_percentage),
        psn_trophy_kind: None,
        image_url: a.image_id.map(legacy_image_url),
        is_earned: earned_on.is_some(),
        earned_on,
    }
}

pub fn map_modern_achievement(a: ModernAchievement) -> MappedGameAchievement {
    let earned_on = parse_service_timestamp(a.progression.time_unlocked.as_deref());
    let gamerscore = modern_gamerscore(&a);
    let image_url = a
        .media_assets
        .iter()
        .find(|m| m.kind.as_deref() == Some("Icon"))
        .or_else(|| a.media_assets.first())
        .map(|m| m.url.clone());
    MappedGameAchievement {
        service_achievement_id: a.id,
        name: a.name,
        description: description_of(a.description, a.locked_description),
        vanilla_points: None,
        ratio_points: None,
        gamerscore,
        earn_rate: a.rarity.and_then(|r| r.current_percentage),
        psn_trophy_kind: None,
        image_url,
        is_earned: earned_on.is_some(),
        earned_on,
    }
}

pub fn map_legacy_title(
    title_id: &str,
    detail: Option<TitleHubTitle>,
    achievements: Vec<LegacyAchievement>,
) -> MappedTitle {
    MappedTitle {
        game: xbox_game(title_id, detail, XboxTitleKind::Legacy),
        achievements: achievements.into_iter().map(map_legacy_achievement).collect(),
    }
}

pub fn map_modern_title(
    title_id: &str,
    detail: Option<TitleHubTitle>,
    achievements: Vec<ModernAchievement>,
) -> MappedTitle {
    MappedTitle {
        game: xbox_game(title_id, detail, XboxTitleKind::Modern),
        achievements: achievements.into_iter().map(map_modern_achievement).collect(),
    }
}

pub fn legacy_earned(a: &LegacyAchievement) -> Option<EarnedAchievement> {
    parse_service_timestamp(a.time_unlocked.as_deref())
        .map(|on| EarnedAchievement::new(a.id.clone(), Some(on)))
}

pub fn modern_earned(a: &ModernAchievement) -> Option<EarnedAchievement> {
    parse_service_timestamp(a.progression.time_unlocked.as_deref())
        .map(|on| EarnedAchievement::new(a.id.clone(), Some(on)))
}

pub fn map_legacy_history(entry: LegacyTitleHistoryEntry) -> RemoteTitleSummary {
    RemoteTitleSummary {
        title: TitleRef::new(
            GamingService::Xbox,
            entry.title_id,
            TitleDiscriminator::Xbox(XboxTitleKind::Legacy),
        ),
        name: entry.name,
        metric: ProgressMetric::Gamerscore(entry.current_gamerscore),
        last_played: parse_service_timestamp(entry.last_played.as_deref()),
    }
}

pub fn map_modern_history(entry: ModernTitleHistoryEntry) -> RemoteTitleSummary {
    RemoteTitleSummary {
        title: TitleRef::new(
            GamingService::Xbox,
            entry.title_id,
            TitleDiscriminator::Xbox(XboxTitleKind::Modern),
        ),
        name: entry.name,
        metric: ProgressMetric::Gamerscore(entry.current_gamerscore),
        last_played: parse_service_timestamp(entry.last_unlock.as_deref()),
    }
}

/// Xbox ids arrive as numbers on contract v1 and as strings on v2.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_uses_flat_gamerscore_and_sentinel_is_locked() {
        let list: AchievementPage<LegacyAchievement> = serde_json::from_value(json!({
            "achievements": [
                {"id": 1, "name": "First", "description": "Do it", "gamerscore": 10,
                 "imageId": 255, "timeUnlocked": "2010-03-04T05:06:07Z"},
                {"id": 2, "name": "Second", "lockedDescription": "Secret", "gamerscore": 100,
                 "timeUnlocked": "0001-01-01T00:00:00Z"}
            ],
            "pagingInfo": {"continuationToken": null, "totalRecords": 2}
        }))
        .unwrap();

        let mapped = map_legacy_title("1480659452", None, list.achievements.clone());
        assert_eq!(
            mapped.game.discriminator,
            TitleDiscriminator::Xbox(XboxTitleKind::Legacy)
        );
        assert_eq!(mapped.achievements[0].gamerscore, Some(10));
        assert!(mapped.achievements[0].is_earned);
        assert_eq!(mapped.achievements[1].description, "Secret");
        assert!(!mapped.achievements[1].is_earned);

        let earned: Vec<_> = list.achievements.iter().filter_map(legacy_earned).collect();
        assert_eq!(earned.len(), 1);
        assert_eq!(earned[0].service_achievement_id, "1");
    }

    #[test]
    fn modern_reads_gamerscore_from_rewards() {
        let a: ModernAchievement = serde_json::from_value(json!({
            "id": "7",
            "name": "Seven",
            "description": "Lucky",
            "progressState": "Achieved",
            "progression": {"timeUnlocked": "2022-01-01T00:00:00.0000000Z"},
            "mediaAssets": [{"name": "icon", "type": "Icon", "url": "https://images/7.png"}],
            "rewards": [
                {"value": "Avatar", "type": "Art"},
                {"value": "30", "type": "Gamerscore"}
            ],
            "rarity": {"currentPercentage": 12.5}
        }))
        .unwrap();
        let mapped = map_modern_achievement(a.clone());
        assert_eq!(mapped.gamerscore, Some(30));
        assert_eq!(mapped.earn_rate, Some(12.5));
        assert_eq!(mapped.image_url.as_deref(), Some("https://images/7.png"));
        assert!(modern_earned(&a).is_some());
    }

    #[test]
    fn history_entries_carry_kind_and_gamerscore() {
        let page: TitleHistoryPage<ModernTitleHistoryEntry> = serde_json::from_value(json!({
            "titles": [{"titleId": "219630713", "name": "Halo", "earnedAchievements": 4,
                        "currentGamerscore": 55, "lastUnlock": "2024-02-02T00:00:00Z"}],
            "pagingInfo": {"continuationToken": "abc", "totalRecords": 40}
        }))
        .unwrap();
        assert_eq!(page.paging_info.total_records, Some(40));
        let summary = map_modern_history(page.titles[0].clone());
        assert_eq!(summary.metric, ProgressMetric::Gamerscore(55));
        assert_eq!(
            summary.title.discriminator,
            TitleDiscriminator::Xbox(XboxTitleKind::Modern)
        );
    }
}
