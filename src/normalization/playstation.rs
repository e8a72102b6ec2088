use serde::Deserialize;

use super::platform::split_platforms;
use super::{
    parse_service_timestamp, EarnedAchievement, MappedGame, MappedGameAchievement, MappedTitle,
    ProgressMetric, RemoteTitleSummary,
};
use crate::models::{GamingService, PsnServiceName, TitleDiscriminator, TitleRef, TrophyKind};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TrophyCounts {
    #[serde(default)]
    pub bronze: i64,
    #[serde(default)]
    pub silver: i64,
    #[serde(default)]
    pub gold: i64,
    #[serde(default)]
    pub platinum: i64,
}

impl TrophyCounts {
    pub fn total(&self) -> i64 {
        self.bronze + self.silver + self.gold + self.platinum
    }
}

/// Row of `/users/{accountId}/trophyTitles`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnTrophyTitle {
    pub np_service_name: String,
    pub np_communication_id: String,
    pub trophy_title_name: String,
    #[serde(default)]
    pub trophy_title_icon_url: Option<String>,
    #[serde(default)]
    pub trophy_title_platform: Option<String>,
    #[serde(default)]
    pub defined_trophies: TrophyCounts,
    #[serde(default)]
    pub earned_trophies: TrophyCounts,
    #[serde(default)]
    pub last_updated_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnTitlesPage {
    #[serde(default)]
    pub trophy_titles: Vec<PsnTrophyTitle>,
    #[serde(default)]
    pub total_item_count: Option<u64>,
    #[serde(default)]
    pub next_offset: Option<u64>,
}

/// `/npCommunicationIds/{id}/trophyGroups` title header.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnTitleGroups {
    pub trophy_title_name: String,
    #[serde(default)]
    pub trophy_title_icon_url: Option<String>,
    #[serde(default)]
    pub trophy_title_platform: Option<String>,
    #[serde(default)]
    pub defined_trophies: TrophyCounts,
}

/// Title-level trophy definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnTrophy {
    pub trophy_id: i64,
    pub trophy_type: String,
    pub trophy_name: String,
    #[serde(default)]
    pub trophy_detail: Option<String>,
    #[serde(default)]
    pub trophy_icon_url: Option<String>,
    #[serde(default)]
    pub trophy_earned_rate: Option<String>,
}

/// Account-level trophy state; carries no names.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnUserTrophy {
    pub trophy_id: i64,
    #[serde(default)]
    pub earned: bool,
    #[serde(default)]
    pub earned_date_time: Option<String>,
    #[serde(default)]
    pub trophy_earned_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsnTrophyPage<T> {
    #[serde(default = "Vec::new")]
    pub trophies: Vec<T>,
    #[serde(default)]
    pub total_item_count: Option<u64>,
}

fn parse_rate(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|r| r.trim().parse::<f64>().ok())
}

pub fn map_trophy(t: PsnTrophy) -> MappedGameAchievement {
    MappedGameAchievement {
        service_achievement_id: t.trophy_id.to_string(),
        name: t.trophy_name,
        description: t.trophy_detail.unwrap_or_default(),
        vanilla_points: None,
        ratio_points: None,
        gamerscore: None,
        earn_rate: parse_rate(t.trophy_earned_rate.as_deref()),
        psn_trophy_kind: TrophyKind::from_service(&t.trophy_type),
        image_url: t.trophy_icon_url,
        is_earned: false,
        earned_on: None,
    }
}

pub fn map_title(
    np_communication_id: &str,
    service_name: PsnServiceName,
    groups: PsnTitleGroups,
    trophies: Vec<PsnTrophy>,
) -> MappedTitle {
    let game = MappedGame {
        gaming_service: GamingService::Psn,
        service_title_id: np_communication_id.to_string(),
        name: groups.trophy_title_name,
        platforms: groups
            .trophy_title_platform
            .as_deref()
            .map(split_platforms)
            .unwrap_or_default(),
        cover_image_url: groups.trophy_title_icon_url,
        known_player_count: None,
        known_completionist_count: None,
        discriminator: TitleDiscriminator::Psn(service_name),
    };
    MappedTitle {
        game,
        achievements: trophies.into_iter().map(map_trophy).collect(),
    }
}

pub fn map_earned(t: &PsnUserTrophy) -> Option<EarnedAchievement> {
    parse_service_timestamp(t.earned_date_time.as_deref())
        .map(|on| EarnedAchievement::new(t.trophy_id.to_string(), Some(on)))
}

pub fn map_trophy_title(t: PsnTrophyTitle) -> RemoteTitleSummary {
    // Unknown generations fall back to the PS4-era service; the trophy endpoints accept both.
    let service_name = PsnServiceName::parse(&t.np_service_name).unwrap_or(PsnServiceName::Trophy);
    RemoteTitleSummary {
        title: TitleRef::new(
            GamingService::Psn,
            t.np_communication_id,
            TitleDiscriminator::Psn(service_name),
        ),
        name: t.trophy_title_name,
        metric: ProgressMetric::EarnedTrophies(t.earned_trophies.total()),
        last_played: parse_service_timestamp(t.last_updated_date_time.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_lowercase_trophy_types() {
        let page: PsnTrophyPage<PsnTrophy> = serde_json::from_value(json!({
            "trophies": [
                {"trophyId": 0, "trophyType": "platinum", "trophyName": "All Done",
                 "trophyDetail": "Get every trophy", "trophyEarnedRate": "3.4"},
                {"trophyId": 1, "trophyType": "bronze", "trophyName": "Start"}
            ],
            "totalItemCount": 2
        }))
        .unwrap();
        let groups: PsnTitleGroups = serde_json::from_value(json!({
            "trophyTitleName": "Astro Bot",
            "trophyTitlePlatform": "PS5",
            "definedTrophies": {"bronze": 1, "silver": 0, "gold": 0, "platinum": 1}
        }))
        .unwrap();

        let mapped = map_title("NPWR00001_00", PsnServiceName::Trophy2, groups, page.trophies);
        assert_eq!(mapped.game.platforms, vec!["PS5"]);
        assert_eq!(
            mapped.game.discriminator,
            TitleDiscriminator::Psn(PsnServiceName::Trophy2)
        );
        assert_eq!(mapped.achievements[0].psn_trophy_kind, Some(TrophyKind::Platinum));
        assert_eq!(mapped.achievements[0].earn_rate, Some(3.4));
        assert_eq!(mapped.achievements[1].description, "");
    }

    #[test]
    fn earned_requires_timestamp() {
        let with_time: PsnUserTrophy = serde_json::from_value(json!({
            "trophyId": 3, "earned": true, "earnedDateTime": "2024-05-05T10:00:00Z"
        }))
        .unwrap();
        let without: PsnUserTrophy =
            serde_json::from_value(json!({"trophyId": 4, "earned": false})).unwrap();
        assert_eq!(map_earned(&with_time).unwrap().service_achievement_id, "3");
        assert!(map_earned(&without).is_none());
    }

    #[test]
    fn summary_counts_earned_trophies() {
        let t: PsnTrophyTitle = serde_json::from_value(json!({
            "npServiceName": "trophy",
            "npCommunicationId": "NPWR11111_00",
            "trophyTitleName": "Bloodborne",
            "definedTrophies": {"bronze": 20, "silver": 10, "gold": 3, "platinum": 1},
            "earnedTrophies": {"bronze": 5, "silver": 2, "gold": 0, "platinum": 0}
        }))
        .unwrap();
        let s = map_trophy_title(t);
        assert_eq!(s.metric, ProgressMetric::EarnedTrophies(7));
        assert_eq!(
            s.title.discriminator,
            TitleDiscriminator::Psn(PsnServiceName::Trophy)
        );
    }
}
