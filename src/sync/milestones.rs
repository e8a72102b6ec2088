//! Milestone detection over a merge result, and `TrackedEvent` emission.
//!
//! Events fire only when the merge added earned rows, and only for accounts older than
//! the configured minimum age so a first import does not flood the feed.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::merge::MergeOutcome;
use crate::config::SyncConfig;
use crate::database_ops::store::SyncStore;
use crate::error::SyncResult;
use crate::models::{
    GamingService, NewTrackedEvent, TrackedAccount, TrackedEvent, TrackedEventKind, TrophyKind,
};

#[derive(Debug, Clone, Copy)]
pub struct MilestoneSettings {
    pub hundred_point_threshold: i32,
    pub min_account_age: chrono::Duration,
}

impl From<&SyncConfig> for MilestoneSettings {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            hundred_point_threshold: cfg.hundred_point_threshold,
            min_account_age: cfg.event_min_account_age,
        }
    }
}

pub fn should_emit(
    account: &TrackedAccount,
    outcome: &MergeOutcome,
    settings: &MilestoneSettings,
    now: DateTime<Utc>,
) -> bool {
    outcome.added_earned_rows() && now - account.created_at >= settings.min_account_age
}

fn base_payload(account: &TrackedAccount, outcome: &MergeOutcome) -> Value {
    json!({
        "gameId": outcome.game.id,
        "gameName": outcome.game.name,
        "serviceTitleId": outcome.game.service_title_id,
        "gamingService": outcome.game.gaming_service,
        "accountUserName": account.account_user_name,
        "earnedCount": outcome.earned.len(),
        "totalCount": outcome.achievements.len(),
    })
}

/// RA mastery means every achievement was earned in hardcore mode.
fn all_hardcore(outcome: &MergeOutcome) -> bool {
    outcome.earned.iter().all(|e| e.earned_hardcore_on.is_some())
}

/// Milestones crossed by this merge, in emission order. Gating is not applied here.
pub fn detect(outcome: &MergeOutcome, threshold: i32) -> Vec<(TrackedEventKind, Option<Value>)> {
    let mut found = Vec::new();
    let complete = outcome.is_complete();
    match outcome.game.gaming_service {
        GamingService::Ra if complete => {
            let kind = if all_hardcore(outcome) {
                TrackedEventKind::RaNewMastery
            } else {
                TrackedEventKind::RaNewCompletion
            };
            found.push((kind, None));
        }
        GamingService::Psn => {
            let platinum = outcome.newly_earned.iter().find_map(|id| {
                outcome
                    .achievement(*id)
                    .filter(|a| a.psn_trophy_kind == Some(TrophyKind::Platinum))
            });
            if let Some(p) = platinum {
                found.push((
                    TrackedEventKind::PsnNewPlatinum,
                    Some(json!({ "achievementId": p.id, "achievementName": p.name })),
                ));
            }
            if complete {
                found.push((TrackedEventKind::PsnNewCompletion, None));
            }
        }
        GamingService::Xbox if complete => found.push((TrackedEventKind::XboxNewCompletion, None)),
        _ => {}
    }

    let hundred: Vec<Value> = outcome
        .newly_earned
        .iter()
        .filter_map(|id| outcome.achievement(*id))
        .filter(|a| a.reward_value() == Some(threshold))
        .map(|a| {
            json!({
                "achievementId": a.id,
                "serviceAchievementId": a.service_achievement_id,
                "name": a.name,
                "points": threshold,
            })
        })
        .collect();
    if !hundred.is_empty() {
        found.push((
            TrackedEventKind::NewHundredPointUnlock,
            Some(json!({ "achievements": hundred })),
        ));
    }
    found
}

/// Detect, gate and insert events for one merge.
#[instrument(skip_all, fields(account_id = %account.id, game_id = %outcome.game.id))]
pub async fn emit_milestones(
    store: &dyn SyncStore,
    account: &TrackedAccount,
    outcome: &MergeOutcome,
    settings: &MilestoneSettings,
) -> SyncResult<Vec<TrackedEvent>> {
    if !should_emit(account, outcome, settings, Utc::now()) {
        return Ok(Vec::new());
    }
    let mut events = Vec::new();
    for (kind, extra) in detect(outcome, settings.hundred_point_threshold) {
        let mut data = base_payload(account, outcome);
        if let (Some(Value::Object(extra)), Value::Object(map)) = (extra, &mut data) {
            map.extend(extra);
        }
        let event = store
            .insert_tracked_event(&NewTrackedEvent {
                kind,
                tracked_account_id: account.id,
                event_data: data,
            })
            .await?;
        info!(kind = kind.as_str(), game = %outcome.game.name, "milestone reached");
        events.push(event);
    }
    Ok(events)
}
