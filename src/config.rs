//! Runtime knobs for the sync engine, read once from the environment.

use std::time::Duration;

use crate::models::GamingService;
use crate::util::env::{env_numbered_pairs, env_opt, env_parse};

/// How a failed job's next attempt is delayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed { delay: Duration },
    Exponential { base: Duration },
}

impl BackoffPolicy {
    /// Delay before retrying after `attempts` failed runs (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay } => delay,
            BackoffPolicy::Exponential { base } => {
                let exp = attempts.saturating_sub(1).min(10);
                base.saturating_mul(1u32 << exp)
            }
        }
    }
}

/// Retry policy attached to one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct RaCredentials {
    pub username: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ra_credentials: Vec<RaCredentials>,
    pub ra_reqs_per_min: u32,
    pub xbox_reqs_per_min: u32,
    pub xbox_client_id: Option<String>,
    pub xbox_refresh_token: Option<String>,
    pub psn_npsso: Option<String>,
    pub psn_resolution_attempts: u32,
    pub http_timeout: Duration,

    pub ra_progress_concurrency: usize,
    pub xbox_progress_concurrency: usize,
    pub psn_progress_concurrency: usize,
    pub discovery_concurrency: usize,
    pub title_concurrency: usize,

    pub title_job_retry: RetryPolicy,
    pub progress_job_retry: RetryPolicy,
    pub discovery_job_retry: RetryPolicy,
    pub worker_poll_interval: Duration,

    pub hundred_point_threshold: i32,
    pub event_min_account_age: chrono::Duration,
    pub partial_sync_page_size: u32,
    pub partial_sync_interval: Duration,
    pub full_sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::Exponential {
            base: Duration::from_secs(30),
        };
        Self {
            ra_credentials: Vec::new(),
            ra_reqs_per_min: 60,
            xbox_reqs_per_min: 70,
            xbox_client_id: None,
            xbox_refresh_token: None,
            psn_npsso: None,
            psn_resolution_attempts: 3,
            http_timeout: Duration::from_secs(30),
            ra_progress_concurrency: 2,
            xbox_progress_concurrency: 6,
            psn_progress_concurrency: 4,
            discovery_concurrency: 1,
            title_concurrency: 2,
            title_job_retry: RetryPolicy {
                max_attempts: 5,
                backoff,
            },
            progress_job_retry: RetryPolicy {
                max_attempts: 6,
                backoff,
            },
            discovery_job_retry: RetryPolicy {
                max_attempts: 5,
                backoff: BackoffPolicy::Fixed {
                    delay: Duration::from_secs(60),
                },
            },
            worker_poll_interval: Duration::from_millis(500),
            hundred_point_threshold: 100,
            event_min_account_age: chrono::Duration::hours(8),
            partial_sync_page_size: 20,
            partial_sync_interval: Duration::from_secs(5 * 60),
            full_sync_interval: Duration::from_secs(2 * 24 * 60 * 60),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let backoff_base = Duration::from_secs(env_parse("SYNC_BACKOFF_BASE_SECS", 30u64));
        let backoff = if env_opt("SYNC_BACKOFF").as_deref() == Some("fixed") {
            BackoffPolicy::Fixed {
                delay: backoff_base,
            }
        } else {
            BackoffPolicy::Exponential { base: backoff_base }
        };

        let ra_credentials = env_numbered_pairs("RA_USERNAME", "RA_API_KEY", 3)
            .into_iter()
            .map(|(username, api_key)| RaCredentials { username, api_key })
            .collect();

        Self {
            ra_credentials,
            ra_reqs_per_min: env_parse("RA_REQS_PER_MIN", d.ra_reqs_per_min).max(1),
            xbox_reqs_per_min: env_parse("XBOX_REQS_PER_MIN", d.xbox_reqs_per_min).max(1),
            xbox_client_id: env_opt("XBOX_CLIENT_ID"),
            xbox_refresh_token: env_opt("XBOX_MSA_REFRESH_TOKEN"),
            psn_npsso: env_opt("PSN_NPSSO"),
            psn_resolution_attempts: env_parse(
                "PSN_RESOLUTION_ATTEMPTS",
                d.psn_resolution_attempts,
            )
            .max(1),
            http_timeout: Duration::from_secs(env_parse("SYNC_HTTP_TIMEOUT_SECS", 30u64)),
            ra_progress_concurrency: env_parse("RA_PROGRESS_CONCURRENCY", d.ra_progress_concurrency)
                .max(1),
            xbox_progress_concurrency: env_parse(
                "XBOX_PROGRESS_CONCURRENCY",
                d.xbox_progress_concurrency,
            )
            .max(1),
            psn_progress_concurrency: env_parse(
                "PSN_PROGRESS_CONCURRENCY",
                d.psn_progress_concurrency,
            )
            .max(1),
            discovery_concurrency: env_parse("DISCOVERY_CONCURRENCY", d.discovery_concurrency)
                .max(1),
            title_concurrency: env_parse("TITLE_JOB_CONCURRENCY", d.title_concurrency).max(1),
            title_job_retry: RetryPolicy {
                max_attempts: env_parse("TITLE_JOB_MAX_ATTEMPTS", 5u32).max(1),
                backoff,
            },
            progress_job_retry: RetryPolicy {
                max_attempts: env_parse("PROGRESS_JOB_MAX_ATTEMPTS", 6u32).max(1),
                backoff,
            },
            discovery_job_retry: d.discovery_job_retry,
            worker_poll_interval: Duration::from_millis(env_parse("WORKER_POLL_MS", 500u64)),
            hundred_point_threshold: env_parse("HUNDRED_POINT_THRESHOLD", 100i32),
            event_min_account_age: chrono::Duration::hours(env_parse(
                "EVENT_MIN_ACCOUNT_AGE_HOURS",
                8i64,
            )),
            partial_sync_page_size: env_parse("PARTIAL_SYNC_PAGE_SIZE", d.partial_sync_page_size)
                .max(1),
            partial_sync_interval: Duration::from_secs(env_parse(
                "PARTIAL_SYNC_INTERVAL_SECS",
                5 * 60u64,
            )),
            full_sync_interval: Duration::from_secs(env_parse(
                "FULL_SYNC_INTERVAL_SECS",
                2 * 24 * 60 * 60u64,
            )),
        }
    }

    pub fn progress_concurrency(&self, service: GamingService) -> usize {
        match service {
            GamingService::Ra => self.ra_progress_concurrency,
            GamingService::Xbox => self.xbox_progress_concurrency,
            GamingService::Psn => self.psn_progress_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let p = BackoffPolicy::Exponential {
            base: Duration::from_secs(30),
        };
        assert_eq!(p.delay_for(1), Duration::from_secs(30));
        assert_eq!(p.delay_for(2), Duration::from_secs(60));
        assert_eq!(p.delay_for(4), Duration::from_secs(240));
        let fixed = BackoffPolicy::Fixed {
            delay: Duration::from_secs(45),
        };
        assert_eq!(fixed.delay_for(5), Duration::from_secs(45));
    }

    #[test]
    fn defaults_match_service_budgets() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.ra_reqs_per_min, 60);
        assert_eq!(cfg.xbox_reqs_per_min, 70);
        assert_eq!(cfg.progress_concurrency(GamingService::Xbox), 6);
        assert_eq!(cfg.progress_job_retry.max_attempts, 6);
        assert_eq!(cfg.event_min_account_age, chrono::Duration::hours(8));
    }
}
