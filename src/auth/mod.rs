//! Expiry-aware credential lifecycle shared by integrations that mint tokens.
//!
//! A credential moves `Unauthenticated -> Valid -> AccessExpired -> RefreshExpired`.
//! `AuthTokenCache::use_credential` picks the cheapest step that yields a usable token:
//! cached, refreshed, or a fresh authentication from the long-lived secret.
//!
//! Two callers may both see an expired access token and both refresh. The second write
//! wins and both tokens stay valid upstream, so no lock is held across the refresh.

pub mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

pub use cache::{LocalCredentialCache, PgCredentialCache};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Integration-specific extras (Xbox user hash and xuid, PSN account id).
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unauthenticated,
    Valid,
    AccessExpired,
    RefreshExpired,
}

impl Credential {
    /// `skew` treats tokens that expire within that window as already expired.
    pub fn state(&self, now: DateTime<Utc>, skew: Duration) -> CredentialState {
        let deadline = now + skew;
        if self.refresh_expires_at.is_some_and(|at| at <= deadline) {
            return CredentialState::RefreshExpired;
        }
        if self.access_expires_at > deadline {
            CredentialState::Valid
        } else if self.refresh_token.is_some() {
            CredentialState::AccessExpired
        } else {
            CredentialState::RefreshExpired
        }
    }
}

pub fn credential_state(
    cred: Option<&Credential>,
    now: DateTime<Utc>,
    skew: Duration,
) -> CredentialState {
    cred.map_or(CredentialState::Unauthenticated, |c| c.state(now, skew))
}

/// What an authentication or refresh call returns. Expiry is relative to mint time.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub refresh_expires_in: Option<i64>,
    pub extra: serde_json::Value,
}

impl TokenGrant {
    pub fn into_credential(self, minted_at: DateTime<Utc>) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            access_expires_at: minted_at + Duration::seconds(self.expires_in.max(0)),
            refresh_expires_at: self
                .refresh_expires_in
                .map(|secs| minted_at + Duration::seconds(secs.max(0))),
            extra: self.extra,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Exchange the long-lived secret for a fresh access/refresh pair.
    async fn authenticate(&self) -> SyncResult<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant>;
}

/// Credential storage keyed by integration name. Entries have no TTL.
#[async_trait]
pub trait CredentialCache: Send + Sync {
    async fn load(&self, key: &str) -> SyncResult<Option<Credential>>;

    async fn store(&self, key: &str, credential: &Credential) -> SyncResult<()>;
}

pub struct AuthTokenCache {
    key: String,
    authenticator: Arc<dyn Authenticator>,
    cache: Arc<dyn CredentialCache>,
    skew: Duration,
}

impl AuthTokenCache {
    pub fn new(
        key: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
        cache: Arc<dyn CredentialCache>,
    ) -> Self {
        Self {
            key: key.into(),
            authenticator,
            cache,
            skew: Duration::seconds(30),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub async fn use_credential(&self) -> SyncResult<Credential> {
        let now = Utc::now();
        let cached = self.cache.load(&self.key).await?;
        let state = credential_state(cached.as_ref(), now, self.skew);
        debug!(integration = %self.key, ?state, "credential state");

        let grant = match (state, cached) {
            (CredentialState::Valid, Some(cred)) => return Ok(cred),
            (CredentialState::AccessExpired, Some(cred)) => {
                let refresh_token = cred.refresh_token.clone().ok_or_else(|| {
                    SyncError::Contract(format!(
                        "{}: refreshable credential without token",
                        self.key
                    ))
                })?;
                match self.authenticator.refresh(&refresh_token).await {
                    Ok(grant) => {
                        info!(integration = %self.key, "access token refreshed");
                        grant
                    }
                    Err(err) if !err.is_transient() => {
                        warn!(integration = %self.key, error = %err, "refresh rejected; re-authenticating");
                        self.authenticator.authenticate().await?
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                info!(integration = %self.key, "authenticating from long-lived secret");
                self.authenticator.authenticate().await?
            }
        };

        let mut credential = grant.into_credential(Utc::now());
        if credential.refresh_token.is_none() {
            // Some refresh responses omit the refresh token; the previous one stays valid.
            if let Some(prev) = self.cache.load(&self.key).await? {
                credential.refresh_token = prev.refresh_token;
                credential.refresh_expires_at =
                    credential.refresh_expires_at.or(prev.refresh_expires_at);
            }
        }
        self.cache.store(&self.key, &credential).await?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::models::GamingService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAuth {
        authenticates: AtomicUsize,
        refreshes: AtomicUsize,
        reject_refresh: bool,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn authenticate(&self) -> SyncResult<TokenGrant> {
            let n = self.authenticates.fetch_add(1, Ordering::SeqCst);
            Ok(TokenGrant {
                access_token: format!("auth-{n}"),
                expires_in: 3600,
                refresh_token: Some(format!("refresh-{n}")),
                refresh_expires_in: Some(86_400),
                extra: serde_json::Value::Null,
            })
        }

        async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.reject_refresh {
                return Err(GatewayError::Auth {
                    service: GamingService::Psn,
                    message: "invalid_grant".into(),
                }
                .into());
            }
            Ok(TokenGrant {
                access_token: format!("from-{refresh_token}"),
                expires_in: 3600,
                refresh_token: None,
                refresh_expires_in: None,
                extra: serde_json::Value::Null,
            })
        }
    }

    fn expired_access(now: DateTime<Utc>) -> Credential {
        Credential {
            access_token: "old".into(),
            refresh_token: Some("refresh-0".into()),
            access_expires_at: now - Duration::minutes(1),
            refresh_expires_at: Some(now + Duration::days(1)),
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn state_follows_expiry_timestamps() {
        let now = Utc::now();
        let skew = Duration::seconds(30);
        assert_eq!(credential_state(None, now, skew), CredentialState::Unauthenticated);

        let mut cred = expired_access(now);
        assert_eq!(cred.state(now, skew), CredentialState::AccessExpired);

        cred.refresh_expires_at = Some(now - Duration::seconds(1));
        assert_eq!(cred.state(now, skew), CredentialState::RefreshExpired);

        // An expired refresh token forces re-authentication even with a live access token.
        cred.access_expires_at = now + Duration::minutes(10);
        assert_eq!(cred.state(now, skew), CredentialState::RefreshExpired);

        cred.refresh_expires_at = Some(now + Duration::days(1));
        assert_eq!(cred.state(now, skew), CredentialState::Valid);

        // Access-only credentials stay valid until the access token lapses.
        cred.refresh_token = None;
        cred.refresh_expires_at = None;
        assert_eq!(cred.state(now, skew), CredentialState::Valid);

        // Inside the skew window counts as expired.
        cred.access_expires_at = now + Duration::seconds(10);
        assert_eq!(cred.state(now, skew), CredentialState::RefreshExpired);
    }

    #[tokio::test]
    async fn authenticates_once_then_serves_cache() {
        let auth = Arc::new(CountingAuth::default());
        let cache = Arc::new(LocalCredentialCache::default());
        let tokens = AuthTokenCache::new("psn", auth.clone(), cache);

        let first = tokens.use_credential().await.unwrap();
        let second = tokens.use_credential().await.unwrap();
        assert_eq!(first.access_token, "auth-0");
        assert_eq!(second, first);
        assert_eq!(auth.authenticates.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_access_uses_refresh_and_keeps_refresh_token() {
        let auth = Arc::new(CountingAuth::default());
        let cache = Arc::new(LocalCredentialCache::default());
        cache.store("psn", &expired_access(Utc::now())).await.unwrap();
        let tokens = AuthTokenCache::new("psn", auth.clone(), cache.clone());

        let cred = tokens.use_credential().await.unwrap();
        assert_eq!(cred.access_token, "from-refresh-0");
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh-0"));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.authenticates.load(Ordering::SeqCst), 0);
        assert_eq!(cache.load("psn").await.unwrap(), Some(cred));
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_authenticate() {
        let auth = Arc::new(CountingAuth {
            reject_refresh: true,
            ..Default::default()
        });
        let cache = Arc::new(LocalCredentialCache::default());
        cache.store("psn", &expired_access(Utc::now())).await.unwrap();
        let tokens = AuthTokenCache::new("psn", auth.clone(), cache);

        let cred = tokens.use_credential().await.unwrap();
        assert_eq!(cred.access_token, "auth-0");
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.authenticates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_expired_reauthenticates() {
        let now = Utc::now();
        let auth = Arc::new(CountingAuth::default());
        let cache = Arc::new(LocalCredentialCache::default());
        let mut cred = expired_access(now);
        cred.refresh_expires_at = Some(now - Duration::hours(1));
        cache.store("xbox", &cred).await.unwrap();

        let tokens = AuthTokenCache::new("xbox", auth.clone(), cache);
        assert_eq!(tokens.use_credential().await.unwrap().access_token, "auth-0");
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_access_with_expired_refresh_reauthenticates() {
        let now = Utc::now();
        let auth = Arc::new(CountingAuth::default());
        let cache = Arc::new(LocalCredentialCache::default());
        let mut cred = expired_access(now);
        cred.access_expires_at = now + Duration::hours(1);
        cred.refresh_expires_at = Some(now - Duration::hours(1));
        cache.store("psn", &cred).await.unwrap();

        let tokens = AuthTokenCache::new("psn", auth.clone(), cache.clone());
        let fresh = tokens.use_credential().await.unwrap();
        assert_eq!(fresh.access_token, "auth-0");
        assert_eq!(auth.authenticates.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(cache.load("psn").await.unwrap(), Some(fresh));
    }
}
