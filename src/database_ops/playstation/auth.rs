//! PSN OAuth: the NPSSO cookie buys an authorization code, which buys an access/refresh
//! pair. The pair is shared across workers through `integration_credentials`.

use async_trait::async_trait;
use reqwest::header::{COOKIE, LOCATION};
use reqwest::redirect::Policy;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::auth::{Authenticator, TokenGrant};
use crate::error::{GatewayError, SyncError, SyncResult};
use crate::gateway::{Endpoint, Gateway};
use crate::models::GamingService;

const AUTH_BASE: &str = "https://ca.account.sony.com/api/authz/v3/oauth";
const CLIENT_ID: &str = "09515159-7237-4370-9b40-3806e67c0891";
const REDIRECT_URI: &str = "com.scee.psxandroid.scecompcall://redirect";
const SCOPE: &str = "psn:mobile.v2.core psn:clientapp";
/// base64("{client id}:{client secret}") of the mobile app.
const BASIC_AUTH: &str =
    "Basic MDk1MTUxNTktNzIzNy00MzcwLTliNDAtMzgwNmU2N2MwODkxOnVjUGprYTV0bnRCMktxc1A=";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_token_expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(t: TokenResponse) -> Self {
        TokenGrant {
            access_token: t.access_token,
            expires_in: t.expires_in,
            refresh_token: t.refresh_token,
            refresh_expires_in: t.refresh_token_expires_in,
            extra: serde_json::Value::Null,
        }
    }
}

pub struct PsnAuthenticator {
    gateway: Gateway,
    /// Authorize answers with a redirect whose `code` we need, so redirects stay unfollowed.
    no_redirect: reqwest::Client,
    npsso: String,
}

fn auth_error(message: impl Into<String>) -> SyncError {
    GatewayError::Auth {
        service: GamingService::Psn,
        message: message.into(),
    }
    .into()
}

/// Pull `code` out of the authorize redirect target.
pub fn code_from_location(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .filter(|c| !c.is_empty())
}

impl PsnAuthenticator {
    pub fn new(
        gateway: Gateway,
        timeout: std::time::Duration,
        npsso: impl Into<String>,
    ) -> SyncResult<Self> {
        let no_redirect = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|source| GatewayError::Net {
                service: GamingService::Psn,
                source,
            })?;
        Ok(Self {
            gateway,
            no_redirect,
            npsso: npsso.into(),
        })
    }

    async fn authorization_code(&self) -> SyncResult<String> {
        let resp = self
            .no_redirect
            .get(format!("{AUTH_BASE}/authorize"))
            .query(&[
                ("access_type", "offline"),
                ("client_id", CLIENT_ID),
                ("redirect_uri", REDIRECT_URI),
                ("response_type", "code"),
                ("scope", SCOPE),
            ])
            .header(COOKIE, format!("npsso={}", self.npsso))
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    GatewayError::Timeout {
                        service: GamingService::Psn,
                        url: format!("{AUTH_BASE}/authorize"),
                    }
                } else {
                    GatewayError::Net {
                        service: GamingService::Psn,
                        source,
                    }
                }
            })?;
        let status = resp.status();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(status = status.as_u16(), "psn authorize answered");
        location
            .as_deref()
            .and_then(code_from_location)
            .ok_or_else(|| {
                auth_error(format!("authorize returned no code (http {status}); NPSSO expired?"))
            })
    }

    async fn token(&self, form: Vec<(String, String)>) -> SyncResult<TokenGrant> {
        let resp: TokenResponse = self
            .gateway
            .fetch_json(
                Endpoint::post(&format!("{AUTH_BASE}/token"))?
                    .header("Authorization", BASIC_AUTH)
                    .form(form),
            )
            .await?;
        Ok(resp.into())
    }
}

#[async_trait]
impl Authenticator for PsnAuthenticator {
    async fn authenticate(&self) -> SyncResult<TokenGrant> {
        let code = self.authorization_code().await?;
        let grant = self
            .token(vec![
                ("code".into(), code),
                ("redirect_uri".into(), REDIRECT_URI.into()),
                ("grant_type".into(), "authorization_code".into()),
                ("token_format".into(), "jwt".into()),
            ])
            .await?;
        info!("psn authenticated from npsso");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant> {
        self.token(vec![
            ("refresh_token".into(), refresh_token.to_string()),
            ("grant_type".into(), "refresh_token".into()),
            ("token_format".into(), "jwt".into()),
            ("scope".into(), SCOPE.into()),
        ])
        .await
    }
}
