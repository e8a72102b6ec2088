/// Xbox Live authentication
///
/// Flow:
/// 1. MSA refresh token -> MSA access token (login.live.com)
/// 2. MSA access token -> Xbox Live user token (user.auth.xboxlive.com)
/// 3. User token -> XSTS token for http://xboxlive.com (xsts.auth.xboxlive.com)
///
/// The XSTS token and user hash form the `XBL3.0` authorization. MSA rotates the refresh
/// token on every exchange; the rotated one is kept as the credential's refresh token, while
/// the configured one is the long-lived secret used to start over.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::headers::{contract_versions, xbl_authorization, XboxLiveConfig};
use crate::auth::{Authenticator, TokenGrant};
use crate::error::{GatewayError, SyncError, SyncResult};
use crate::gateway::{Endpoint, Gateway};
use crate::models::GamingService;

const MSA_TOKEN_URL: &str = "https://login.live.com/oauth20_token.srf";
const USER_AUTH_URL: &str = "https://user.auth.xboxlive.com/user/authenticate";
const XSTS_AUTH_URL: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
const MSA_SCOPE: &str = "service::user.auth.xboxlive.com::MBI_SSL";

/// XSTS relying party for Xbox Live API access.
const XSTS_RELYING_PARTY_XBOXLIVE: &str = "http://xboxlive.com";

#[derive(Debug, Deserialize)]
struct MsaTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XblTokenResponse {
    token: String,
    not_after: DateTime<Utc>,
    #[serde(default)]
    display_claims: DisplayClaims,
}

#[derive(Debug, Default, Deserialize)]
struct DisplayClaims {
    #[serde(default)]
    xui: Vec<XuiClaim>,
}

#[derive(Debug, Deserialize)]
struct XuiClaim {
    #[serde(default)]
    uhs: Option<String>,
    #[serde(default)]
    xid: Option<String>,
    #[serde(default)]
    gtg: Option<String>,
}

pub struct XboxAuthenticator {
    gateway: Gateway,
    client_id: String,
    msa_refresh_token: String,
    config: XboxLiveConfig,
}

impl XboxAuthenticator {
    pub fn new(
        gateway: Gateway,
        client_id: impl Into<String>,
        msa_refresh_token: impl Into<String>,
        config: XboxLiveConfig,
    ) -> Self {
        Self {
            gateway,
            client_id: client_id.into(),
            msa_refresh_token: msa_refresh_token.into(),
            config,
        }
    }

    fn auth_error(message: impl Into<String>) -> SyncError {
        GatewayError::Auth {
            service: GamingService::Xbox,
            message: message.into(),
        }
        .into()
    }

    async fn exchange(&self, msa_refresh_token: &str) -> SyncResult<TokenGrant> {
        let msa: MsaTokenResponse = self
            .gateway
            .fetch_json(Endpoint::post(MSA_TOKEN_URL)?.form(vec![
                ("grant_type".into(), "refresh_token".into()),
                ("client_id".into(), self.client_id.clone()),
                ("refresh_token".into(), msa_refresh_token.to_string()),
                ("scope".into(), MSA_SCOPE.into()),
            ]))
            .await?;
        debug!("xbl_auth: msa access token obtained");

        let user: XblTokenResponse = self
            .gateway
            .fetch_json(
                Endpoint::post(USER_AUTH_URL)?
                    .header("x-xbl-contract-version", contract_versions::AUTH)
                    .json(json!({
                        "RelyingParty": "http://auth.xboxlive.com",
                        "TokenType": "JWT",
                        "Properties": {
                            "AuthMethod": "RPS",
                            "SiteName": "user.auth.xboxlive.com",
                            "RpsTicket": format!("t={}", msa.access_token),
                        }
                    })),
            )
            .await?;

        let xsts: XblTokenResponse = self
            .gateway
            .fetch_json(
                Endpoint::post(XSTS_AUTH_URL)?
                    .header("x-xbl-contract-version", contract_versions::AUTH)
                    .json(json!({
                        "RelyingParty": XSTS_RELYING_PARTY_XBOXLIVE,
                        "TokenType": "JWT",
                        "Properties": {
                            "SandboxId": self.config.sandbox_id,
                            "UserTokens": [user.token],
                        }
                    })),
            )
            .await?;

        let claim = xsts
            .display_claims
            .xui
            .into_iter()
            .next()
            .ok_or_else(|| Self::auth_error("xsts response carried no user claims"))?;
        let uhs = claim
            .uhs
            .ok_or_else(|| Self::auth_error("xsts response carried no user hash"))?;
        info!(gamertag = claim.gtg.as_deref().unwrap_or("?"), "xbl_auth: XSTS token obtained");

        Ok(TokenGrant {
            access_token: xbl_authorization(&uhs, &xsts.token),
            expires_in: (xsts.not_after - Utc::now()).num_seconds(),
            refresh_token: Some(
                msa.refresh_token
                    .unwrap_or_else(|| msa_refresh_token.to_string()),
            ),
            refresh_expires_in: None,
            extra: json!({ "uhs": uhs, "xuid": claim.xid }),
        })
    }
}

#[async_trait]
impl Authenticator for XboxAuthenticator {
    async fn authenticate(&self) -> SyncResult<TokenGrant> {
        self.exchange(&self.msa_refresh_token).await
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenGrant> {
        self.exchange(refresh_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xsts_response_parses_claims() {
        let body = r#"{
            "IssueInstant": "2024-01-01T00:00:00.0000000Z",
            "NotAfter": "2024-01-01T16:00:00.0000000Z",
            "Token": "eyJ",
            "DisplayClaims": {"xui": [{"gtg": "Major Nelson", "xid": "2533274790395904", "uhs": "1234"}]}
        }"#;
        let parsed: XblTokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.token, "eyJ");
        assert_eq!(parsed.display_claims.xui[0].uhs.as_deref(), Some("1234"));
        assert_eq!(
            parsed.display_claims.xui[0].xid.as_deref(),
            Some("2533274790395904")
        );
    }

    #[test]
    fn user_token_response_has_no_xid() {
        let body = r#"{"NotAfter": "2024-01-15T00:00:00Z", "Token": "u", "DisplayClaims": {"xui": [{"uhs": "1"}]}}"#;
        let parsed: XblTokenResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.display_claims.xui[0].xid.is_none());
    }
}
