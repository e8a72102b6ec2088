/// Xbox Live service headers.
///
/// Every call to an Xbox Live service carries:
/// - Authorization: XBL3.0 x=<user hash>;<XSTS token>
/// - x-xbl-contract-version: API version, which also selects the legacy or modern
///   achievements contract
/// - MS-CV: Correlation Vector for request tracking
///
/// Environment Variables:
/// - XBOX_SANDBOX_ID: Sandbox identifier for the XSTS request (default RETAIL)
/// - XBOX_LANGUAGE: Accept-Language sent to title and achievement services (default en-US)
use std::sync::atomic::{AtomicU32, Ordering};

use crate::models::XboxTitleKind;
use crate::util::env::env_opt;

/// Xbox Live API contract versions for different services
pub mod contract_versions {
    /// Achievements and title history for Xbox 360 titles
    pub const ACHIEVEMENTS_LEGACY: &str = "1";

    /// Achievements and title history for Xbox One and later titles
    pub const ACHIEVEMENTS_MODERN: &str = "2";

    /// Profile settings (gamertag lookup)
    pub const PROFILE: &str = "3";

    /// TitleHub decoration
    pub const TITLEHUB: &str = "2";

    /// user.auth / xsts.auth token requests
    pub const AUTH: &str = "1";
}

pub fn achievements_contract(kind: XboxTitleKind) -> &'static str {
    match kind {
        XboxTitleKind::Legacy => contract_versions::ACHIEVEMENTS_LEGACY,
        XboxTitleKind::Modern => contract_versions::ACHIEVEMENTS_MODERN,
    }
}

/// Correlation Vector generator for MS-CV header. Shared by concurrent requests.
#[derive(Debug)]
pub struct CorrelationVector {
    base: String,
    counter: AtomicU32,
}

impl CorrelationVector {
    /// Create a new correlation vector with random base
    pub fn new() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let base = format!("{}.{}", rng.gen::<u64>(), rng.gen::<u32>());
        Self {
            base,
            counter: AtomicU32::new(0),
        }
    }

    /// Get the next value in the correlation vector chain
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", self.base, n)
    }

    /// Get current value without incrementing
    pub fn current(&self) -> String {
        format!("{}.{}", self.base, self.counter.load(Ordering::Relaxed))
    }
}

impl Default for CorrelationVector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct XboxLiveConfig {
    pub sandbox_id: String,
    pub language: String,
}

impl Default for XboxLiveConfig {
    fn default() -> Self {
        Self {
            sandbox_id: "RETAIL".to_string(),
            language: "en-US".to_string(),
        }
    }
}

impl XboxLiveConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sandbox_id: env_opt("XBOX_SANDBOX_ID").unwrap_or(d.sandbox_id),
            language: env_opt("XBOX_LANGUAGE").unwrap_or(d.language),
        }
    }
}

/// `XBL3.0 x=<uhs>;<token>`. Values that already carry a scheme pass through.
pub fn xbl_authorization(user_hash: &str, xsts_token: &str) -> String {
    if xsts_token.starts_with("XBL3.0 ") {
        xsts_token.to_string()
    } else {
        format!("XBL3.0 x={user_hash};{xsts_token}")
    }
}

/// Standard Xbox Live request headers, ready for `Endpoint::headers`.
pub fn build_xbox_live_headers(
    authorization: &str,
    contract_version: &str,
    cv: &str,
    config: &XboxLiveConfig,
) -> Vec<(String, String)> {
    vec![
        ("Authorization".to_string(), authorization.to_string()),
        (
            "x-xbl-contract-version".to_string(),
            contract_version.to_string(),
        ),
        ("MS-CV".to_string(), cv.to_string()),
        ("Accept-Language".to_string(), config.language.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_vector() {
        let cv = CorrelationVector::new();
        let v1 = cv.next();
        let v2 = cv.next();

        assert!(v1.contains('.'));
        assert_ne!(v1, v2);
        assert!(v2.ends_with(".1"));
        assert!(cv.current().ends_with(".2"));
    }

    #[test]
    fn test_xbl_authorization() {
        assert_eq!(xbl_authorization("123", "tok"), "XBL3.0 x=123;tok");
        assert_eq!(
            xbl_authorization("123", "XBL3.0 x=9;other"),
            "XBL3.0 x=9;other"
        );
    }

    #[test]
    fn test_build_headers() {
        let config = XboxLiveConfig::default();
        let headers = build_xbox_live_headers(
            "XBL3.0 x=1;t",
            achievements_contract(XboxTitleKind::Legacy),
            "abc.0",
            &config,
        );
        let get = |k: &str| headers.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("x-xbl-contract-version"), Some("1"));
        assert_eq!(get("MS-CV"), Some("abc.0"));
        assert_eq!(get("Accept-Language"), Some("en-US"));
    }
}
