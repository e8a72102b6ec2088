use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::rate_limit::ServiceLimiter;
use crate::error::GatewayError;
use crate::models::GamingService;

/// Longest upstream error body kept on `GatewayError::Http`.
const MAX_ERROR_BODY: usize = 512;

/// One outbound request, described before it is sent.
#[derive(Debug, Clone)]
pub struct Endpoint {
    method: Method,
    url: Url,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    form: Option<Vec<(String, String)>>,
    json: Option<serde_json::Value>,
}

impl Endpoint {
    pub fn get(url: &str) -> Result<Self, GatewayError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self, GatewayError> {
        Self::new(Method::POST, url)
    }

    fn new(method: Method, url: &str) -> Result<Self, GatewayError> {
        let url = Url::parse(url).map_err(|e| GatewayError::Endpoint(format!("{url}: {e}")))?;
        Ok(Self {
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            form: None,
            json: None,
        })
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.form = Some(pairs);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    /// URL without query string, safe for logs (API keys travel as query params).
    pub fn log_url(&self) -> String {
        let mut u = self.url.clone();
        u.set_query(None);
        u.to_string()
    }
}

/// HTTP client for one integration: optional token bucket, bounded per-call timeout,
/// failure classification and JSON decoding.
#[derive(Clone)]
pub struct Gateway {
    service: GamingService,
    http: Client,
    limiter: Option<ServiceLimiter>,
}

impl Gateway {
    pub fn new(service: GamingService, timeout: Duration) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trophy-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| GatewayError::Net { service, source })?;
        Ok(Self {
            service,
            http,
            limiter: None,
        })
    }

    pub fn with_limiter(mut self, limiter: ServiceLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn service(&self) -> GamingService {
        self.service
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
    ) -> Result<T, GatewayError> {
        let body = self.fetch_text(endpoint).await?;
        serde_json::from_str(&body).map_err(|source| GatewayError::Decode {
            service: self.service,
            source,
        })
    }

    pub async fn fetch_text(&self, endpoint: Endpoint) -> Result<String, GatewayError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let service = self.service;
        let log_url = endpoint.log_url();

        let mut req = self.http.request(endpoint.method, endpoint.url);
        if !endpoint.query.is_empty() {
            req = req.query(&endpoint.query);
        }
        for (k, v) in &endpoint.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(form) = &endpoint.form {
            req = req.form(form);
        }
        if let Some(json) = &endpoint.json {
            req = req.json(json);
        }

        let resp = req.send().await.map_err(|e| classify_send_error(service, &log_url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| classify_send_error(service, &log_url, e))?;
        debug!(service = %service, url = %log_url, status = status.as_u16(), "gateway response");

        if status.as_u16() == 429 {
            warn!(service = %service, url = %log_url, "upstream rate limit hit");
            return Err(GatewayError::RateLimited { service });
        }
        if !status.is_success() {
            return Err(GatewayError::Http {
                service,
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }
        Ok(body)
    }
}

fn classify_send_error(service: GamingService, url: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        warn!(service = %service, url, "request timed out");
        GatewayError::Timeout {
            service,
            url: url.to_string(),
        }
    } else {
        GatewayError::Net {
            service,
            source: err,
        }
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_url_drops_query_secrets() {
        let ep = Endpoint::get("https://retroachievements.org/API/API_GetUserSummary.php")
            .unwrap()
            .query("y", "secret-key")
            .query("u", "player");
        assert_eq!(
            ep.log_url(),
            "https://retroachievements.org/API/API_GetUserSummary.php"
        );
    }

    #[test]
    fn invalid_url_is_an_endpoint_error() {
        assert!(matches!(
            Endpoint::get("not a url"),
            Err(GatewayError::Endpoint(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "ééééé";
        let t = truncate(body, 3);
        assert!(t.starts_with('é'));
        assert!(t.ends_with('…'));
        assert_eq!(truncate("short", 10), "short");
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let gw = Gateway::new(GamingService::Psn, Duration::from_millis(200)).unwrap();
        let err = gw
            .fetch_text(Endpoint::get("http://127.0.0.1:9/never").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected: {err:?}");
    }
}
