use thiserror::Error;
use uuid::Uuid;

use crate::models::GamingService;

/// Failures talking to an external achievement service.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{service} request timed out: {url}")]
    Timeout { service: GamingService, url: String },
    #[error("{service} rate limited upstream (http 429)")]
    RateLimited { service: GamingService },
    #[error("{service} http {status}: {body}")]
    Http {
        service: GamingService,
        status: u16,
        body: String,
    },
    #[error("{service} network: {source}")]
    Net {
        service: GamingService,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} json: {source}")]
    Decode {
        service: GamingService,
        #[source]
        source: serde_json::Error,
    },
    #[error("{service} auth: {message}")]
    Auth {
        service: GamingService,
        message: String,
    },
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("{service} has no configured clients")]
    NoClients { service: GamingService },
}

impl GatewayError {
    /// Timeouts, connection failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout { .. }
            | GatewayError::RateLimited { .. }
            | GatewayError::Net { .. } => true,
            GatewayError::Http { status, .. } => *status >= 500,
            GatewayError::Decode { .. }
            | GatewayError::Auth { .. }
            | GatewayError::Endpoint(_)
            | GatewayError::NoClients { .. } => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    /// Earned rows point at achievements the game does not have yet.
    #[error("game {game_id} is missing {} achievement(s): {missing:?}", .missing.len())]
    UnresolvedAchievements { game_id: Uuid, missing: Vec<String> },
    #[error("{0} not found")]
    NotFound(String),
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Gateway(err) => err.is_transient(),
            SyncError::Database(_) => true,
            _ => false,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
