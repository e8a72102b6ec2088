use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{Credential, CredentialCache};
use crate::error::SyncResult;
use crate::util::db::Db;

/// Process-local cache; every worker process authenticates on its own.
#[derive(Default, Clone)]
pub struct LocalCredentialCache {
    inner: Arc<Mutex<HashMap<String, Credential>>>,
}

#[async_trait]
impl CredentialCache for LocalCredentialCache {
    async fn load(&self, key: &str) -> SyncResult<Option<Credential>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, credential: &Credential) -> SyncResult<()> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), credential.clone());
        Ok(())
    }
}

/// Shared cache in `integration_credentials`, so all workers reuse one authentication.
#[derive(Clone)]
pub struct PgCredentialCache {
    db: Db,
}

impl PgCredentialCache {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialCache for PgCredentialCache {
    #[instrument(skip(self))]
    async fn load(&self, key: &str) -> SyncResult<Option<Credential>> {
        let row: Option<Json<Credential>> = sqlx::query_scalar(
            "SELECT credential FROM integration_credentials WHERE integration_name = $1",
        )
        .bind(key)
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(row.map(|Json(c)| c))
    }

    #[instrument(skip(self, credential))]
    async fn store(&self, key: &str, credential: &Credential) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO integration_credentials (integration_name, credential, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (integration_name)
             DO UPDATE SET credential = EXCLUDED.credential, updated_at = now()",
        )
        .bind(key)
        .bind(Json(credential))
        .persistent(false)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}
