use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections).await?;

        // Default OFF: workers may start against a schema managed elsewhere.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            db.migrate().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("parse database url")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connect to postgres")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Apply pending `./migrations/NNNN_description.sql` files in version order.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool, Path::new("./migrations")).await
    }
}

/// Parse `0001_sync_schema.sql` into `(1, "sync_schema")`; anything else is ignored.
fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let desc = stem[digits.len()..].strip_prefix('_')?;
    let version = digits.parse::<i64>().ok()?;
    Some((version, desc.to_string()))
}

async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "migrations directory missing; nothing to apply");
        return Ok(());
    }
    // raw_sql keeps these off prepared statements under PgBouncer
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    let mut applied: HashSet<i64> = HashSet::new();
    for r in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?
    {
        applied.insert(r.try_get::<i64, _>(0)?);
    }

    let mut candidates: Vec<(i64, String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            candidates.push((version, desc, path));
        }
    }
    candidates.sort_by_key(|(v, _, _)| *v);

    for (version, desc, path) in candidates {
        if applied.contains(&version) {
            continue;
        }
        let sql = std::fs::read_to_string(&path)
            .with_context(|| format!("read migration {}", path.display()))?;
        info!(version, file = ?path, "applying migration");

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql.trim()).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _sqlx_migrations(version, description) VALUES ($1, $2)")
            .bind(version)
            .bind(&desc)
            .persistent(false)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        applied.insert(version);
    }
    info!(applied = applied.len(), "migrations up-to-date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_names_need_number_and_description() {
        assert_eq!(
            parse_migration_name("0001_sync_schema.sql"),
            Some((1, "sync_schema".to_string()))
        );
        assert_eq!(parse_migration_name("database_settings.sql"), None);
        assert_eq!(parse_migration_name("0002.sql"), None);
        assert_eq!(parse_migration_name("0003_notes.txt"), None);
    }
}
