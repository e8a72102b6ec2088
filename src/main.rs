use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use uuid::Uuid;

use trophy_sync::config::SyncConfig;
use trophy_sync::database_ops::playstation::PlaystationService;
use trophy_sync::database_ops::retroachievements::RetroAchievementsService;
use trophy_sync::database_ops::xbox::XboxService;
use trophy_sync::database_ops::{JobQueue, PgJobQueue, PgSyncStore, WorkerManager};
use trophy_sync::error::SyncResult;
use trophy_sync::models::GamingService;
use trophy_sync::orchestrator::Orchestrator;
use trophy_sync::sync::jobs::{lanes, JobPlanner};
use trophy_sync::sync::{AchievementService, ServiceRegistry, SyncDepth, SyncEngine};
use trophy_sync::tracing::{init_tracing, DEFAULT_FILTER};
use trophy_sync::util::db::Db;
use trophy_sync::util::env;

#[derive(Parser, Debug)]
#[command(name = "trophy-sync", version, about = "Achievement sync worker and admin CLI")]
struct Cli {
    /// Max pooled database connections (defaults to DB_MAX_CONNS or 10)
    #[arg(long)]
    max_conns: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Depth {
    Full,
    Partial,
}

impl From<Depth> for SyncDepth {
    fn from(d: Depth) -> Self {
        match d {
            Depth::Full => SyncDepth::Full,
            Depth::Partial => SyncDepth::Partial,
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run every job lane of every configured service until stopped
    Worker {
        /// Requeue running jobs whose lock is older than this many seconds at startup
        #[arg(long, default_value_t = 900)]
        stale_lock_secs: u64,
    },
    /// Queue a partial discovery for all high-priority accounts
    SyncPartial,
    /// Queue a full discovery for all high-priority accounts
    SyncFull,
    /// Queue discovery for one tracked account
    SyncAccount {
        #[arg(long)]
        account_id: Uuid,
        #[arg(long, value_enum, default_value_t = Depth::Full)]
        depth: Depth,
    },
    /// Refetch stale game definitions of one service
    RefreshStale {
        /// RA, XBOX or PSN
        #[arg(long)]
        service: GamingService,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
    },
    /// Enqueue partial and full syncs on their intervals until ctrl-c
    Schedule,
    /// Apply pending SQL migrations
    Migrate,
}

/// Build every service that has credentials; the rest are skipped with a warning.
fn build_services(cfg: &SyncConfig, db: &Db) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    let built: [(GamingService, SyncResult<Arc<dyn AchievementService>>); 3] = [
        (
            GamingService::Ra,
            RetroAchievementsService::from_config(cfg)
                .map(|s| Arc::new(s) as Arc<dyn AchievementService>),
        ),
        (
            GamingService::Xbox,
            XboxService::from_config(cfg).map(|s| Arc::new(s) as Arc<dyn AchievementService>),
        ),
        (
            GamingService::Psn,
            PlaystationService::from_config(cfg, db.clone())
                .map(|s| Arc::new(s) as Arc<dyn AchievementService>),
        ),
    ];
    for (service, res) in built {
        match res {
            Ok(svc) => {
                info!(service = %service, "service configured");
                registry.register(svc);
            }
            Err(e) => warn!(service = %service, error = %e, "service disabled"),
        }
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    env::preflight_check("trophy-sync", &[], &["RA_USERNAME", "XBOX_CLIENT_ID", "PSN_NPSSO"])?;
    let database_url = env::db_url().context("database url")?;
    let max_conns = cli
        .max_conns
        .unwrap_or_else(|| env::env_parse("DB_MAX_CONNS", 10u32));

    if let Commands::Migrate = cli.command {
        let db = Db::connect_no_migrate(&database_url, max_conns).await?;
        db.migrate().await.context("apply migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    let db = Db::connect(&database_url, max_conns).await?;
    let config = Arc::new(SyncConfig::from_env());
    let services = build_services(&config, &db);
    if services.is_empty() {
        warn!("no service credentials configured; jobs will not run");
    }

    let queue = Arc::new(PgJobQueue::new(db.clone()));
    let store = Arc::new(PgSyncStore::new(db.clone()));
    let engine = Arc::new(SyncEngine::new(store, services, config.clone()));
    let planner = JobPlanner::new(queue.clone(), config.clone());
    let orchestrator = Orchestrator::new(engine.clone(), planner.clone());

    match cli.command {
        Commands::Worker { stale_lock_secs } => {
            let released = queue
                .release_stale_locks(Duration::from_secs(stale_lock_secs))
                .await?;
            if released.requeued > 0 {
                warn!(
                    requeued = released.requeued,
                    "requeued jobs left running by a previous worker"
                );
            }
            let lanes = lanes(engine, &planner);
            info!(lanes = lanes.len(), "starting worker");
            let manager = Arc::new(WorkerManager::new(queue, config.worker_poll_interval));
            manager.run_all(lanes).await?;
        }
        Commands::SyncPartial => {
            let report = orchestrator.run_partial_sync_for_priority_accounts().await?;
            info!(queued = report.succeeded, failed = report.failed, "partial sync enqueued");
        }
        Commands::SyncFull => {
            let report = orchestrator.run_full_sync_for_priority_accounts().await?;
            info!(queued = report.succeeded, failed = report.failed, "full sync enqueued");
        }
        Commands::SyncAccount { account_id, depth } => {
            let res = orchestrator.sync_account(account_id, depth.into()).await?;
            info!(%account_id, ?res, "account sync enqueued");
        }
        Commands::RefreshStale {
            service,
            limit,
            concurrency,
        } => {
            let report = orchestrator
                .refresh_stale_titles(service, limit, concurrency)
                .await?;
            info!(service = %service, succeeded = report.succeeded, failed = report.failed, "stale refresh done");
        }
        Commands::Schedule => {
            orchestrator
                .schedule(config.partial_sync_interval, config.full_sync_interval)
                .await?;
        }
        Commands::Migrate => {}
    }
    Ok(())
}
