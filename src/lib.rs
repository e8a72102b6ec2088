//! Achievement sync for RetroAchievements, Xbox Live and PlayStation Network.
//!
//! Remote titles are discovered per tracked account, fetched through rate-limited gateways,
//! merged into the local store and turned into milestone events. Work runs as durable jobs
//! claimed by [`database_ops::WorkerManager`].

pub mod auth;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod gateway;
pub mod models;
pub mod normalization;
pub mod orchestrator;
pub mod sync;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}
