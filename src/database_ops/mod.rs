pub mod jobs;
pub mod memory;
pub mod playstation;
pub mod postgres;
pub mod retroachievements;
pub mod store;
pub mod worker_manager;
pub mod xbox;

pub use jobs::{JobAction, JobKind, JobQueue, MemoryJobQueue, PgJobQueue};
pub use memory::MemorySyncStore;
pub use postgres::PgSyncStore;
pub use store::SyncStore;
pub use worker_manager::{JobHandler, Lane, WorkerManager};
