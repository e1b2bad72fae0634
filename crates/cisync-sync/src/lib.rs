//! Incremental sync orchestration: entity cycles, provider runners, the
//! composite dispatcher and its cron scheduler.

use cisync_adapters::ClientError;
use cisync_storage::{ExportError, StoreError};
use thiserror::Error;

pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod scheduler;

pub use config::{Config, EntityConfig};
pub use dispatcher::{CycleSummary, DispatchOptions, Dispatcher};
pub use orchestrator::{
    plan_migration, run_entity_cycle, watermark_key, EntityCycle, EntityOutcome,
    ProviderRunner, ProviderSummary, ProviderSync, SyncOptions, WatermarkUpdate,
};
pub use scheduler::build_scheduler;

pub const CRATE_NAME: &str = "cisync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{entity}: stored watermark meta version {stored} is newer than supported version {current}")]
    MetaVersion {
        entity: String,
        stored: u32,
        current: u32,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Export(#[from] ExportError),
}
