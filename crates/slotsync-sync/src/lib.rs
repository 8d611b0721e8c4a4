//! Sync orchestration: reconciliation store, account registry, window runs and the daily scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use slotsync_portal::{PortalConfig, WebDriverConnector};
use slotsync_storage::{ArtifactStore, SessionCache, SweeperHandle};
use tracing::info;

pub mod accounts;
pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod fake;

pub use accounts::{AccountDirectory, StaticAccountDirectory, YamlAccountDirectory};
pub use config::EngineConfig;
pub use memory::MemorySlotStore;
pub use orchestrator::{
    normalize_day, DateOutcome, DateState, SessionSource, SyncOrchestrator, SyncReport, SyncTrigger,
    WindowSyncRequest, ALL_WEEKDAYS,
};
pub use pg::{migrate, PgSlotStore};
pub use scheduler::{ScheduleConfig, ScheduledOutcome, SyncScheduler};
pub use store::{advisory_lock_key, AccountLease, SlotStore};

pub const CRATE_NAME: &str = "slotsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Fully wired engine: orchestrator plus the process-scoped pieces it depends on.
pub struct Engine {
    pub config: EngineConfig,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub sessions: Arc<SessionCache>,
    sweeper: Option<SweeperHandle>,
}

impl Engine {
    pub async fn from_env(backend: StoreBackend) -> Result<Self> {
        let config = EngineConfig::from_env()?;
        let portal = PortalConfig::from_env();
        Self::build(config, portal, backend).await
    }

    pub async fn build(config: EngineConfig, portal: PortalConfig, backend: StoreBackend) -> Result<Self> {
        let store: Arc<dyn SlotStore> = match backend {
            StoreBackend::Postgres => {
                let store = PgSlotStore::connect(&config.database_url).await?;
                migrate(store.pool()).await?;
                Arc::new(store)
            }
            StoreBackend::Memory => Arc::new(MemorySlotStore::new()),
        };
        let accounts: Arc<dyn AccountDirectory> = Arc::new(
            YamlAccountDirectory::load(&config.accounts_file)
                .await
                .context("loading account registry")?,
        );
        let sessions = Arc::new(SessionCache::new(config.session_ttl));
        let sweeper = sessions.start_sweeper(config.session_sweep);
        let connector = WebDriverConnector::new(portal, Some(ArtifactStore::new(&config.artifacts_dir)));

        let orchestrator = SyncOrchestrator::new(
            store,
            Arc::clone(&accounts),
            Arc::new(connector),
            Arc::clone(&sessions),
        )
        .with_source(config.source.clone());
        info!(?backend, source = %config.source, "sync engine ready");

        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            accounts,
            sessions,
            sweeper: Some(sweeper),
        })
    }

    pub fn scheduler(&self) -> Arc<SyncScheduler> {
        Arc::new(SyncScheduler::new(
            self.orchestrator.clone(),
            Arc::clone(&self.accounts),
            ScheduleConfig::from(&self.config),
        ))
    }

    pub fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }
}
