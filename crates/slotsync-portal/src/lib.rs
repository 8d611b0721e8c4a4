//! Browser automation against the appointment portal.
//!
//! [`PortalDriver`] runs the login, query and extraction flow over any
//! [`BrowserPage`]; [`WebDriverConnector`] opens real browser sessions.

use async_trait::async_trait;
use chrono::NaiveDate;
use slotsync_core::{Credentials, SessionTokens, SyncError};
use slotsync_storage::ArtifactStore;
use tracing::info;

pub mod browser;
pub mod capture;
pub mod config;
mod dom;
pub mod driver;
pub mod locate;
pub mod signals;
pub mod table;
pub mod webdriver;

#[cfg(test)]
mod fake;

pub use browser::{find_frame, BrowserPage, FramePath};
pub use capture::{ArtifactCapture, CaptureReport, ElementInventory};
pub use config::PortalConfig;
pub use driver::{DriverState, PortalDriver};
pub use locate::{FieldRole, Locator};
pub use table::{
    parse_results, probe_results, ColumnRole, DayExtraction, RejectReason, RejectedRow,
    ResultsOutcome, ResultsProbe, ScrapedRow,
};
pub use webdriver::{probe_webdriver, WebDriverPage};

pub const CRATE_NAME: &str = "slotsync-portal";

/// An authenticated-or-not browser session for one account, as the orchestrator sees it.
#[async_trait]
pub trait PortalSession: Send {
    fn state(&self) -> DriverState;
    /// Restore cached tokens. `Ok(false)` when the portal no longer honours them.
    async fn resume(&mut self, tokens: &SessionTokens) -> Result<bool, SyncError>;
    async fn login(&mut self, credentials: &Credentials) -> Result<SessionTokens, SyncError>;
    async fn buscar_agendamentos(&mut self, date: NaiveDate) -> Result<DayExtraction, SyncError>;
    async fn voltar(&mut self) -> bool;
    async fn sair(&mut self) -> bool;
    async fn close(&mut self);
}

/// Opens a fresh, initialized browser session.
#[async_trait]
pub trait PortalConnector: Send + Sync {
    async fn open(&self, account_id: &str) -> Result<Box<dyn PortalSession>, SyncError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverConnector {
    config: PortalConfig,
    artifacts: Option<ArtifactStore>,
}

impl WebDriverConnector {
    pub fn new(config: PortalConfig, artifacts: Option<ArtifactStore>) -> Self {
        Self { config, artifacts }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }
}

#[async_trait]
impl PortalConnector for WebDriverConnector {
    async fn open(&self, account_id: &str) -> Result<Box<dyn PortalSession>, SyncError> {
        let page = WebDriverPage::launch(&self.config).await?;
        let capture = match &self.artifacts {
            Some(store) => ArtifactCapture::new(store.clone()),
            None => ArtifactCapture::disabled(),
        };
        let mut driver = PortalDriver::new(page, self.config.clone(), capture, account_id);
        if let Err(err) = driver.init().await {
            driver.close().await;
            return Err(err);
        }
        info!(account_id, "portal session initialized");
        Ok(Box::new(driver))
    }
}
