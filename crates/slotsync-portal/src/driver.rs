//! Portal automation: authentication, query-form navigation, result polling.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use slotsync_core::dates::{format_br, format_digits, format_iso};
use slotsync_core::{Credentials, SessionTokens, SyncError};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::browser::{enter_path, find_frame, BrowserPage, FramePath};
use crate::capture::ArtifactCapture;
use crate::config::PortalConfig;
use crate::dom::digits;
use crate::locate::{find_option, FieldRole, Locator};
use crate::signals::{detect_captcha, find_modal_close, portal_error_message};
use crate::table::{parse_results, probe_results, DayExtraction, ResultsOutcome, ResultsProbe};
use crate::PortalSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    BrowserReady,
    Authenticated,
    FormReady,
    ResultsExtracted(NaiveDate),
    SessionClosed,
}

impl DriverState {
    pub fn can_advance_to(self, next: DriverState) -> bool {
        use DriverState::*;
        match (self, next) {
            (SessionClosed, _) => false,
            (_, SessionClosed) => true,
            (Idle, BrowserReady) => true,
            (BrowserReady, Authenticated) => true,
            (Authenticated | FormReady | ResultsExtracted(_), FormReady) => true,
            (FormReady, ResultsExtracted(_)) => true,
            // Logged out or session lost mid-run.
            (Authenticated | FormReady | ResultsExtracted(_), BrowserReady) => true,
            _ => false,
        }
    }

    fn is_logged_in(self) -> bool {
        matches!(
            self,
            DriverState::Authenticated | DriverState::FormReady | DriverState::ResultsExtracted(_)
        )
    }
}

fn same_identifier(prefilled: &str, username: &str) -> bool {
    let (a, b) = (digits(prefilled), digits(username));
    (!a.is_empty() && a == b) || prefilled.trim() == username.trim()
}

/// One browser session against the portal, driven through a [`BrowserPage`].
pub struct PortalDriver<P> {
    page: P,
    config: PortalConfig,
    locator: Locator,
    capture: ArtifactCapture,
    account_id: String,
    state: DriverState,
    form_frame: Option<FramePath>,
}

impl<P: BrowserPage> PortalDriver<P> {
    pub fn new(page: P, config: PortalConfig, capture: ArtifactCapture, account_id: impl Into<String>) -> Self {
        Self {
            page,
            config,
            locator: Locator::standard(),
            capture,
            account_id: account_id.into(),
            state: DriverState::Idle,
            form_frame: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    fn advance(&mut self, next: DriverState) -> Result<(), SyncError> {
        if !self.state.can_advance_to(next) {
            return Err(SyncError::Generic(format!(
                "illegal driver transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(account_id = %self.account_id, from = ?self.state, to = ?next, "driver state");
        self.state = next;
        Ok(())
    }

    fn require(&self, operation: &str, allowed: impl Fn(DriverState) -> bool) -> Result<(), SyncError> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(SyncError::Generic(format!(
                "{operation} is not valid in driver state {:?}",
                self.state
            )))
        }
    }

    async fn bounded<T, F>(&self, limit: Duration, what: &str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "{what} exceeded {}s",
                limit.as_secs()
            ))),
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), SyncError> {
        let what = format!("navigation to {url}");
        self.bounded(self.config.navigation_timeout, &what, self.page.goto(url))
            .await
    }

    async fn click(&self, selector: &str) -> Result<(), SyncError> {
        let what = format!("click on {selector}");
        self.bounded(self.config.action_timeout, &what, self.page.click(selector))
            .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), SyncError> {
        let what = format!("typing into {selector}");
        self.bounded(self.config.action_timeout, &what, self.page.fill(selector, value))
            .await
    }

    async fn choose(&self, selector: &str, option: &str) -> Result<(), SyncError> {
        let what = format!("selecting {option} in {selector}");
        self.bounded(
            self.config.action_timeout,
            &what,
            self.page.select_option(selector, option),
        )
        .await
    }

    async fn settle(&self) {
        sleep(self.config.settle_delay).await;
    }

    async fn fail<T>(&self, context: &str, err: SyncError) -> Result<T, SyncError> {
        warn!(account_id = %self.account_id, context, kind = err.kind().as_str(), error = %err, "portal step failed");
        self.capture
            .capture(&self.page, &self.account_id, context, &err)
            .await;
        Err(err)
    }

    async fn frame_with(&self, role: FieldRole) -> Result<Option<(FramePath, String)>, SyncError> {
        let locator = &self.locator;
        find_frame(&self.page, |html| locator.present(html, role)).await
    }

    /// Confirm the browser can reach the portal.
    pub async fn init(&mut self) -> Result<(), SyncError> {
        self.require("init", |s| s == DriverState::Idle)?;
        let base = self.config.base_url.clone();
        if let Err(err) = self.navigate(&base).await {
            let err = SyncError::Generic(format!("browser initialization failed: {err}"));
            return self.fail("init", err).await;
        }
        self.advance(DriverState::BrowserReady)
    }

    /// Close the first open modal in the current frame. Best effort.
    pub async fn dismiss_modal(&self) -> bool {
        let html = match self.page.content().await {
            Ok(html) => html,
            Err(err) => {
                debug!(account_id = %self.account_id, error = %err, "modal check skipped");
                return false;
            }
        };
        let Some(selector) = find_modal_close(&html) else {
            return false;
        };
        match self.click(&selector).await {
            Ok(()) => {
                sleep(self.config.settle_delay / 2).await;
                info!(account_id = %self.account_id, selector, "modal dismissed");
                true
            }
            Err(err) => {
                warn!(account_id = %self.account_id, selector, error = %err, "modal dismissal failed");
                false
            }
        }
    }

    async fn check_captcha(&self) -> Result<(), SyncError> {
        let hit = find_frame(&self.page, |html| detect_captcha(html).is_some()).await?;
        if let Some((path, html)) = hit {
            let signal = detect_captcha(&html).unwrap_or_else(|| "captcha".to_string());
            warn!(account_id = %self.account_id, ?path, signal, "captcha present, human intervention required");
            return Err(SyncError::Captcha(signal));
        }
        Ok(())
    }

    /// Reuse cached cookies. `Ok(false)` means the portal sent us back to login.
    pub async fn resume(&mut self, tokens: &SessionTokens) -> Result<bool, SyncError> {
        self.require("resume", |s| s == DriverState::BrowserReady)?;
        if tokens.is_empty() {
            return Ok(false);
        }
        let base = self.config.base_url.clone();
        self.navigate(&base).await?;
        self.page.add_cookies(&tokens.cookies).await?;
        let target = tokens
            .landing_url
            .clone()
            .unwrap_or_else(|| self.config.home_url());
        self.navigate(&target).await?;
        self.settle().await;

        let url = self.page.current_url().await?;
        if self.config.is_login_url(&url) {
            info!(account_id = %self.account_id, url, "cached session redirected to login");
            return Ok(false);
        }
        let login_form = self.frame_with(FieldRole::AccessSecret).await?.is_some();
        self.page.enter_top().await?;
        if login_form {
            info!(account_id = %self.account_id, "cached session shows a login form");
            return Ok(false);
        }
        self.advance(DriverState::Authenticated)?;
        info!(account_id = %self.account_id, "cached session resumed");
        Ok(true)
    }

    pub async fn login(&mut self, credentials: &Credentials) -> Result<SessionTokens, SyncError> {
        self.require("login", |s| s == DriverState::BrowserReady)?;
        match self.login_flow(credentials).await {
            Ok(tokens) => {
                self.advance(DriverState::Authenticated)?;
                info!(account_id = %self.account_id, cookies = tokens.cookies.len(), "portal login succeeded");
                Ok(tokens)
            }
            Err(err) => self.fail("login", err).await,
        }
    }

    async fn login_flow(&mut self, credentials: &Credentials) -> Result<SessionTokens, SyncError> {
        let login_url = self.config.login_url();
        self.navigate(&login_url).await?;
        self.settle().await;
        self.dismiss_modal().await;
        self.check_captcha().await?;

        let top = self.page.content().await?;
        if !self.locator.present(&top, FieldRole::AccessSecret) {
            let identifier = self
                .locator
                .locate(&top, FieldRole::LoginIdentifier)
                .ok_or_else(|| SyncError::SelectorDrift("login identifier field not found".into()))?;
            let proceed = self
                .locator
                .locate(&top, FieldRole::LoginContinue)
                .ok_or_else(|| SyncError::SelectorDrift("login continue control not found".into()))?;
            debug!(account_id = %self.account_id, strategy = identifier.strategy, "identifier field located");
            self.fill(&identifier.selector, &credentials.username).await?;
            self.click(&proceed.selector).await?;
            self.settle().await;
            self.dismiss_modal().await;
        }

        let (path, html) = self
            .frame_with(FieldRole::AccessSecret)
            .await?
            .ok_or_else(|| {
                SyncError::SelectorDrift("access form with a password field not found in any frame".into())
            })?;
        debug!(account_id = %self.account_id, ?path, "access form located");
        if let Some(signal) = detect_captcha(&html) {
            return Err(SyncError::Captcha(signal));
        }

        if let Some(identifier) = self.locator.locate(&html, FieldRole::AccessIdentifier) {
            let prefilled = identifier
                .prefilled
                .as_deref()
                .is_some_and(|v| same_identifier(v, &credentials.username));
            if identifier.editable && !prefilled {
                self.fill(&identifier.selector, &credentials.username).await?;
            }
        }
        let secret = self
            .locator
            .locate(&html, FieldRole::AccessSecret)
            .ok_or_else(|| SyncError::SelectorDrift("password field not found".into()))?;
        let submit = self
            .locator
            .locate(&html, FieldRole::AccessSubmit)
            .ok_or_else(|| SyncError::SelectorDrift("access submit control not found".into()))?;
        self.fill(&secret.selector, &credentials.password).await?;
        self.click(&submit.selector).await?;
        self.settle().await;

        self.page.enter_top().await?;
        self.dismiss_modal().await;
        self.check_captcha().await?;
        self.confirm_authenticated().await?;
        self.page.enter_top().await?;

        let cookies = self.page.cookies().await?;
        let landing_url = self.page.current_url().await.ok();
        Ok(SessionTokens {
            cookies,
            landing_url,
        })
    }

    async fn confirm_authenticated(&self) -> Result<(), SyncError> {
        if self.frame_with(FieldRole::LogoutAction).await?.is_some() {
            return Ok(());
        }
        let url = self.page.current_url().await.unwrap_or_default();
        let top = self.page.content().await.unwrap_or_default();
        match self.frame_with(FieldRole::AccessSecret).await? {
            Some((_, html)) => {
                let message = portal_error_message(&html)
                    .or_else(|| portal_error_message(&top))
                    .unwrap_or_else(|| "login form still present after submit".to_string());
                Err(SyncError::Auth(message))
            }
            None if self.config.is_login_url(&url) => {
                Err(SyncError::Auth(format!("still on login page {url}")))
            }
            None => Ok(()),
        }
    }

    async fn find_form_frame(&self) -> Result<Option<(FramePath, String)>, SyncError> {
        let locator = &self.locator;
        find_frame(&self.page, |html| {
            locator.present(html, FieldRole::DateText) || locator.present(html, FieldRole::DateSelect)
        })
        .await
    }

    fn form_found(&mut self, found: (FramePath, String)) -> Result<String, SyncError> {
        self.form_frame = Some(found.0);
        self.advance(DriverState::FormReady)?;
        Ok(found.1)
    }

    async fn ensure_not_logged_out(&self) -> Result<(), SyncError> {
        let url = self.page.current_url().await?;
        if self.config.is_login_url(&url) {
            return Err(SyncError::Auth("session expired: redirected to login".into()));
        }
        Ok(())
    }

    /// Leave the page inside the query form's frame and return its HTML.
    async fn ensure_form_ready(&mut self) -> Result<String, SyncError> {
        if let Some(path) = self.form_frame.clone() {
            if enter_path(&self.page, &path).await.is_ok() {
                if let Ok(html) = self.page.content().await {
                    if self.locator.present(&html, FieldRole::DateText)
                        || self.locator.present(&html, FieldRole::DateSelect)
                    {
                        self.advance(DriverState::FormReady)?;
                        return Ok(html);
                    }
                }
            }
            self.form_frame = None;
        }

        self.page.enter_top().await?;
        self.ensure_not_logged_out().await?;
        self.dismiss_modal().await;

        if let Some(found) = self.find_form_frame().await? {
            return self.form_found(found);
        }

        if let Some((_, html)) = self.frame_with(FieldRole::ScheduleMenuLink).await? {
            if let Some(link) = self.locator.locate(&html, FieldRole::ScheduleMenuLink) {
                match self.click(&link.selector).await {
                    Ok(()) => self.settle().await,
                    Err(err) => {
                        warn!(account_id = %self.account_id, error = %err, "menu link click failed")
                    }
                }
                self.page.enter_top().await?;
                self.dismiss_modal().await;
                if let Some(found) = self.find_form_frame().await? {
                    return self.form_found(found);
                }
            }
        }

        let form_url = self.config.form_url();
        info!(account_id = %self.account_id, url = %form_url, "opening query form by direct url");
        self.navigate(&form_url).await?;
        self.settle().await;
        self.ensure_not_logged_out().await?;
        self.dismiss_modal().await;
        match self.find_form_frame().await? {
            Some(found) => self.form_found(found),
            None => Err(SyncError::SelectorDrift(
                "query form not found via menu link or direct url".into(),
            )),
        }
    }

    async fn wait_for_results(&self) -> Result<(ResultsProbe, String), SyncError> {
        let deadline = Instant::now() + self.config.results_timeout;
        loop {
            let hit = find_frame(&self.page, |html| probe_results(html) != ResultsProbe::Pending).await?;
            if let Some((path, html)) = hit {
                let probe = probe_results(&html);
                debug!(account_id = %self.account_id, ?path, ?probe, "results frame located");
                return Ok((probe, html));
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout(format!(
                    "results did not appear within {}s",
                    self.config.results_timeout.as_secs()
                )));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Query one date and extract its appointment rows.
    pub async fn buscar_agendamentos(&mut self, date: NaiveDate) -> Result<DayExtraction, SyncError> {
        self.require("buscar_agendamentos", DriverState::is_logged_in)?;
        match self.query_date(date).await {
            Ok(extraction) => Ok(extraction),
            Err(err) => {
                let context = format!("buscar-{}", format_iso(date));
                self.fail(&context, err).await
            }
        }
    }

    async fn query_date(&mut self, date: NaiveDate) -> Result<DayExtraction, SyncError> {
        let form = self.ensure_form_ready().await?;
        let date_text = self.locator.locate(&form, FieldRole::DateText);
        let has_select = self.locator.present(&form, FieldRole::DateSelect);

        if let Some(field) = &date_text {
            self.fill(&field.selector, &format_digits(date)).await?;
            self.settle().await;
        }

        if has_select {
            let html = self.page.content().await?;
            let list = self
                .locator
                .locate(&html, FieldRole::DateSelect)
                .ok_or_else(|| SyncError::SelectorDrift("date list vanished after typing the date".into()))?;
            let wanted = vec![format_br(date), format_digits(date), format_iso(date)];
            match find_option(&html, &list.selector, &wanted) {
                Some(option) => {
                    self.choose(&list.selector, &option).await?;
                    self.settle().await;
                }
                None => {
                    info!(account_id = %self.account_id, date = %date, "date not offered by the portal, treating as empty day");
                    return Ok(DayExtraction::empty(date, ResultsOutcome::DateUnavailable));
                }
            }
        }

        let html = self.page.content().await?;
        let query = self
            .locator
            .locate(&html, FieldRole::QueryAction)
            .ok_or_else(|| SyncError::SelectorDrift("query control not found on form".into()))?;
        self.click(&query.selector).await?;
        self.settle().await;

        let (probe, html) = self.wait_for_results().await?;
        let extraction = match probe {
            ResultsProbe::NoResults => DayExtraction::empty(date, ResultsOutcome::NoResults),
            _ => parse_results(&html, date),
        };
        for rejected in &extraction.rejected {
            warn!(
                account_id = %self.account_id,
                date = %date,
                row = rejected.row_index,
                reason = %rejected.reason,
                "results row rejected"
            );
        }
        self.advance(DriverState::ResultsExtracted(date))?;
        info!(
            account_id = %self.account_id,
            date = %date,
            rows = extraction.rows.len(),
            rejected = extraction.rejected.len(),
            outcome = ?extraction.outcome,
            "date extracted"
        );
        Ok(extraction)
    }

    /// Return to the query form. Best effort.
    pub async fn voltar(&mut self) -> bool {
        if !self.state.is_logged_in() {
            return false;
        }
        let back = match self.frame_with(FieldRole::BackAction).await {
            Ok(Some((_, html))) => self.locator.locate(&html, FieldRole::BackAction),
            Ok(None) => None,
            Err(err) => {
                warn!(account_id = %self.account_id, error = %err, "voltar lookup failed");
                None
            }
        };
        let Some(back) = back else {
            debug!(account_id = %self.account_id, "no back control, next query reopens the form");
            return false;
        };
        match self.click(&back.selector).await {
            Ok(()) => {
                self.settle().await;
                if matches!(self.state, DriverState::ResultsExtracted(_)) {
                    self.state = DriverState::FormReady;
                }
                true
            }
            Err(err) => {
                warn!(account_id = %self.account_id, error = %err, "voltar failed");
                false
            }
        }
    }

    /// Log out of the portal. Best effort.
    pub async fn sair(&mut self) -> bool {
        if !self.state.is_logged_in() {
            return false;
        }
        let logout = match self.frame_with(FieldRole::LogoutAction).await {
            Ok(Some((_, html))) => self.locator.locate(&html, FieldRole::LogoutAction),
            Ok(None) => None,
            Err(err) => {
                warn!(account_id = %self.account_id, error = %err, "logout lookup failed");
                None
            }
        };
        let Some(logout) = logout else {
            warn!(account_id = %self.account_id, "logout control not found");
            return false;
        };
        match self.click(&logout.selector).await {
            Ok(()) => {
                self.settle().await;
                self.form_frame = None;
                self.state = DriverState::BrowserReady;
                info!(account_id = %self.account_id, "logged out");
                true
            }
            Err(err) => {
                warn!(account_id = %self.account_id, error = %err, "logout failed");
                false
            }
        }
    }

    /// Release the browser. Idempotent; errors are logged and swallowed.
    pub async fn close(&mut self) {
        if self.state == DriverState::SessionClosed {
            return;
        }
        if let Err(err) = self.page.quit().await {
            warn!(account_id = %self.account_id, error = %err, "browser close failed");
        }
        self.state = DriverState::SessionClosed;
        debug!(account_id = %self.account_id, "browser session closed");
    }
}

#[async_trait]
impl<P: BrowserPage + 'static> PortalSession for PortalDriver<P> {
    fn state(&self) -> DriverState {
        self.state
    }

    async fn resume(&mut self, tokens: &SessionTokens) -> Result<bool, SyncError> {
        PortalDriver::resume(self, tokens).await
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<SessionTokens, SyncError> {
        PortalDriver::login(self, credentials).await
    }

    async fn buscar_agendamentos(&mut self, date: NaiveDate) -> Result<DayExtraction, SyncError> {
        PortalDriver::buscar_agendamentos(self, date).await
    }

    async fn voltar(&mut self) -> bool {
        PortalDriver::voltar(self).await
    }

    async fn sair(&mut self) -> bool {
        PortalDriver::sair(self).await
    }

    async fn close(&mut self) {
        PortalDriver::close(self).await
    }
}
