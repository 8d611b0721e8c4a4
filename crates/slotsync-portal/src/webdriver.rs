//! [`BrowserPage`] over a W3C WebDriver session (chromedriver, geckodriver, selenium).

use std::time::Duration;

use async_trait::async_trait;
use fantoccini::cookies::Cookie;
use fantoccini::error::CmdError;
use fantoccini::wd::TimeoutConfiguration;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use slotsync_core::{SessionCookie, SyncError};
use tracing::{debug, info};

use crate::browser::BrowserPage;
use crate::config::PortalConfig;

fn cmd_err(action: &str, err: CmdError) -> SyncError {
    SyncError::classify(format!("webdriver {action}: {err}"))
}

const FILL_EVENTS_JS: &str = r#"
var el = document.querySelector(arguments[0]);
if (el) {
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  el.dispatchEvent(new Event('blur'));
}
"#;

const SELECT_OPTION_JS: &str = r#"
var sel = document.querySelector(arguments[0]);
if (!sel) { return false; }
for (var i = 0; i < sel.options.length; i++) {
  var opt = sel.options[i];
  if (opt.value === arguments[1] || opt.text.trim() === arguments[1]) {
    sel.selectedIndex = i;
    sel.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
  }
}
return false;
"#;

/// Ask the WebDriver server whether it can open sessions.
pub async fn probe_webdriver(webdriver_url: &str) -> Result<(), SyncError> {
    let url = format!("{}/status", webdriver_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| SyncError::Generic(format!("building webdriver probe client: {e}")))?;
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| SyncError::Generic(format!("webdriver not reachable at {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(SyncError::Generic(format!(
            "webdriver status {} at {url}",
            response.status()
        )));
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let ready = body
        .pointer("/value/ready")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !ready {
        return Err(SyncError::Generic(format!("webdriver at {url} is not ready")));
    }
    Ok(())
}

fn capabilities(config: &PortalConfig) -> Map<String, Value> {
    let (width, height) = config.viewport;
    let mut args = vec![
        format!("--window-size={width},{height}"),
        format!("--user-agent={}", config.user_agent),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--lang=pt-BR".to_string(),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    let mut caps = Map::new();
    caps.insert("browserName".into(), json!("chrome"));
    caps.insert("acceptInsecureCerts".into(), json!(true));
    caps.insert("goog:chromeOptions".into(), json!({ "args": args }));
    caps
}

#[derive(Clone)]
pub struct WebDriverPage {
    client: Client,
}

impl WebDriverPage {
    pub async fn launch(config: &PortalConfig) -> Result<Self, SyncError> {
        probe_webdriver(&config.webdriver_url).await?;
        let client = ClientBuilder::native()
            .capabilities(capabilities(config))
            .connect(&config.webdriver_url)
            .await
            .map_err(|e| SyncError::Generic(format!("browser initialization failed: {e}")))?;

        let timeouts = TimeoutConfiguration::new(
            Some(config.action_timeout),
            Some(config.navigation_timeout),
            Some(Duration::ZERO),
        );
        client
            .update_timeouts(timeouts)
            .await
            .map_err(|e| cmd_err("setting timeouts", e))?;
        let (width, height) = config.viewport;
        if let Err(err) = client.set_window_size(width, height).await {
            debug!(error = %err, "window resize not supported");
        }
        info!(webdriver = %config.webdriver_url, headless = config.headless, "browser session opened");
        Ok(Self { client })
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), SyncError> {
        self.client.goto(url).await.map_err(|e| cmd_err("navigation", e))
    }

    async fn current_url(&self) -> Result<String, SyncError> {
        self.client
            .current_url()
            .await
            .map(|u| u.to_string())
            .map_err(|e| cmd_err("reading url", e))
    }

    async fn content(&self) -> Result<String, SyncError> {
        self.client.source().await.map_err(|e| cmd_err("reading page source", e))
    }

    async fn frame_count(&self) -> Result<usize, SyncError> {
        self.client
            .find_all(Locator::Css("frame, iframe"))
            .await
            .map(|frames| frames.len())
            .map_err(|e| cmd_err("listing frames", e))
    }

    async fn enter_frame(&self, index: usize) -> Result<(), SyncError> {
        let index = u16::try_from(index)
            .map_err(|_| SyncError::SelectorDrift(format!("no such frame index {index}")))?;
        self.client
            .enter_frame(Some(index))
            .await
            .map_err(|e| cmd_err("entering frame", e))
    }

    async fn enter_top(&self) -> Result<(), SyncError> {
        self.client
            .enter_frame(None)
            .await
            .map_err(|e| cmd_err("entering top document", e))
    }

    async fn click(&self, selector: &str) -> Result<(), SyncError> {
        let element = self
            .client
            .find(Locator::Css(selector))
            .await
            .map_err(|e| cmd_err(&format!("locating {selector}"), e))?;
        element
            .click()
            .await
            .map_err(|e| cmd_err(&format!("clicking {selector}"), e))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), SyncError> {
        let element = self
            .client
            .find(Locator::Css(selector))
            .await
            .map_err(|e| cmd_err(&format!("locating {selector}"), e))?;
        element
            .clear()
            .await
            .map_err(|e| cmd_err(&format!("clearing {selector}"), e))?;
        element
            .send_keys(value)
            .await
            .map_err(|e| cmd_err(&format!("typing into {selector}"), e))?;
        self.client
            .execute(FILL_EVENTS_JS, vec![json!(selector)])
            .await
            .map_err(|e| cmd_err("dispatching input events", e))?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &str) -> Result<(), SyncError> {
        let picked = self
            .client
            .execute(SELECT_OPTION_JS, vec![json!(selector), json!(option)])
            .await
            .map_err(|e| cmd_err(&format!("selecting in {selector}"), e))?;
        if picked.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(SyncError::SelectorDrift(format!(
                "option '{option}' not found in {selector}"
            )))
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SyncError> {
        self.client.screenshot().await.map_err(|e| cmd_err("screenshot", e))
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, SyncError> {
        let cookies = self
            .client
            .get_all_cookies()
            .await
            .map_err(|e| cmd_err("reading cookies", e))?;
        Ok(cookies
            .iter()
            .map(|c| SessionCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(str::to_string),
                path: c.path().map(str::to_string),
            })
            .collect())
    }

    async fn add_cookies(&self, cookies: &[SessionCookie]) -> Result<(), SyncError> {
        for stored in cookies {
            let mut cookie = Cookie::new(stored.name.clone(), stored.value.clone());
            if let Some(domain) = &stored.domain {
                cookie.set_domain(domain.clone());
            }
            cookie.set_path(stored.path.clone().unwrap_or_else(|| "/".to_string()));
            self.client
                .add_cookie(cookie)
                .await
                .map_err(|e| cmd_err(&format!("restoring cookie {}", stored.name), e))?;
        }
        Ok(())
    }

    async fn quit(&self) -> Result<(), SyncError> {
        self.client
            .clone()
            .close()
            .await
            .map_err(|e| cmd_err("closing session", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_capabilities_carry_viewport_and_agent() {
        let config = PortalConfig {
            user_agent: "slotsync-test".into(),
            ..PortalConfig::default()
        };
        let caps = capabilities(&config);
        let args = caps["goog:chromeOptions"]["args"].as_array().expect("args");
        assert!(args.contains(&json!("--headless=new")));
        assert!(args.contains(&json!("--window-size=1366,900")));
        assert!(args.contains(&json!("--user-agent=slotsync-test")));
    }

    #[tokio::test]
    async fn probe_reports_unreachable_driver_as_generic() {
        let err = probe_webdriver("http://127.0.0.1:9").await.unwrap_err();
        assert_eq!(err.kind(), slotsync_core::ErrorKind::Generic);
    }
}
