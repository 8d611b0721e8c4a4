use std::env;
use std::time::Duration;

/// Browser and portal settings. Every field has an env override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    pub home_path: String,
    /// Direct URL of the query form, used when the menu link cannot be found.
    pub form_path: String,
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub navigation_timeout: Duration,
    pub action_timeout: Duration,
    pub results_timeout: Duration,
    pub settle_delay: Duration,
    pub poll_interval: Duration,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://agendamento.portal.gov.br".to_string(),
            login_path: "/login".to_string(),
            home_path: "/principal".to_string(),
            form_path: "/agendamento/consulta".to_string(),
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport: (1366, 900),
            navigation_timeout: Duration::from_secs(90),
            action_timeout: Duration::from_secs(60),
            results_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl PortalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("PORTAL_BASE_URL", &defaults.base_url),
            login_path: env_string("PORTAL_LOGIN_PATH", &defaults.login_path),
            home_path: env_string("PORTAL_HOME_PATH", &defaults.home_path),
            form_path: env_string("PORTAL_FORM_PATH", &defaults.form_path),
            webdriver_url: env_string("WEBDRIVER_URL", &defaults.webdriver_url),
            headless: env_bool("PORTAL_HEADLESS", defaults.headless),
            user_agent: env_string("PORTAL_USER_AGENT", &defaults.user_agent),
            viewport: defaults.viewport,
            navigation_timeout: Duration::from_secs(env_u64("PORTAL_NAV_TIMEOUT_SECS", 90)),
            action_timeout: Duration::from_secs(env_u64("PORTAL_ACTION_TIMEOUT_SECS", 60)),
            results_timeout: Duration::from_secs(env_u64("PORTAL_RESULTS_TIMEOUT_SECS", 60)),
            settle_delay: Duration::from_millis(env_u64("PORTAL_SETTLE_MS", 1500)),
            poll_interval: defaults.poll_interval,
        }
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn login_url(&self) -> String {
        self.url(&self.login_path)
    }

    pub fn home_url(&self) -> String {
        self.url(&self.home_path)
    }

    pub fn form_url(&self) -> String {
        self.url(&self.form_path)
    }

    /// Whether `url` points at the login page, ignoring query strings.
    pub fn is_login_url(&self, url: &str) -> bool {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.trim_end_matches('/')
            .ends_with(self.login_path.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_base_and_paths() {
        let config = PortalConfig {
            base_url: "https://portal.test/".into(),
            ..PortalConfig::default()
        };
        assert_eq!(config.login_url(), "https://portal.test/login");
        assert_eq!(config.url("agendamento/consulta"), "https://portal.test/agendamento/consulta");
        assert_eq!(config.url("https://other.test/x"), "https://other.test/x");
        assert!(config.is_login_url("https://portal.test/login?expired=1"));
        assert!(!config.is_login_url("https://portal.test/principal"));
    }
}
