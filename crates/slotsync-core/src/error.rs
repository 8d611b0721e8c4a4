//! Closed failure taxonomy shared by the driver, the orchestrator and the trigger surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Captcha,
    SelectorDrift,
    Timeout,
    Network,
    AlreadyRunning,
    InvalidRequest,
    Store,
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Captcha => "captcha",
            ErrorKind::SelectorDrift => "selector_drift",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Store => "store",
            ErrorKind::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "auth" => ErrorKind::Auth,
            "captcha" => ErrorKind::Captcha,
            "selector_drift" => ErrorKind::SelectorDrift,
            "timeout" => ErrorKind::Timeout,
            "network" => ErrorKind::Network,
            "already_running" => ErrorKind::AlreadyRunning,
            "invalid_request" => ErrorKind::InvalidRequest,
            "store" => ErrorKind::Store,
            "generic" => ErrorKind::Generic,
            _ => return None,
        })
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Captcha => Severity::Critical,
            ErrorKind::Auth | ErrorKind::Store | ErrorKind::Generic => Severity::Error,
            ErrorKind::SelectorDrift => Severity::Error,
            ErrorKind::Timeout | ErrorKind::Network => Severity::Warning,
            ErrorKind::AlreadyRunning | ErrorKind::InvalidRequest => Severity::Warning,
        }
    }

    /// Whether a per-date extraction failing with this kind may be retried and then skipped.
    pub fn retryable_per_date(&self) -> bool {
        matches!(
            self,
            ErrorKind::SelectorDrift | ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Generic
        )
    }

    /// Authentication-flavoured failures poison any cached session.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::Captcha)
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Auth => 401,
            ErrorKind::Captcha => 409,
            ErrorKind::AlreadyRunning => 409,
            ErrorKind::SelectorDrift => 422,
            ErrorKind::Timeout => 504,
            ErrorKind::Network => 503,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Store | ErrorKind::Generic => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    /// Needs a human before the account can sync again.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("captcha challenge requires human intervention: {0}")]
    Captcha(String),
    #[error("portal markup changed: {0}")]
    SelectorDrift(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("a sync run is already in progress for account {0}")]
    AlreadyRunning(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("{0}")]
    Generic(String),
}

const CAPTCHA_SIGNALS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "não sou um robô",
    "nao sou um robo",
    "i'm not a robot",
];

const AUTH_SIGNALS: &[&str] = &[
    "invalid credentials",
    "credenciais inválidas",
    "credenciais invalidas",
    "senha inválida",
    "senha invalida",
    "senha incorreta",
    "usuário inválido",
    "usuario invalido",
    "unauthorized",
    "not authenticated",
    "session expired",
    "sessão expirada",
    "sessao expirada",
    "redirected to login",
];

const TIMEOUT_SIGNALS: &[&str] = &["timed out", "timeout", "time out", "deadline exceeded"];

const NETWORK_SIGNALS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "econnreset",
    "econnrefused",
    "dns error",
    "name resolution",
    "net::err_",
    "network",
    "broken pipe",
];

const SELECTOR_SIGNALS: &[&str] = &[
    "no such element",
    "no such frame",
    "stale element",
    "element not interactable",
    "element not found",
    "selector",
    "could not locate",
];

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Captcha(_) => ErrorKind::Captcha,
            SyncError::SelectorDrift(_) => ErrorKind::SelectorDrift,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            SyncError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::Generic(_) => ErrorKind::Generic,
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    pub fn retryable_per_date(&self) -> bool {
        self.kind().retryable_per_date()
    }

    pub fn invalidates_session(&self) -> bool {
        self.kind().invalidates_session()
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Build the most specific error the message carries a signal for.
    pub fn classify(message: impl Into<String>) -> Self {
        SyncError::Generic(message.into()).upgrade()
    }

    /// Upgrade a generic failure by keyword inspection; typed errors pass through unchanged.
    pub fn upgrade(self) -> Self {
        let SyncError::Generic(message) = self else {
            return self;
        };
        let lower = message.to_lowercase();
        let hit = |signals: &[&str]| signals.iter().any(|s| lower.contains(s));

        if hit(CAPTCHA_SIGNALS) {
            SyncError::Captcha(message)
        } else if hit(AUTH_SIGNALS) {
            SyncError::Auth(message)
        } else if hit(TIMEOUT_SIGNALS) {
            SyncError::Timeout(message)
        } else if hit(NETWORK_SIGNALS) {
            SyncError::Network(message)
        } else if hit(SELECTOR_SIGNALS) {
            SyncError::SelectorDrift(message)
        } else {
            SyncError::Generic(message)
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        SyncError::Store(format!("{err:#}"))
    }

    /// Message without the category prefix, for user-facing payloads.
    pub fn detail(&self) -> &str {
        match self {
            SyncError::Auth(m)
            | SyncError::Captcha(m)
            | SyncError::SelectorDrift(m)
            | SyncError::Timeout(m)
            | SyncError::Network(m)
            | SyncError::AlreadyRunning(m)
            | SyncError::InvalidRequest(m)
            | SyncError::Store(m)
            | SyncError::Generic(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_upgrades_by_keyword() {
        assert_eq!(
            SyncError::classify("Element <div class=\"g-recaptcha\"> present").kind(),
            ErrorKind::Captcha
        );
        assert_eq!(
            SyncError::classify("webdriver: no such element: #txtCpf").kind(),
            ErrorKind::SelectorDrift
        );
        assert_eq!(
            SyncError::classify("navigation timed out after 90s").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            SyncError::classify("error sending request: connection refused").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            SyncError::classify("Senha inválida para o usuário").kind(),
            ErrorKind::Auth
        );
        assert_eq!(SyncError::classify("something odd").kind(), ErrorKind::Generic);
    }

    #[test]
    fn typed_errors_pass_through_upgrade_unchanged() {
        let err = SyncError::Network("timeout while on captcha page".into());
        assert_eq!(err.clone().upgrade(), err);
    }

    #[test]
    fn kinds_map_to_http_statuses() {
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::Captcha.http_status(), 409);
        assert_eq!(ErrorKind::SelectorDrift.http_status(), 422);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::Network.http_status(), 503);
        assert_eq!(ErrorKind::Generic.http_status(), 500);
    }

    #[test]
    fn only_auth_and_captcha_are_fatal_per_date() {
        assert!(!ErrorKind::Auth.retryable_per_date());
        assert!(!ErrorKind::Captcha.retryable_per_date());
        assert!(ErrorKind::Timeout.retryable_per_date());
        assert!(ErrorKind::SelectorDrift.retryable_per_date());
        assert!(ErrorKind::Captcha.invalidates_session());
        assert_eq!(ErrorKind::Captcha.severity(), Severity::Critical);
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in [ErrorKind::Auth, ErrorKind::SelectorDrift, ErrorKind::AlreadyRunning] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
