//! Read-only account registry.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use slotsync_core::dates::parse_work_days;
use slotsync_core::{AccountConfig, Credentials};
use tracing::warn;

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<AccountConfig>>;
    async fn list(&self) -> Result<Vec<AccountConfig>>;
}

#[derive(Debug, Clone, Deserialize)]
struct AccountsFile {
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountEntry {
    account_id: String,
    #[serde(default)]
    display_name: Option<String>,
    username: String,
    password_env: String,
    unit_code: String,
    service_code: String,
    #[serde(default)]
    work_days: Vec<String>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default = "default_true")]
    sync_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AccountEntry {
    fn resolve(self, env: &dyn Fn(&str) -> Option<String>) -> Result<AccountConfig> {
        let password = match env(&self.password_env) {
            Some(secret) => secret,
            None if self.active => bail!(
                "account {}: environment variable {} is not set",
                self.account_id,
                self.password_env
            ),
            None => String::new(),
        };
        let work_days = parse_work_days(&self.work_days)
            .map_err(|e| anyhow!("account {}: {e}", self.account_id))?;
        Ok(AccountConfig {
            display_name: self.display_name.unwrap_or_else(|| self.account_id.clone()),
            account_id: self.account_id,
            credentials: Credentials {
                username: self.username,
                password,
            },
            unit_code: self.unit_code,
            service_code: self.service_code,
            work_days,
            active: self.active,
            sync_enabled: self.sync_enabled,
        })
    }
}

/// Accounts loaded once from a YAML registry; secrets come from the environment.
#[derive(Debug, Clone, Default)]
pub struct YamlAccountDirectory {
    accounts: BTreeMap<String, AccountConfig>,
}

impl YamlAccountDirectory {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text, &|name| std::env::var(name).ok())
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let file: AccountsFile = serde_yaml::from_str(text)?;
        let mut accounts = BTreeMap::new();
        for entry in file.accounts {
            let account = entry.resolve(env)?;
            if account.work_days.is_empty() && account.is_schedulable() {
                warn!(account_id = %account.account_id, "account has no work days and will never sync on schedule");
            }
            if accounts.insert(account.account_id.clone(), account).is_some() {
                bail!("duplicate account id in registry");
            }
        }
        Ok(Self { accounts })
    }
}

#[async_trait]
impl AccountDirectory for YamlAccountDirectory {
    async fn get(&self, account_id: &str) -> Result<Option<AccountConfig>> {
        Ok(self.accounts.get(account_id).cloned())
    }

    async fn list(&self) -> Result<Vec<AccountConfig>> {
        Ok(self.accounts.values().cloned().collect())
    }
}

/// Fixed in-memory account list.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountDirectory {
    accounts: Vec<AccountConfig>,
}

impl StaticAccountDirectory {
    pub fn new(accounts: Vec<AccountConfig>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn get(&self, account_id: &str) -> Result<Option<AccountConfig>> {
        Ok(self.accounts.iter().find(|a| a.account_id == account_id).cloned())
    }

    async fn list(&self) -> Result<Vec<AccountConfig>> {
        Ok(self.accounts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    const REGISTRY: &str = r#"
accounts:
  - account_id: clinica-centro
    display_name: Clínica Centro
    username: "123.456.789-09"
    password_env: CENTRO_PASSWORD
    unit_code: U1
    service_code: S1
    work_days: [terca, quarta]
  - account_id: clinica-norte
    username: "98765432100"
    password_env: NORTE_PASSWORD
    unit_code: U2
    service_code: S1
    work_days: [sexta]
    active: false
"#;

    fn env(name: &str) -> Option<String> {
        (name == "CENTRO_PASSWORD").then(|| "s3cret".to_string())
    }

    #[tokio::test]
    async fn registry_resolves_secrets_and_work_days() {
        let dir = YamlAccountDirectory::from_yaml(REGISTRY, &env).expect("registry");
        let centro = dir.get("clinica-centro").await.expect("get").expect("present");
        assert_eq!(centro.display_name, "Clínica Centro");
        assert_eq!(centro.credentials.password, "s3cret");
        assert_eq!(centro.work_days, vec![Weekday::Tue, Weekday::Wed]);
        assert!(centro.is_schedulable());

        let norte = dir.get("clinica-norte").await.expect("get").expect("present");
        assert_eq!(norte.display_name, "clinica-norte");
        assert!(norte.credentials.password.is_empty());
        assert!(!norte.is_schedulable());
        assert_eq!(dir.list().await.expect("list").len(), 2);
        assert!(dir.get("missing").await.expect("get").is_none());
    }

    #[test]
    fn active_account_without_secret_is_rejected() {
        let err = YamlAccountDirectory::from_yaml(REGISTRY, &|_| None).expect_err("missing secret");
        assert!(err.to_string().contains("CENTRO_PASSWORD"));
    }

    #[tokio::test]
    async fn load_reports_the_registry_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("accounts.yaml");
        tokio::fs::write(&path, "accounts: [").await.expect("write");

        let err = YamlAccountDirectory::load(&path).await.expect_err("bad yaml");
        assert!(format!("{err:#}").contains("accounts.yaml"));

        let missing = YamlAccountDirectory::load(&dir.path().join("none.yaml")).await.expect_err("missing");
        assert!(format!("{missing:#}").contains("none.yaml"));
    }

    #[test]
    fn unknown_work_day_is_rejected() {
        let text = REGISTRY.replace("[sexta]", "[feriado]");
        assert!(YamlAccountDirectory::from_yaml(&text, &env).is_err());
    }
}
