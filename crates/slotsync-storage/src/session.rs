use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use slotsync_core::SessionTokens;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Shorter than the portal's own server-side session expiry.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(45 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    tokens: SessionTokens,
    expires_at: Instant,
}

/// Process-wide account -> authenticated session store. Never persisted.
#[derive(Debug)]
pub struct SessionCache {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached tokens for `account_id`, or `None` when absent or expired.
    pub async fn get(&self, account_id: &str) -> Option<SessionTokens> {
        let mut entries = self.entries.lock().await;
        match entries.get(account_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.tokens.clone()),
            Some(_) => {
                entries.remove(account_id);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, account_id: &str, tokens: SessionTokens, ttl: Duration) {
        let entry = CacheEntry {
            tokens,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .await
            .insert(account_id.to_string(), entry);
    }

    pub async fn set_default(&self, account_id: &str, tokens: SessionTokens) {
        self.set(account_id, tokens, self.default_ttl).await;
    }

    /// Returns whether an entry was present.
    pub async fn clear(&self, account_id: &str) -> bool {
        self.entries.lock().await.remove(account_id).is_some()
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn the periodic sweep. The task ends when the handle is stopped or dropped,
    /// or when the cache itself is dropped.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let weak: Weak<SessionCache> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "session cache sweep removed expired entries");
                }
            }
        });
        SweeperHandle { handle }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotsync_core::SessionCookie;

    fn tokens(value: &str) -> SessionTokens {
        SessionTokens {
            cookies: vec![SessionCookie {
                name: "JSESSIONID".into(),
                value: value.into(),
                domain: None,
                path: Some("/".into()),
            }],
            landing_url: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set_default("acct", tokens("abc")).await;
        assert_eq!(cache.get("acct").await, Some(tokens("abc")));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("acct").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn clear_reports_presence() {
        let cache = SessionCache::default();
        cache.set("acct", tokens("abc"), Duration::from_secs(5)).await;
        assert!(cache.clear("acct").await);
        assert!(!cache.clear("acct").await);
        assert_eq!(cache.get("acct").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries_in_background() {
        let cache = Arc::new(SessionCache::new(Duration::from_secs(10)));
        cache.set_default("a", tokens("1")).await;
        cache.set("b", tokens("2"), Duration::from_secs(600)).await;
        let sweeper = cache.start_sweeper(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("b").await.is_some());
        sweeper.stop();
    }
}
