//! Local diagnostic artifact storage, session cache and retry backoff for slotsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use slotsync_core::identity::sha256_hex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

mod session;

pub use session::{SessionCache, SweeperHandle, DEFAULT_SESSION_TTL};

pub const CRATE_NAME: &str = "slotsync-storage";

/// One piece of a failure capture bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPart {
    Snapshot,
    Dom,
    Inventory,
}

impl ArtifactPart {
    pub fn file_stem(&self) -> &'static str {
        match self {
            ArtifactPart::Snapshot => "snapshot",
            ArtifactPart::Dom => "dom",
            ArtifactPart::Inventory => "inventory",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactPart::Snapshot => "png",
            ArtifactPart::Dom => "html",
            ArtifactPart::Inventory => "json",
        }
    }
}

/// Identifies the failure a bundle belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CaptureKey<'a> {
    pub captured_at: DateTime<Utc>,
    pub account_id: &'a str,
    /// Driver step that failed, e.g. `login` or `buscar-2025-11-04`.
    pub context: &'a str,
    /// `ErrorKind` name of the failure.
    pub failure_kind: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub part: ArtifactPart,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Failure diagnostics grouped as one directory per captured failure:
/// `{account}/{yyyymmdd}/{hhmmss}-{kind}-{context}/{part}.{ext}`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn slug(input: &str) -> String {
    let slug = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

const MAX_NAME_COLLISIONS: usize = 50;

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundle_dir(&self, key: &CaptureKey<'_>) -> PathBuf {
        PathBuf::from(slug(key.account_id))
            .join(key.captured_at.format("%Y%m%d").to_string())
            .join(format!(
                "{}-{}-{}",
                key.captured_at.format("%H%M%S"),
                slug(key.failure_kind),
                slug(key.context)
            ))
    }

    /// Write one part of a capture bundle. Never overwrites: a second capture of
    /// the same failure within the same second gets a numbered file name.
    pub async fn write_part(
        &self,
        key: &CaptureKey<'_>,
        part: ArtifactPart,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let bundle = self.bundle_dir(key);
        let dir = self.root.join(&bundle);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating capture bundle {}", dir.display()))?;

        for n in 1..=MAX_NAME_COLLISIONS {
            let name = match n {
                1 => format!("{}.{}", part.file_stem(), part.extension()),
                n => format!("{}-{n}.{}", part.file_stem(), part.extension()),
            };
            let absolute_path = dir.join(&name);
            let opened = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&absolute_path)
                .await;
            let mut file = match opened {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("opening {}", absolute_path.display()))
                }
            };
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing {}", absolute_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing {}", absolute_path.display()))?;
            return Ok(StoredArtifact {
                part,
                content_hash: sha256_hex(bytes),
                relative_path: bundle.join(name),
                absolute_path,
                byte_size: bytes.len(),
            });
        }
        anyhow::bail!(
            "capture bundle {} already holds {MAX_NAME_COLLISIONS} {} files",
            dir.display(),
            part.file_stem()
        )
    }

    pub async fn write_json_part<T: Serialize>(
        &self,
        key: &CaptureKey<'_>,
        part: ArtifactPart,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing capture json")?;
        self.write_part(key, part, &bytes).await
    }
}

/// Exponential backoff with proportional jitter, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay after the `attempt_index`-th failure (0-based).
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn captured_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-11-04T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn key<'a>(context: &'a str, kind: &'a str) -> CaptureKey<'a> {
        CaptureKey {
            captured_at: captured_at(),
            account_id: "Clinica Centro",
            context,
            failure_kind: kind,
        }
    }

    #[tokio::test]
    async fn parts_of_one_failure_share_a_bundle_directory() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let failure = key("buscar-2025-11-04", "selector_drift");

        let png = store
            .write_part(&failure, ArtifactPart::Snapshot, b"\x89PNG")
            .await
            .expect("snapshot");
        let dom = store
            .write_part(&failure, ArtifactPart::Dom, b"<html></html>")
            .await
            .expect("dom");

        let bundle = PathBuf::from("clinica-centro/20251104/120000-selector-drift-buscar-2025-11-04");
        assert_eq!(png.relative_path, bundle.join("snapshot.png"));
        assert_eq!(dom.relative_path, bundle.join("dom.html"));
        assert_eq!(dom.content_hash, sha256_hex(b"<html></html>"));
        assert_eq!(std::fs::read(&dom.absolute_path).expect("read"), b"<html></html>");
    }

    #[tokio::test]
    async fn repeated_capture_in_the_same_second_never_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let failure = key("login", "timeout");

        let first = store
            .write_part(&failure, ArtifactPart::Dom, b"<p>first</p>")
            .await
            .expect("first");
        let second = store
            .write_part(&failure, ArtifactPart::Dom, b"<p>second</p>")
            .await
            .expect("second");

        assert_ne!(first.absolute_path, second.absolute_path);
        assert!(second.relative_path.ends_with("dom-2.html"));
        assert_eq!(std::fs::read(&first.absolute_path).expect("read"), b"<p>first</p>");
        assert_eq!(std::fs::read(&second.absolute_path).expect("read"), b"<p>second</p>");
    }

    #[tokio::test]
    async fn inventory_json_is_pretty_printed() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let stored = store
            .write_json_part(&key("login", "auth"), ArtifactPart::Inventory, &vec!["a", "b"])
            .await
            .expect("store json");
        assert!(stored.relative_path.ends_with("inventory.json"));
        let text = std::fs::read_to_string(stored.absolute_path).expect("read back");
        assert!(text.contains("\n"));
        assert!(text.contains("\"a\""));
    }

    #[test]
    fn retry_delay_doubles_per_attempt_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(8000));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_millis(1500), "{delay:?}");
            assert!(delay <= Duration::from_millis(2500), "{delay:?}");
            assert!(policy.jittered_delay(5) <= policy.max_delay);
        }
    }
}
