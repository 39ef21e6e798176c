//! Config loader with a time-to-live cache
//!
//! [`ConfigLoader::current`] answers from the cached snapshot while it is
//! fresh, re-probes the source's modification stamp once the freshness
//! window has passed, and re-parses only when the stamp changed.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{parse_snapshot, ConfigSnapshot};
use crate::error::{Error, FieldDiagnostic, Result};

/// Default freshness window
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(2000);

/// What the loader compares to decide whether the source changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl SourceStamp {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

struct CacheEntry {
    snapshot: Arc<ConfigSnapshot>,
    stamp: SourceStamp,
    checked_at: Instant,
    forced: bool,
}

/// Loads and caches the configuration snapshot
pub struct ConfigLoader {
    path: PathBuf,
    label_filter: Option<String>,
    ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
    /// Serializes probes and reloads; readers of a fresh cache never take it
    refresh: Mutex<()>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("path", &self.path)
            .field("label_filter", &self.label_filter)
            .field("ttl_ms", &self.ttl.as_millis())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConfigLoader {
    /// Create a loader. Nothing is read until the first [`current`](Self::current).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            label_filter: None,
            ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Restrict every snapshot to a single label
    pub fn with_label_filter(mut self, label: Option<String>) -> Self {
        self.label_filter = label;
        self
    }

    /// Set the freshness window
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Source path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process-wide label restriction, if any
    pub fn label_filter(&self) -> Option<&str> {
        self.label_filter.as_deref()
    }

    /// The current snapshot, reloading it if the source changed.
    ///
    /// A failed load leaves the previously cached snapshot in place for
    /// later calls but is reported to this caller.
    pub async fn current(&self) -> Result<Arc<ConfigSnapshot>> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        let _guard = self.refresh.lock().await;

        // another caller may have refreshed while we waited
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        let probed = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .map(|meta| SourceStamp::from_metadata(&meta));

        if let Some(stamp) = probed {
            let mut cache = self.cache.write();
            if let Some(entry) = cache.as_mut() {
                if !entry.forced && entry.stamp == stamp {
                    debug!(path = %self.path.display(), "configuration unchanged");
                    entry.checked_at = Instant::now();
                    return Ok(Arc::clone(&entry.snapshot));
                }
            }
        }

        self.reload().await
    }

    /// Read, validate and publish the source unconditionally
    pub async fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        match self.load().await {
            Ok((mut snapshot, stamp)) => {
                snapshot.generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let snapshot = Arc::new(snapshot);
                info!(
                    path = %self.path.display(),
                    generation = snapshot.generation,
                    targets = snapshot.len(),
                    "configuration loaded"
                );
                *self.cache.write() = Some(CacheEntry {
                    snapshot: Arc::clone(&snapshot),
                    stamp,
                    checked_at: Instant::now(),
                    forced: false,
                });
                Ok(snapshot)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "configuration load failed");
                Err(e)
            }
        }
    }

    /// Snapshot currently held in the cache, without any I/O
    pub fn cached(&self) -> Option<Arc<ConfigSnapshot>> {
        self.cache.read().as_ref().map(|e| Arc::clone(&e.snapshot))
    }

    /// Force the next [`current`](Self::current) to re-read the source
    pub fn invalidate(&self) {
        if let Some(entry) = self.cache.write().as_mut() {
            entry.forced = true;
        }
    }

    fn fresh(&self) -> Option<Arc<ConfigSnapshot>> {
        let cache = self.cache.read();
        let entry = cache.as_ref()?;
        (!entry.forced && entry.checked_at.elapsed() < self.ttl).then(|| Arc::clone(&entry.snapshot))
    }

    async fn load(&self) -> Result<(ConfigSnapshot, SourceStamp)> {
        // stamp before reading so an edit racing the read is seen by the next probe
        let stamp = tokio::fs::metadata(&self.path)
            .await
            .map(|meta| SourceStamp::from_metadata(&meta))
            .unwrap_or(SourceStamp {
                modified: None,
                len: u64::MAX,
            });

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::ConfigMissing {
                    path: self.path.clone(),
                },
                _ => Error::ConfigInvalid {
                    diagnostics: vec![FieldDiagnostic::new(
                        "<source>",
                        format!("cannot read {}: {e}", self.path.display()),
                    )],
                },
            })?;

        let mut snapshot = parse_snapshot(&content, self.label_filter.as_deref())?;
        snapshot.source_modified = stamp.modified;
        Ok((snapshot, stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    fn write_config(file: &mut tempfile::NamedTempFile, content: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        f.rewind().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_missing_source() {
        let loader = ConfigLoader::new("/nonexistent/sqlgate.yaml");
        let err = loader.current().await.unwrap_err();
        assert_eq!(err.kind(), "config_missing");
        assert!(loader.cached().is_none());
    }

    #[tokio::test]
    async fn test_fresh_cache_returns_same_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, "connections:\n  - { label: a, host: h }\n");

        let loader = ConfigLoader::new(file.path()).with_ttl(Duration::from_secs(60));
        let first = loader.current().await.unwrap();

        // edits inside the freshness window are not seen
        write_config(&mut file, "connections:\n  - { label: b, host: h }\n");
        let second = loader.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unchanged_source_keeps_generation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, "connections:\n  - { label: a, host: h }\n");

        let loader = ConfigLoader::new(file.path()).with_ttl(Duration::ZERO);
        let first = loader.current().await.unwrap();
        let second = loader.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.generation, 1);
    }

    #[tokio::test]
    async fn test_changed_source_is_reloaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, "connections:\n  - { label: a, host: h }\n");

        let loader = ConfigLoader::new(file.path()).with_ttl(Duration::ZERO);
        assert_eq!(loader.current().await.unwrap().labels(), vec!["a"]);

        write_config(&mut file, "connections:\n  - { label: abc, host: h }\n");
        let snapshot = loader.current().await.unwrap();
        assert_eq!(snapshot.labels(), vec!["abc"]);
        assert_eq!(snapshot.generation, 2);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_cache() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, "connections:\n  - { label: a, host: h }\n");

        let loader = ConfigLoader::new(file.path()).with_ttl(Duration::ZERO);
        loader.current().await.unwrap();

        write_config(&mut file, "connections:\n  - { label: a, port: 0 }\n");
        let err = loader.current().await.unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
        assert_eq!(loader.cached().unwrap().labels(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_label_filter_applies_to_every_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(
            &mut file,
            "connections:\n  - { label: a, host: h }\n  - { label: b, host: h }\n",
        );

        let loader = ConfigLoader::new(file.path()).with_label_filter(Some("b".into()));
        assert_eq!(loader.current().await.unwrap().labels(), vec!["b"]);
        assert_eq!(loader.label_filter(), Some("b"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reread() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, "connections:\n  - { label: a, host: h }\n");

        let loader = ConfigLoader::new(file.path()).with_ttl(Duration::from_secs(60));
        let first = loader.current().await.unwrap();
        loader.invalidate();
        let second = loader.current().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.generation, 2);
    }
}
