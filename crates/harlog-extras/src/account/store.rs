//! Persistence for account metadata cache entries.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Cached account metadata for one API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// `None` after a failed lookup.
    pub base_url: Option<String>,
    /// Epoch seconds of the last successful fetch, or of the failed
    /// attempt if there never was one.
    pub last_updated: u64,
    /// Epoch seconds before which a failed lookup is not retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl CacheEntry {
    pub fn fresh(base_url: impl Into<String>, now: u64) -> Self {
        Self {
            base_url: Some(base_url.into()),
            last_updated: now,
            retry_after: None,
        }
    }

    /// Whether the entry should be refetched at `now`.
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        match self.retry_after {
            Some(at) => now >= at,
            None => now.saturating_sub(self.last_updated) >= ttl.as_secs(),
        }
    }
}

/// The storage key for an API key. The raw key never reaches disk.
pub fn cache_key(api_key: &str) -> String {
    let encoded = STANDARD.encode(format!("{}:", api_key));
    format!(
        "{}-{}-{:x}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        Sha256::digest(encoded.as_bytes())
    )
}

/// Where cache entries live.
pub trait CacheStore: Send + Sync + 'static {
    fn load(&self, key: &str) -> Option<CacheEntry>;
    fn save(&self, key: &str, entry: &CacheEntry);
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn save(&self, key: &str, entry: &CacheEntry) {
        self.entries.insert(key.to_string(), entry.clone());
    }
}

/// One JSON file per key under a directory, with an in-memory copy in
/// front.
///
/// Each key is read from disk at most once per process. Writes go to
/// memory immediately and to disk on the blocking pool when a Tokio
/// runtime is available. I/O errors are logged and treated as a cache miss.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
    memory: Arc<DashMap<String, CacheEntry>>,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: Arc::new(DashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn read(&self, key: &str) -> Option<CacheEntry> {
        let raw = match std::fs::read(self.path(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read account cache");
                return None;
            }
        };
        serde_json::from_slice(&raw)
            .map_err(|e| tracing::warn!(error = %e, "corrupt account cache entry"))
            .ok()
    }
}

fn write(dir: &Path, path: &Path, entry: &CacheEntry) {
    let result = std::fs::create_dir_all(dir).and_then(|_| {
        let json = serde_json::to_vec(entry)?;
        std::fs::write(path, json)
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to write account cache");
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.get(key) {
            return Some(entry.value().clone());
        }
        let entry = self.read(key)?;
        self.memory.insert(key.to_string(), entry.clone());
        Some(entry)
    }

    fn save(&self, key: &str, entry: &CacheEntry) {
        self.memory.insert(key.to_string(), entry.clone());

        let dir = self.dir.clone();
        let path = self.path(key);
        let entry = entry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write(&dir, &path, &entry));
            }
            Err(_) => write(&dir, &path, &entry),
        }
    }
}

/// `<user cache dir>/harlog`, if the platform has one.
#[cfg(feature = "file-cache")]
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("harlog"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_hides_api_key() {
        let key = cache_key("super-secret");

        assert!(!key.contains("super-secret"));
        assert!(key.starts_with("harlog-extras-"));
        assert_eq!(key, cache_key("super-secret"));
        assert_ne!(key, cache_key("other"));
    }

    #[test]
    fn test_expiry() {
        let ttl = Duration::from_secs(100);

        let entry = CacheEntry::fresh("https://x", 1_000);
        assert!(!entry.is_expired(1_050, ttl));
        assert!(entry.is_expired(1_100, ttl));

        let failed = CacheEntry {
            base_url: None,
            last_updated: 1_000,
            retry_after: Some(1_010),
        };
        assert!(!failed.is_expired(1_005, ttl));
        assert!(failed.is_expired(1_010, ttl));
    }

    #[test]
    fn test_entry_serialization() {
        let json = serde_json::to_value(CacheEntry::fresh("https://x", 5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"baseUrl": "https://x", "lastUpdated": 5})
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCacheStore::new();
        assert!(store.load("k").is_none());

        store.save("k", &CacheEntry::fresh("https://x", 1));
        assert_eq!(store.load("k"), Some(CacheEntry::fresh("https://x", 1)));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path().join("nested"));
        assert!(store.load("k").is_none());

        let entry = CacheEntry {
            base_url: None,
            last_updated: 10,
            retry_after: Some(130),
        };
        store.save("k", &entry);

        assert_eq!(store.load("k"), Some(entry.clone()));
        assert!(dir.path().join("nested").join("k.json").exists());

        // A new store starts from what is on disk.
        let reopened = FileCacheStore::new(dir.path().join("nested"));
        assert_eq!(reopened.load("k"), Some(entry));
    }

    #[test]
    fn test_file_store_serves_hits_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        store.save("k", &CacheEntry::fresh("https://x", 1));

        std::fs::remove_file(dir.path().join("k.json")).unwrap();
        assert_eq!(store.load("k"), Some(CacheEntry::fresh("https://x", 1)));
    }

    #[tokio::test]
    async fn test_file_store_writes_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::new(dir.path());
        store.save("k", &CacheEntry::fresh("https://x", 1));

        // Visible at once through the store, on disk shortly after.
        assert_eq!(store.load("k"), Some(CacheEntry::fresh("https://x", 1)));
        let path = dir.path().join("k.json");
        for _ in 0..100 {
            if FileCacheStore::new(dir.path()).load("k").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());
    }

    #[test]
    fn test_file_store_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k.json"), b"{not json").unwrap();

        assert!(FileCacheStore::new(dir.path()).load("k").is_none());
    }
}
