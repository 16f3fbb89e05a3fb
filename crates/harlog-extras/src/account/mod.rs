//! Account metadata cache.
//!
//! Resolves the base log URL for an API key from the account API and keeps
//! it in a TTL cache. Lookups never fail: every error, including timeouts,
//! degrades to `None` and is itself cached for a short retry interval.
//!
//! Per key the cache moves between these states:
//!
//! - absent: fetch, then fresh on success or degraded on failure
//! - fresh (`now - lastUpdated < ttl`): served without a network call
//! - stale: refetched; on failure the old value is still served while it
//!   is younger than `max_stale`
//! - degraded (`baseUrl: null`): refetched once `retryAfter` has passed

mod store;

pub use store::{cache_key, CacheEntry, CacheStore, FileCacheStore, MemoryCacheStore};

#[cfg(feature = "file-cache")]
pub use store::default_cache_dir;

use dashmap::DashMap;
use harlog_core::MetricsConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;

/// Error type for account API lookups. Never escapes [`AccountCache`].
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("account API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("account lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("account API response has no baseUrl")]
    MissingBaseUrl,

    #[error("invalid account API response: {0}")]
    Decode(String),
}

/// Result type alias for account lookups.
pub type AccountResult<T> = std::result::Result<T, AccountError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    base_url: Option<String>,
}

/// Error body returned by the account API on 401/403/404.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
    suggestion: Option<String>,
}

/// Timing knobs for the cache.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub failure_retry: Duration,
    pub max_stale: Duration,
    pub timeout: Duration,
}

impl From<&MetricsConfig> for CachePolicy {
    fn from(config: &MetricsConfig) -> Self {
        Self {
            ttl: config.cache_ttl,
            failure_retry: config.failure_retry,
            max_stale: config.max_stale,
            timeout: config.timeout,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// TTL cache of base log URLs keyed by hashed API key.
pub struct AccountCache {
    client: reqwest::Client,
    api_url: String,
    policy: CachePolicy,
    store: Arc<dyn CacheStore>,
    refreshing: DashMap<String, Arc<Mutex<()>>>,
}

impl AccountCache {
    /// Create a cache backed by `store`, querying `api_url`.
    pub fn new(
        api_url: impl Into<String>,
        policy: CachePolicy,
        store: Arc<dyn CacheStore>,
    ) -> AccountResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("harlog/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            policy,
            store,
            refreshing: DashMap::new(),
        })
    }

    /// Create a cache from middleware configuration.
    ///
    /// Uses `cache_dir` when configured, else the user cache directory
    /// (with the `file-cache` feature), else memory.
    pub fn from_config(config: &MetricsConfig) -> AccountResult<Self> {
        Self::new(
            config.account_api_url.clone(),
            CachePolicy::from(config),
            default_store(config),
        )
    }

    /// Replace the backing store.
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = store;
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// The base log URL for `api_key`, or `None` if it can't be resolved.
    ///
    /// Network work is bounded by the configured timeout.
    pub async fn get_base_url(&self, api_key: &str) -> Option<String> {
        let key = cache_key(api_key);
        let current = self.store.load(&key);
        if let Some(entry) = &current {
            if !entry.is_expired(now_secs(), self.policy.ttl) {
                return entry.base_url.clone();
            }
        }

        match tokio::time::timeout(self.policy.timeout, self.refresh(&key, api_key)).await {
            Ok(base_url) => base_url,
            Err(_) => {
                let e = AccountError::Timeout(self.policy.timeout);
                tracing::warn!(error = %e, "account metadata unavailable");
                self.record_failure(&key, now_secs())
            }
        }
    }

    async fn refresh(&self, key: &str, api_key: &str) -> Option<String> {
        let lock = Arc::clone(&self.refreshing.entry(key.to_string()).or_default());
        let _guard = lock.lock().await;

        // Another caller may have refreshed while this one waited.
        let now = now_secs();
        if let Some(entry) = self.store.load(key) {
            if !entry.is_expired(now, self.policy.ttl) {
                return entry.base_url;
            }
        }

        match self.fetch(api_key).await {
            Ok(base_url) => {
                self.store.save(key, &CacheEntry::fresh(&base_url, now));
                Some(base_url)
            }
            Err(e) => {
                tracing::warn!(error = %e, "account metadata unavailable");
                self.record_failure(key, now)
            }
        }
    }

    /// Persist a failed lookup and return what may still be served.
    fn record_failure(&self, key: &str, now: u64) -> Option<String> {
        let retry_after = Some(now + self.policy.failure_retry.as_secs());
        let usable = self.store.load(key).filter(|prev| {
            prev.base_url.is_some()
                && now.saturating_sub(prev.last_updated) < self.policy.max_stale.as_secs()
        });

        let entry = match usable {
            Some(prev) => CacheEntry {
                retry_after,
                ..prev
            },
            None => CacheEntry {
                base_url: None,
                last_updated: now,
                retry_after,
            },
        };
        self.store.save(key, &entry);
        entry.base_url
    }

    async fn fetch(&self, api_key: &str) -> AccountResult<String> {
        let response = self
            .client
            .get(format!("{}/v1/", self.api_url))
            .basic_auth(api_key, Some(""))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: ApiErrorBody = response.json().await.unwrap_or_default();
            if let Some(suggestion) = &body.suggestion {
                tracing::debug!(error = ?body.error, suggestion = %suggestion, "account API error");
            }
            return Err(AccountError::Status {
                status: status.as_u16(),
                message: body.message.unwrap_or_default(),
            });
        }

        let info: AccountInfo = response
            .json()
            .await
            .map_err(|e| AccountError::Decode(e.to_string()))?;
        info.base_url
            .filter(|url| !url.is_empty())
            .ok_or(AccountError::MissingBaseUrl)
    }
}

fn default_store(config: &MetricsConfig) -> Arc<dyn CacheStore> {
    if let Some(dir) = &config.cache_dir {
        return Arc::new(FileCacheStore::new(dir));
    }
    #[cfg(feature = "file-cache")]
    if let Some(dir) = default_cache_dir() {
        return Arc::new(FileCacheStore::new(dir));
    }
    Arc::new(MemoryCacheStore::new())
}
