//! Middleware options and their validated form.
//!
//! [`MetricsOptions`] is the builder the host application fills in.
//! [`MetricsOptions::build`] validates it once and produces an immutable
//! [`MetricsConfig`]; legacy option names are folded into a single
//! [`RedactionRule`] at that point.
//!
//! ```ignore
//! use harlog_core::options::MetricsOptions;
//!
//! let config = MetricsOptions::new("my-api-key")
//!     .buffer_length(20)
//!     .denylist(["password", "card.number"])
//!     .development(true)
//!     .build()?;
//! ```

use crate::error::{ConfigError, ConfigResult};
use crate::redaction::RedactionRule;
use std::path::PathBuf;
use std::time::Duration;

/// Default collector host.
pub const DEFAULT_COLLECTOR_URL: &str = "https://metrics.readme.io";
/// Default account API host.
pub const DEFAULT_ACCOUNT_API_URL: &str = "https://dash.readme.com/api";
/// Default capture limit for request and response bodies, in bytes.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Builder for middleware options.
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub(crate) api_key: Option<String>,
    pub(crate) buffer_length: usize,
    pub(crate) base_log_url: Option<String>,
    pub(crate) denylist: Option<Vec<String>>,
    pub(crate) blacklist: Option<Vec<String>>,
    pub(crate) allowlist: Option<Vec<String>>,
    pub(crate) whitelist: Option<Vec<String>>,
    pub(crate) development: bool,
    pub(crate) timeout: Duration,
    pub(crate) collector_url: String,
    pub(crate) account_api_url: String,
    pub(crate) cache_ttl: Duration,
    pub(crate) failure_retry: Duration,
    pub(crate) max_stale: Duration,
    pub(crate) cache_dir: Option<PathBuf>,
    pub(crate) allowed_hosts: Option<Vec<String>>,
    pub(crate) max_body_size: usize,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            buffer_length: 10,
            base_log_url: None,
            denylist: None,
            blacklist: None,
            allowlist: None,
            whitelist: None,
            development: false,
            timeout: Duration::from_millis(1000),
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            account_api_url: DEFAULT_ACCOUNT_API_URL.to_string(),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            failure_retry: Duration::from_secs(2 * 60),
            max_stale: Duration::from_secs(7 * 24 * 60 * 60),
            cache_dir: None,
            allowed_hosts: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl MetricsOptions {
    /// Options for `api_key` with every other setting at its default.
    ///
    /// Defaults:
    /// - Buffer length: 10
    /// - No redaction
    /// - Development: false
    /// - Timeout: 1000 ms
    /// - Account cache TTL: 24 hours, retry after failure: 2 minutes,
    ///   stale values served for at most 7 days
    /// - Every host logged
    /// - Bodies captured up to 1 MiB
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Number of payloads per collector batch.
    pub fn buffer_length(mut self, n: usize) -> Self {
        self.buffer_length = n;
        self
    }

    /// Fixed base URL for `x-documentation-url`; skips the account lookup.
    pub fn base_log_url(mut self, url: impl Into<String>) -> Self {
        self.base_log_url = Some(url.into());
        self
    }

    /// Field paths to redact.
    pub fn denylist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denylist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Legacy name for [`denylist`](Self::denylist).
    pub fn blacklist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Field paths to keep; everything else is redacted.
    pub fn allowlist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Legacy name for [`allowlist`](Self::allowlist).
    pub fn whitelist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }

    /// Upper bound on the blocking account lookup.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn collector_url(mut self, url: impl Into<String>) -> Self {
        self.collector_url = url.into();
        self
    }

    pub fn account_api_url(mut self, url: impl Into<String>) -> Self {
        self.account_api_url = url.into();
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn failure_retry(mut self, retry: Duration) -> Self {
        self.failure_retry = retry;
        self
    }

    pub fn max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    /// Directory for the on-disk account cache. Without it the cache is
    /// kept in memory only.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Only log requests whose host is in this list.
    pub fn allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Largest request or response body to capture, in bytes. Larger
    /// bodies are still served in full but logged as a placeholder.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Validate and freeze the options.
    pub fn build(self) -> ConfigResult<MetricsConfig> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        if self.buffer_length == 0 {
            return Err(ConfigError::InvalidBufferLength(self.buffer_length));
        }

        validate_url("collector", &self.collector_url)?;
        validate_url("account API", &self.account_api_url)?;
        if let Some(base) = &self.base_log_url {
            validate_url("base log", base)?;
        }

        let deny = merge(self.denylist, self.blacklist);
        let allow = merge(self.allowlist, self.whitelist);
        let redaction = RedactionRule::from_lists(allow, deny)?;

        Ok(MetricsConfig {
            api_key,
            buffer_length: self.buffer_length,
            base_log_url: self
                .base_log_url
                .map(|u| u.trim_end_matches('/').to_string()),
            redaction,
            development: self.development,
            timeout: self.timeout,
            collector_url: self.collector_url.trim_end_matches('/').to_string(),
            account_api_url: self.account_api_url.trim_end_matches('/').to_string(),
            cache_ttl: self.cache_ttl,
            failure_retry: self.failure_retry,
            max_stale: self.max_stale,
            cache_dir: self.cache_dir,
            allowed_hosts: self
                .allowed_hosts
                .map(|hosts| hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect()),
            max_body_size: self.max_body_size,
        })
    }
}

fn merge(canonical: Option<Vec<String>>, legacy: Option<Vec<String>>) -> Option<Vec<String>> {
    match (canonical, legacy) {
        (Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        (a, b) => a.or(b),
    }
}

fn validate_url(option: &'static str, value: &str) -> ConfigResult<()> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl {
            option,
            value: value.to_string(),
        })
}

/// Validated, immutable middleware configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub api_key: String,
    pub buffer_length: usize,
    pub base_log_url: Option<String>,
    pub redaction: RedactionRule,
    pub development: bool,
    pub timeout: Duration,
    pub collector_url: String,
    pub account_api_url: String,
    pub cache_ttl: Duration,
    pub failure_retry: Duration,
    pub max_stale: Duration,
    pub cache_dir: Option<PathBuf>,
    pub allowed_hosts: Option<Vec<String>>,
    pub max_body_size: usize,
}

impl MetricsConfig {
    /// Whether requests to `host` should be logged.
    pub fn host_allowed(&self, host: &str) -> bool {
        match &self.allowed_hosts {
            None => true,
            Some(hosts) => {
                let host = host.to_ascii_lowercase();
                let bare = host.split(':').next().unwrap_or_default();
                hosts.iter().any(|h| *h == host || h == bare)
            }
        }
    }
}

#[cfg(feature = "env")]
mod env {
    use super::MetricsOptions;
    use crate::error::ConfigResult;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct EnvOptions {
        api_key: Option<String>,
        buffer_length: Option<usize>,
        base_log_url: Option<String>,
        denylist: Option<Vec<String>>,
        allowlist: Option<Vec<String>>,
        development: Option<bool>,
        timeout_ms: Option<u64>,
        collector_url: Option<String>,
        account_api_url: Option<String>,
        cache_dir: Option<String>,
        allowed_hosts: Option<Vec<String>>,
        max_body_size: Option<usize>,
    }

    impl MetricsOptions {
        /// Read options from `HARLOG_*` environment variables, loading a
        /// `.env` file first if there is one.
        ///
        /// `HARLOG_MAX_BODY_SIZE` is in bytes. Lists (`HARLOG_DENYLIST`,
        /// `HARLOG_ALLOWLIST`, `HARLOG_ALLOWED_HOSTS`) are comma-separated.
        pub fn from_env() -> ConfigResult<Self> {
            let _ = dotenvy::dotenv();
            Self::from_vars(std::env::vars())
        }

        /// Like [`from_env`](Self::from_env) but over an explicit set of
        /// variables.
        pub fn from_vars<I>(vars: I) -> ConfigResult<Self>
        where
            I: IntoIterator<Item = (String, String)>,
        {
            let env: EnvOptions = envy::prefixed("HARLOG_").from_iter(vars)?;
            let mut options = MetricsOptions::default();

            options.api_key = env.api_key;
            if let Some(n) = env.buffer_length {
                options.buffer_length = n;
            }
            options.base_log_url = env.base_log_url;
            options.denylist = env.denylist;
            options.allowlist = env.allowlist;
            if let Some(development) = env.development {
                options.development = development;
            }
            if let Some(ms) = env.timeout_ms {
                options.timeout = Duration::from_millis(ms);
            }
            if let Some(url) = env.collector_url {
                options.collector_url = url;
            }
            if let Some(url) = env.account_api_url {
                options.account_api_url = url;
            }
            options.cache_dir = env.cache_dir.map(Into::into);
            options.allowed_hosts = env.allowed_hosts;
            if let Some(n) = env.max_body_size {
                options.max_body_size = n;
            }

            Ok(options)
        }
    }
}
