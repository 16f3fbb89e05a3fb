//! # harlog-extras
//!
//! The runtime half of harlog: the pieces that touch the network or need an
//! async runtime.
//!
//! - [`layer`] - tower middleware capturing each request/response pair
//! - [`dispatch`] - batching queue posting payloads to the collector
//! - [`account`] - TTL cache of account metadata (the base log URL)
//! - [`webhook`] - signature verification for inbound webhooks
//!
//! ## Features
//!
//! - `webhook` (default) - webhook signature verification
//! - `file-cache` (default) - keep account metadata in the user cache
//!   directory across restarts
//! - `full` - all features enabled

#![warn(rustdoc::missing_crate_level_docs)]

pub mod account;
pub mod dispatch;
pub mod layer;

#[cfg(feature = "webhook")]
pub mod webhook;

pub use account::{AccountCache, CacheStore, FileCacheStore, MemoryCacheStore};
pub use dispatch::{CollectorSink, DispatchError, DispatchQueue, HttpCollector};
pub use layer::{
    BuildError, MetricsLayer, MetricsLayerBuilder, MetricsLogger, MetricsService, PeerAddr,
    Transaction, DOCUMENTATION_URL,
};

#[cfg(feature = "webhook")]
pub use webhook::{sign, verify, verify_json, WebhookError, SIGNATURE_HEADER};
