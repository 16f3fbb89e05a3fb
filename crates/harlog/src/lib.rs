//! # harlog
//!
//! Request/response logging for tower services. Every transaction the
//! middleware serves is captured as a HAR 1.2 entry, redacted according to
//! an allow or deny list, and shipped in batches to a metrics collector.
//! The instrumented service is never blocked or failed by logging: at worst
//! a log entry is lost.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use harlog::prelude::*;
//!
//! let metrics = MetricsLayer::builder(
//!     MetricsOptions::new(std::env::var("README_API_KEY")?)
//!         .denylist(["password", "card.number"])
//!         .buffer_length(10),
//! )
//! .grouping(|parts| {
//!     let user = parts.extensions.get::<CurrentUser>()?;
//!     Some(Group::new().api_key(&user.api_key).label(&user.name).email(&user.email))
//! })
//! .build()?;
//!
//! let app = tower::ServiceBuilder::new()
//!     .layer(metrics.clone())
//!     .service(router);
//!
//! // ... serve `app` ...
//!
//! metrics.logger().shutdown().await;
//! ```
//!
//! ## Redaction
//!
//! Field paths use dot notation (`user.password`) and match case-insensitively
//! against headers, query parameters, cookies, form fields and JSON bodies.
//! A deny list replaces matching values with `"[REDACTED <n>]"`; an allow
//! list keeps matching values and redacts everything else. The shape of the
//! data is always preserved. `Authorization` headers are masked regardless.
//!
//! ## Optional Features
//!
//! - `env` (default) - [`MetricsOptions::from_env`] reads `HARLOG_*`
//!   variables and `.env` files
//! - `webhook` (default) - [`webhook::verify`] for signed webhook requests
//! - `file-cache` (default) - persist account metadata across restarts
//! - `full` - all optional features enabled

pub use harlog_core::{
    capture_request, capture_response, find_api_key, mask, CapturedBody, ConfigError, Creator,
    FieldPath, Group, HarEntry, HarRequest, HarResponse, MetricsConfig, MetricsOptions, MountPath,
    Payload, PayloadGroup, RedactionRule,
};

pub use harlog_extras::{account, dispatch, layer};
pub use harlog_extras::{
    AccountCache, BuildError, CollectorSink, DispatchQueue, HttpCollector, MetricsLayer,
    MetricsLogger, MetricsService, PeerAddr, Transaction, DOCUMENTATION_URL,
};

#[cfg(feature = "webhook")]
pub use harlog_extras::webhook;

/// Everything needed to install the middleware.
pub mod prelude {
    pub use harlog_core::{CapturedBody, Group, MetricsOptions, MountPath};
    pub use harlog_extras::{
        BuildError, MetricsLayer, MetricsLogger, PeerAddr, Transaction, DOCUMENTATION_URL,
    };

    #[cfg(feature = "webhook")]
    pub use harlog_extras::webhook::{verify, WebhookError, SIGNATURE_HEADER};

    pub use http;
    pub use serde_json::json;
    pub use tracing;
}
