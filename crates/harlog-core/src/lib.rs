//! # harlog-core
//!
//! The synchronous half of harlog: everything needed to turn one HTTP
//! request/response pair into a redacted HAR payload, without touching
//! the network.
//!
//! - [`har`] - the HAR 1.2 data model
//! - [`redaction`] - allow/deny-list redaction that preserves shape
//! - [`capture`] - request and response capture, including multipart
//! - [`group`] - resolving who a request belongs to
//! - [`payload`] - the final submission payload
//! - [`options`] - middleware options and validation
//!
//! ## Feature flags
//!
//! - `env` (default) - load options from `HARLOG_*` environment variables
//!   and `.env` files

pub mod capture;
pub mod content_type;
pub mod error;
pub mod group;
pub mod har;
pub mod mask;
pub mod options;
pub mod payload;
pub mod redaction;

pub use capture::{capture_request, capture_response, CapturedBody, MountPath};
pub use error::{ConfigError, ConfigResult};
pub use group::{find_api_key, resolve_group_id, Group, PayloadGroup};
pub use har::{Creator, HarEntry, HarLog, HarRequest, HarResponse, NameValue};
pub use mask::mask;
pub use options::{MetricsConfig, MetricsOptions};
pub use payload::{assemble, documentation_url, EntryContext, Payload};
pub use redaction::{FieldPath, RedactionRule};
