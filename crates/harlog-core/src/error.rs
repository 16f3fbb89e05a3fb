//! Error types for harlog setup.
//!
//! Capturing never fails: bad bodies degrade to sentinel text. The only
//! errors this crate raises are configuration errors, and they are raised
//! once, when the middleware is built.

use thiserror::Error;

/// Result type alias for configuration.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Invalid or incomplete setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key was provided.
    #[error("missing API key")]
    MissingApiKey,

    /// No grouping callback was provided.
    #[error("missing grouping function")]
    MissingGrouping,

    /// An allow/deny list entry is not a usable field path.
    #[error("invalid {option} entry: {reason}")]
    InvalidFieldList {
        option: &'static str,
        reason: String,
    },

    /// The buffer length must be at least one.
    #[error("buffer length must be a positive integer, got {0}")]
    InvalidBufferLength(usize),

    /// A configured URL does not parse.
    #[error("invalid {option} URL: {value}")]
    InvalidUrl { option: &'static str, value: String },

    /// Reading configuration from the environment failed.
    #[cfg(feature = "env")]
    #[error("environment configuration error: {0}")]
    Env(#[from] envy::Error),
}
