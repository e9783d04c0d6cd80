// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the tag cache.
//!
//! | Variant                | Raised when                                            |
//! |------------------------|--------------------------------------------------------|
//! | `Configuration`        | a required option is missing or invalid                |
//! | `Connection`           | the primary/coordinator cannot be reached or selected  |
//! | `Store`                | a command fails after a connection exists              |
//! | `Encoding`             | the configured codec refuses a payload on write        |
//! | `UnsupportedOperation` | not-matching-tag query while that mode is off          |
//! | `LifetimeLimit`        | a configured lifetime exceeds the 30 day ceiling       |
//!
//! Replica failures never reach the caller; they degrade to primary-only reads.

use thiserror::Error;

use crate::compression::CompressionError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lifetime of {requested}s exceeds the backend limit of {limit}s (30 days)")]
    LifetimeLimit { requested: u64, limit: u64 },
}

impl CacheError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Store(_) => "store",
            Self::Encoding(_) => "encoding",
            Self::UnsupportedOperation(_) => "unsupported",
            Self::LifetimeLimit { .. } => "lifetime_limit",
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Store(e.to_string())
    }
}

impl From<CompressionError> for CacheError {
    fn from(e: CompressionError) -> Self {
        CacheError::Encoding(e.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
