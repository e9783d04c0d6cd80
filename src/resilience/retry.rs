// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff for connection establishment.
//!
//! Connecting is the only place the cache retries blindly. Commands are never
//! replayed here: a failed write must surface to the caller rather than be
//! silently applied twice.
//!
//! # Example
//!
//! ```
//! use tag_cache::RetryConfig;
//!
//! // `connect_retries = 1` means one retry after the first attempt.
//! let connect = RetryConfig::connect(1);
//! assert_eq!(connect.max_attempts, 2);
//! assert_eq!(RetryConfig::connect(0).max_attempts, 1);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connect(1)
    }
}

impl RetryConfig {
    /// Retry policy for opening a data connection.
    /// `retries` is the number of extra attempts after the first.
    #[must_use]
    pub fn connect(retries: usize) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait before attempt number `attempt + 1` (`attempt` starts at 1).
    #[must_use]
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is reached.
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(err);
                }

                let delay = config.delay_after(attempts);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max_attempts, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}
