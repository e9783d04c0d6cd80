// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifetime resolution for `save`.
//!
//! Order of application:
//! 1. [`Lifetime::Default`] takes the configured default.
//! 2. If the result is infinite and the id matches the auto-expire
//!    pattern, the auto-expire lifetime is used instead.
//! 3. Any finite result is clamped to the lifetime limit.

use regex::Regex;

use crate::config::TagCacheConfig;
use crate::error::{CacheError, CacheResult};

/// Requested lifetime for one save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// Use the configured default.
    #[default]
    Default,
    /// Never expire.
    Infinite,
    /// Expire after this many seconds. `Seconds(0)` behaves like `Default`.
    Seconds(u64),
}

impl From<u64> for Lifetime {
    fn from(seconds: u64) -> Self {
        Lifetime::Seconds(seconds)
    }
}

impl From<Option<u64>> for Lifetime {
    /// `None` is infinite.
    fn from(seconds: Option<u64>) -> Self {
        seconds.map_or(Lifetime::Infinite, Lifetime::Seconds)
    }
}

#[derive(Debug, Clone)]
struct AutoExpire {
    lifetime: u64,
    pattern: Regex,
    refresh_on_load: bool,
}

#[derive(Debug, Clone)]
pub struct LifetimePolicy {
    default: Option<u64>,
    limit: u64,
    auto: Option<AutoExpire>,
}

impl LifetimePolicy {
    pub fn from_config(config: &TagCacheConfig) -> CacheResult<Self> {
        let auto = match &config.auto_expire {
            Some(auto) if auto.lifetime > 0 => Some(AutoExpire {
                lifetime: auto.lifetime,
                pattern: Regex::new(&auto.pattern).map_err(|e| {
                    CacheError::Configuration(format!("invalid auto_expire pattern: {}", e))
                })?,
                refresh_on_load: auto.refresh_on_load,
            }),
            _ => None,
        };

        Ok(Self {
            default: config.default_lifetime.filter(|&s| s > 0),
            limit: config.effective_lifetime_limit(),
            auto,
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// TTL to store for `id`; `None` means the entry never expires.
    pub fn resolve(&self, id: &str, requested: Lifetime) -> Option<u64> {
        let base = match requested {
            Lifetime::Infinite => None,
            Lifetime::Default | Lifetime::Seconds(0) => self.default,
            Lifetime::Seconds(s) => Some(s),
        };

        let lifetime = match (base, &self.auto) {
            (None, Some(auto)) if auto.pattern.is_match(id) => Some(auto.lifetime),
            _ => base,
        };

        lifetime.map(|s| s.min(self.limit))
    }

    /// TTL to re-apply after a successful load, if `id` is auto-expiring
    /// and refresh is enabled.
    pub fn refresh_on_load(&self, id: &str) -> Option<u64> {
        self.auto
            .as_ref()
            .filter(|auto| auto.refresh_on_load && auto.pattern.is_match(id))
            .map(|auto| auto.lifetime.min(self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoExpireConfig, MAX_LIFETIME};

    fn policy(default: Option<u64>, auto: Option<AutoExpireConfig>) -> LifetimePolicy {
        let config = TagCacheConfig {
            server: Some("localhost".into()),
            default_lifetime: default,
            auto_expire: auto,
            ..Default::default()
        };
        LifetimePolicy::from_config(&config).unwrap()
    }

    fn auto(refresh: bool) -> Option<AutoExpireConfig> {
        Some(AutoExpireConfig {
            lifetime: 3600,
            pattern: "REQEST".into(),
            refresh_on_load: refresh,
        })
    }

    #[test]
    fn test_explicit_seconds_pass_through() {
        assert_eq!(policy(Some(100), None).resolve("a", Lifetime::Seconds(50)), Some(50));
    }

    #[test]
    fn test_default_and_zero_use_configured_default() {
        let p = policy(Some(100), None);
        assert_eq!(p.resolve("a", Lifetime::Default), Some(100));
        assert_eq!(p.resolve("a", Lifetime::Seconds(0)), Some(100));
    }

    #[test]
    fn test_infinite_stays_infinite() {
        assert_eq!(policy(Some(100), None).resolve("a", Lifetime::Infinite), None);
        assert_eq!(policy(None, None).resolve("a", Lifetime::Default), None);
    }

    #[test]
    fn test_clamped_to_thirty_days() {
        let p = policy(None, None);
        assert_eq!(p.resolve("a", Lifetime::Seconds(MAX_LIFETIME * 2)), Some(MAX_LIFETIME));
        assert_eq!(p.resolve("a", Lifetime::Seconds(MAX_LIFETIME)), Some(MAX_LIFETIME));
    }

    #[test]
    fn test_auto_expire_only_replaces_infinite() {
        let p = policy(None, auto(false));
        assert_eq!(p.resolve("REQEST_123", Lifetime::Infinite), Some(3600));
        assert_eq!(p.resolve("REQEST_123", Lifetime::Default), Some(3600));
        assert_eq!(p.resolve("REQEST_123", Lifetime::Seconds(10)), Some(10));
        assert_eq!(p.resolve("other", Lifetime::Infinite), None);
    }

    #[test]
    fn test_refresh_on_load() {
        assert_eq!(policy(None, auto(true)).refresh_on_load("REQEST_1"), Some(3600));
        assert_eq!(policy(None, auto(true)).refresh_on_load("other"), None);
        assert_eq!(policy(None, auto(false)).refresh_on_load("REQEST_1"), None);
        assert_eq!(policy(None, None).refresh_on_load("REQEST_1"), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Lifetime::from(None), Lifetime::Infinite);
        assert_eq!(Lifetime::from(Some(5)), Lifetime::Seconds(5));
        assert_eq!(Lifetime::from(7u64), Lifetime::Seconds(7));
    }
}
