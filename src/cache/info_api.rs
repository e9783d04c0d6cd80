// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server introspection and capability flags.

use std::collections::HashMap;

use redis::InfoDict;

use super::TagCache;
use crate::error::CacheResult;
use crate::stats::{self, TagStats};

/// What this backend can do, for callers that adapt to their cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Periodic `clean_old` calls are recommended
    pub automatic_cleaning: bool,
    pub tags: bool,
    pub expired_read: bool,
    pub priority: bool,
    pub infinite_lifetime: bool,
    /// Ids and tags can be listed
    pub get_list: bool,
}

impl Capabilities {
    pub(crate) fn for_cleaning_factor(factor: u32) -> Self {
        Self {
            automatic_cleaning: factor > 0,
            tags: true,
            expired_read: false,
            priority: false,
            infinite_lifetime: true,
            get_list: true,
        }
    }
}

/// `used / max` as a whole percentage; 1 when memory is unbounded.
pub(crate) fn filling_percentage(used_memory: u64, max_memory: u64) -> u32 {
    if max_memory == 0 {
        return 1;
    }
    (used_memory as f64 * 100.0 / max_memory as f64).round() as u32
}

/// Keyspace hit rate as a whole percentage; 0 before any lookup.
pub(crate) fn hit_percentage(hits: u64, misses: u64) -> u32 {
    let total = hits + misses;
    if total == 0 {
        return 0;
    }
    (hits as f64 * 100.0 / total as f64).round() as u32
}

impl TagCache {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_cleaning_factor(self.config.automatic_cleaning_factor)
    }

    /// Raw `INFO` of the primary.
    pub async fn info(&mut self) -> CacheResult<InfoDict> {
        Ok(redis::cmd("INFO").query_async(self.topology.primary()).await?)
    }

    pub async fn filling_percentage(&mut self) -> CacheResult<u32> {
        let config: HashMap<String, String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("maxmemory")
            .query_async(self.topology.primary())
            .await?;
        let max_memory = config
            .get("maxmemory")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if max_memory == 0 {
            return Ok(filling_percentage(0, 0));
        }
        let info = self.info().await?;
        let used: u64 = info.get("used_memory").unwrap_or(0);
        Ok(filling_percentage(used, max_memory))
    }

    pub async fn hit_miss_percentage(&mut self) -> CacheResult<u32> {
        let info = self.info().await?;
        let hits: u64 = info.get("keyspace_hits").unwrap_or(0);
        let misses: u64 = info.get("keyspace_misses").unwrap_or(0);
        Ok(hit_percentage(hits, misses))
    }

    /// Per-tag size statistics (see [`crate::stats`]).
    pub async fn tag_stats(&mut self) -> CacheResult<Vec<TagStats>> {
        let layout = self.strategy.layout();
        stats::collect(self.topology.primary(), layout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_cleaning_factor() {
        let caps = Capabilities::for_cleaning_factor(0);
        assert!(!caps.automatic_cleaning);
        assert!(caps.tags);
        assert!(!caps.expired_read);
        assert!(!caps.priority);
        assert!(caps.infinite_lifetime);
        assert!(caps.get_list);

        assert!(Capabilities::for_cleaning_factor(10).automatic_cleaning);
    }

    #[test]
    fn test_filling_percentage() {
        assert_eq!(filling_percentage(500, 0), 1);
        assert_eq!(filling_percentage(50, 200), 25);
        assert_eq!(filling_percentage(1, 3), 33);
    }

    #[test]
    fn test_hit_percentage() {
        assert_eq!(hit_percentage(0, 0), 0);
        assert_eq!(hit_percentage(3, 1), 75);
        assert_eq!(hit_percentage(2, 1), 67);
    }
}
