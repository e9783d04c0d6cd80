// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tag size statistics.
//!
//! Read-only: walks the global tag set, each tag's id set and the stored
//! length of every entry's data field. Ids whose entry is gone count as
//! missing. Tags with no live entry are left out.

use std::cmp::Ordering;

use redis::aio::MultiplexedConnection;

use crate::atomic::Layout;
use crate::entry::FIELD_DATA;
use crate::error::CacheResult;

#[derive(Debug, Clone, PartialEq)]
pub struct TagStats {
    pub tag: String,
    /// Live entries carrying the tag
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub total: usize,
    /// Ids still in the tag set whose entry no longer exists
    pub missing: usize,
}

impl TagStats {
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }

    /// Build from stored data lengths; zero means missing. `None` when no
    /// entry is live.
    pub fn from_sizes(tag: impl Into<String>, sizes: &[usize]) -> Option<Self> {
        let live: Vec<usize> = sizes.iter().copied().filter(|&s| s > 0).collect();
        if live.is_empty() {
            return None;
        }
        Some(Self {
            tag: tag.into(),
            count: live.len(),
            min: live.iter().copied().min().unwrap_or(0),
            max: live.iter().copied().max().unwrap_or(0),
            total: live.iter().sum(),
            missing: sizes.len() - live.len(),
        })
    }
}

/// Ranking for [`top`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsOrder {
    TotalSize,
    AverageSize,
    Count,
}

impl StatsOrder {
    pub fn label(self) -> &'static str {
        match self {
            StatsOrder::TotalSize => "Total Size",
            StatsOrder::AverageSize => "Avg Size",
            StatsOrder::Count => "Count",
        }
    }
}

/// The `limit` largest tags by `order`, descending.
pub fn top(stats: &[TagStats], order: StatsOrder, limit: usize) -> Vec<&TagStats> {
    let mut ranked: Vec<&TagStats> = stats.iter().collect();
    ranked.sort_by(|a, b| {
        let ord = match order {
            StatsOrder::TotalSize => b.total.cmp(&a.total),
            StatsOrder::Count => b.count.cmp(&a.count),
            StatsOrder::AverageSize => b.average().partial_cmp(&a.average()).unwrap_or(Ordering::Equal),
        };
        ord.then_with(|| a.tag.cmp(&b.tag))
    });
    ranked.truncate(limit);
    ranked
}

/// `B` below 1 KiB, then `KB` and `MB` with four decimals.
pub fn format_bytes(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{} B", bytes.round() as u64)
    } else if bytes < 1_048_576.0 {
        format!("{:.4} KB", bytes / 1024.0)
    } else {
        format!("{:.4} MB", bytes / 1_048_576.0)
    }
}

pub(crate) async fn collect(conn: &mut MultiplexedConnection, layout: &Layout) -> CacheResult<Vec<TagStats>> {
    let keys = &layout.keys;
    let tags: Vec<String> = redis::cmd("SMEMBERS").arg(keys.tags_key()).query_async(conn).await?;

    let mut out = Vec::new();
    for tag in tags {
        let ids: Vec<String> = redis::cmd("SMEMBERS").arg(keys.tag(&tag)).query_async(conn).await?;
        let mut sizes = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(layout.arg_step) {
            let mut pipe = redis::pipe();
            for id in chunk {
                pipe.cmd("HSTRLEN").arg(keys.entry(id)).arg(FIELD_DATA);
            }
            let lengths: Vec<usize> = pipe.query_async(conn).await?;
            sizes.extend(lengths);
        }
        if let Some(stats) = TagStats::from_sizes(tag, &sizes) {
            out.push(stats);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(tag: &str, sizes: &[usize]) -> TagStats {
        TagStats::from_sizes(tag, sizes).unwrap()
    }

    #[test]
    fn test_from_sizes_counts_missing() {
        let s = stats("t", &[10, 0, 30, 0]);
        assert_eq!(s.count, 2);
        assert_eq!(s.missing, 2);
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 30);
        assert_eq!(s.total, 40);
        assert_eq!(s.average(), 20.0);
    }

    #[test]
    fn test_all_missing_is_skipped() {
        assert!(TagStats::from_sizes("t", &[0, 0]).is_none());
        assert!(TagStats::from_sizes("t", &[]).is_none());
    }

    #[test]
    fn test_top_orders_and_limits() {
        let all = vec![
            stats("small", &[1, 1, 1, 1]),
            stats("big", &[5000]),
            stats("mid", &[100, 300]),
        ];

        let by_total: Vec<&str> = top(&all, StatsOrder::TotalSize, 2).iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(by_total, vec!["big", "mid"]);

        let by_count: Vec<&str> = top(&all, StatsOrder::Count, 10).iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(by_count, vec!["small", "mid", "big"]);

        let by_avg = top(&all, StatsOrder::AverageSize, 1);
        assert_eq!(by_avg[0].tag, "big");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(2048.0), "2.0000 KB");
        assert_eq!(format_bytes(3.0 * 1_048_576.0), "3.0000 MB");
    }
}
