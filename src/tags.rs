// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag queries: AND, OR and NOT over tag sets, plus id and tag listing.
//!
//! Unions are computed `sunion_chunk` sets at a time and deduplicated on
//! the client, since a single `SUNION` over thousands of keys is rejected
//! or stalls the server.

use std::collections::HashSet;

use redis::aio::MultiplexedConnection;

use crate::atomic::Layout;
use crate::error::{CacheError, CacheResult};

/// `SCAN` page size when listing ids without the global id set.
const SCAN_COUNT: usize = 1000;

/// Ids carrying every one of `tags`.
pub(crate) async fn matching_all(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tags: &[String],
) -> CacheResult<Vec<String>> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }
    Ok(redis::cmd("SINTER")
        .arg(layout.keys.tags_of(tags))
        .query_async(conn)
        .await?)
}

/// Ids carrying at least one of `tags`.
pub(crate) async fn matching_any(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tags: &[String],
) -> CacheResult<Vec<String>> {
    let mut unique = HashSet::new();
    let mut ids = Vec::new();
    for chunk in tags.chunks(layout.sunion_chunk) {
        let members: Vec<String> = redis::cmd("SUNION")
            .arg(layout.keys.tags_of(chunk))
            .query_async(conn)
            .await?;
        for id in members {
            if unique.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Ids carrying none of `tags`. Needs the global id set.
pub(crate) async fn not_matching(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tags: &[String],
) -> CacheResult<Vec<String>> {
    if !layout.track_ids {
        return Err(CacheError::UnsupportedOperation(
            "not-matching-tag queries require 'not_matching_tags' to be enabled".into(),
        ));
    }

    if tags.len() <= layout.sunion_chunk {
        let mut cmd = redis::cmd("SDIFF");
        cmd.arg(layout.keys.ids_key()).arg(layout.keys.tags_of(tags));
        return Ok(cmd.query_async(conn).await?);
    }

    let excluded: HashSet<String> = matching_any(conn, layout, tags).await?.into_iter().collect();
    let all: Vec<String> = redis::cmd("SMEMBERS")
        .arg(layout.keys.ids_key())
        .query_async(conn)
        .await?;
    Ok(all.into_iter().filter(|id| !excluded.contains(id)).collect())
}

/// Every stored id: the global id set when maintained, otherwise a `SCAN`
/// over the entry prefix.
pub(crate) async fn all_ids(conn: &mut MultiplexedConnection, layout: &Layout) -> CacheResult<Vec<String>> {
    if layout.track_ids {
        return Ok(redis::cmd("SMEMBERS")
            .arg(layout.keys.ids_key())
            .query_async(conn)
            .await?);
    }

    let pattern = layout.keys.entry_pattern();
    let mut cursor: u64 = 0;
    let mut unique = HashSet::new();
    let mut ids = Vec::new();
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        for key in keys {
            if let Some(id) = layout.keys.id_from_entry(&key) {
                if unique.insert(id.to_string()) {
                    ids.push(id.to_string());
                }
            }
        }
        if next == 0 {
            return Ok(ids);
        }
        cursor = next;
    }
}

pub(crate) async fn all_tags(conn: &mut MultiplexedConnection, layout: &Layout) -> CacheResult<Vec<String>> {
    Ok(redis::cmd("SMEMBERS")
        .arg(layout.keys.tags_key())
        .query_async(conn)
        .await?)
}

/// Bulk clean modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanMode {
    /// Flush the whole database
    All,
    /// Garbage collection
    Old,
    /// Entries carrying every given tag
    MatchingTag,
    /// Entries carrying none of the given tags
    NotMatchingTag,
    /// Entries carrying any given tag; the tags are retired too
    MatchingAnyTag,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::All => "all",
            CleanMode::Old => "old",
            CleanMode::MatchingTag => "matchingTag",
            CleanMode::NotMatchingTag => "notMatchingTag",
            CleanMode::MatchingAnyTag => "matchingAnyTag",
        }
    }

    /// Modes that act on a tag list (and do nothing when it is empty).
    pub fn takes_tags(self) -> bool {
        matches!(
            self,
            CleanMode::MatchingTag | CleanMode::NotMatchingTag | CleanMode::MatchingAnyTag
        )
    }
}

impl std::fmt::Display for CleanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CleanMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(CleanMode::All),
            "old" => Ok(CleanMode::Old),
            "matchingTag" => Ok(CleanMode::MatchingTag),
            "notMatchingTag" => Ok(CleanMode::NotMatchingTag),
            "matchingAnyTag" => Ok(CleanMode::MatchingAnyTag),
            other => Err(CacheError::UnsupportedOperation(format!("invalid clean mode '{}'", other))),
        }
    }
}
