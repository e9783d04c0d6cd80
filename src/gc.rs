// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Garbage collection of tag sets.
//!
//! Store-side expiry removes the entry hash but leaves its id in every tag
//! set it was added to. A pass walks the global tag set in batches of
//! `gc_batch_size` tags, drops ids whose entry is gone and retires tag sets
//! with no live member. Batches are separated by a short pause so a long
//! sweep does not monopolise the server.
//!
//! A pass is idempotent. If it fails midway the next pass picks up where
//! the store was left.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use crate::atomic::{release_watch, Attempts, ExistenceCache, Layout, SweepStats, UpdateStrategy};
use crate::error::CacheResult;
use crate::metrics;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub tags_scanned: usize,
    pub ids_swept: usize,
    pub tags_dropped: usize,
    /// Entry lookups made to classify tag members.
    pub existence_checks: usize,
    pub duration: Duration,
}

/// Run one full pass over the global tag set.
pub(crate) async fn collect(
    conn: &mut MultiplexedConnection,
    strategy: &dyn UpdateStrategy,
    batch_size: usize,
    pause: Duration,
) -> CacheResult<GcReport> {
    let start = Instant::now();
    let layout = strategy.layout();
    let tags: Vec<String> = redis::cmd("SMEMBERS")
        .arg(layout.keys.tags_key())
        .query_async(conn)
        .await?;

    let mut seen = ExistenceCache::new();
    let mut report = GcReport {
        tags_scanned: tags.len(),
        ..Default::default()
    };

    for (i, batch) in tags.chunks(batch_size.max(1)).enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let stats = strategy.sweep_tags(conn, batch, &mut seen).await?;
        report.ids_swept += stats.ids_swept;
        report.tags_dropped += stats.tags_dropped;
        report.existence_checks += stats.existence_checks;
        debug!(
            batch = i,
            tags = batch.len(),
            swept = stats.ids_swept,
            dropped = stats.tags_dropped,
            checks = stats.existence_checks,
            known_live = seen.len(),
            "GC batch done"
        );
    }

    report.duration = start.elapsed();
    metrics::record_gc(
        report.tags_scanned,
        report.ids_swept,
        report.tags_dropped,
        report.existence_checks,
        report.duration,
    );
    info!(
        strategy = strategy.name(),
        tags = report.tags_scanned,
        swept = report.ids_swept,
        dropped = report.tags_dropped,
        elapsed_ms = report.duration.as_millis() as u64,
        "Garbage collection finished"
    );
    Ok(report)
}

/// Sweep without scripts: `SSCAN` each tag set, classify members not yet
/// known live with pipelined `EXISTS`, remove the dead ones in verified
/// chunks and drop the set under `WATCH` once it is empty.
pub(crate) async fn sweep_client_side(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tags: &[String],
    seen: &mut ExistenceCache,
) -> CacheResult<SweepStats> {
    let keys = &layout.keys;
    let step = layout.arg_step;
    let mut stats = SweepStats::default();

    for tag in tags {
        let tag_key = keys.tag(tag);
        let members = scan_members(conn, &tag_key, step).await?;

        let unknown: Vec<&String> = members.iter().filter(|id| !seen.contains(*id)).collect();
        let mut dead = Vec::new();
        for chunk in unknown.chunks(step) {
            let mut pipe = redis::pipe();
            for id in chunk {
                pipe.exists(keys.entry(id));
            }
            let exists: Vec<bool> = pipe.query_async(conn).await?;
            stats.existence_checks += chunk.len();
            for (id, alive) in chunk.iter().zip(exists) {
                if alive {
                    seen.insert((*id).clone());
                } else {
                    dead.push((*id).clone());
                }
            }
        }

        let removed = remove_dead(conn, layout, &tag_key, &dead).await?;
        stats.ids_swept += removed;

        if removed == members.len() && drop_if_empty(conn, layout, tag, &tag_key).await? {
            stats.tags_dropped += 1;
        }
    }
    Ok(stats)
}

/// Take ids whose entry is gone out of a tag set. Each chunk re-checks
/// its entries under `WATCH`, so an id saved again since it was classified
/// stays in the set.
async fn remove_dead(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tag_key: &str,
    candidates: &[String],
) -> CacheResult<usize> {
    let mut removed = 0;
    for chunk in candidates.chunks(layout.arg_step) {
        match remove_dead_chunk(conn, layout, tag_key, chunk).await {
            Ok(count) => removed += count,
            Err(e) => {
                release_watch(conn).await;
                return Err(e);
            }
        }
    }
    Ok(removed)
}

async fn remove_dead_chunk(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tag_key: &str,
    chunk: &[String],
) -> CacheResult<usize> {
    let keys = &layout.keys;
    let entry_keys = keys.entries_of(chunk);
    let mut attempts = Attempts::new("gc", tag_key);

    loop {
        let round = attempts.claim()?;
        redis::cmd("WATCH").arg(&entry_keys).query_async::<()>(conn).await?;
        let mut pipe = redis::pipe();
        for key in &entry_keys {
            pipe.exists(key);
        }
        let exists: Vec<bool> = pipe.query_async(conn).await?;
        let dead: Vec<String> = chunk
            .iter()
            .zip(exists)
            .filter(|(_, alive)| !alive)
            .map(|(id, _)| id.clone())
            .collect();
        if dead.is_empty() {
            release_watch(conn).await;
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(tag_key, &dead[..]).ignore();
        if layout.track_ids {
            pipe.srem(keys.ids_key(), &dead[..]).ignore();
        }
        let committed: Option<()> = pipe.query_async(conn).await?;
        if committed.is_some() {
            return Ok(dead.len());
        }
        metrics::record_conflict("gc");
        debug!(tag_key = %tag_key, round, "Entry saved during sweep, re-checking chunk");
    }
}

async fn scan_members(conn: &mut MultiplexedConnection, key: &str, count: usize) -> CacheResult<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut unique = HashSet::new();
    let mut members = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await?;
        for id in batch {
            if unique.insert(id.clone()) {
                members.push(id);
            }
        }
        if next == 0 {
            return Ok(members);
        }
        cursor = next;
    }
}

/// Retire an empty tag set. A concurrent save into it aborts the drop.
async fn drop_if_empty(
    conn: &mut MultiplexedConnection,
    layout: &Layout,
    tag: &str,
    tag_key: &str,
) -> CacheResult<bool> {
    redis::cmd("WATCH").arg(tag_key).query_async::<()>(conn).await?;
    let card: usize = match redis::cmd("SCARD").arg(tag_key).query_async(conn).await {
        Ok(card) => card,
        Err(e) => {
            release_watch(conn).await;
            return Err(e.into());
        }
    };
    if card != 0 {
        release_watch(conn).await;
        return Ok(false);
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.unlink(tag_key).ignore();
    pipe.srem(layout.keys.tags_key(), tag).ignore();
    let committed: Option<()> = pipe.query_async(conn).await?;
    if committed.is_none() {
        debug!(tag = %tag, "Tag set changed while being dropped, keeping it");
    }
    Ok(committed.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_default_is_empty() {
        let report = GcReport::default();
        assert_eq!(report.tags_scanned, 0);
        assert_eq!(report.ids_swept, 0);
        assert_eq!(report.tags_dropped, 0);
        assert_eq!(report.existence_checks, 0);
        assert!(report.duration.is_zero());
    }
}
