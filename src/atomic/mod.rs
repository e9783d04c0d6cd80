// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Atomic update engine.
//!
//! Every multi-key write (save, remove, clean-by-any-tag, GC sweep) goes
//! through an [`UpdateStrategy`]. Two strategies share one contract:
//!
//! - [`ScriptedUpdates`]: one server-side script per atomic section
//! - [`TransactionalUpdates`]: `WATCH` + `MULTI`/`EXEC`
//!
//! The strategy is picked once from `use_lua` and never mixed.
//!
//! # Tag diff
//!
//! Save and remove read the entry's stored tag field first and pass it into
//! the atomic section as the expected value. If another writer changed it
//! in between, the section does nothing and is retried with a fresh read.
//! The diff is therefore always computed against the value that existed
//! immediately before the section ran.

pub mod scripted;
pub(crate) mod scripts;
pub mod transaction;

use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::entry::{EntryCodec, FIELD_TAGS};
use crate::error::{CacheError, CacheResult};
use crate::keys::Keyspace;

pub use scripted::ScriptedUpdates;
pub use transaction::TransactionalUpdates;

/// Attempts before a contended save/remove gives up.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 8;

/// Key names, field codec and chunk sizes shared by every component.
#[derive(Debug, Clone)]
pub struct Layout {
    pub keys: Keyspace,
    pub codec: EntryCodec,
    /// Maintain the global id set
    pub track_ids: bool,
    /// Max values per `unpack()` / per pipelined argument batch
    pub arg_step: usize,
    /// Max tag sets per union
    pub sunion_chunk: usize,
    /// Max entries deleted per transaction
    pub remove_chunk: usize,
}

/// One save, already encoded.
#[derive(Debug, Clone)]
pub struct SaveRequest<'a> {
    pub id: &'a str,
    pub data: &'a [u8],
    /// Normalised tag names
    pub tags: &'a [String],
    /// Encoded `t` field
    pub encoded_tags: &'a [u8],
    pub mtime: u64,
    /// TTL in seconds, `None` for infinite
    pub ttl: Option<u64>,
}

/// Result of sweeping one batch of tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub ids_swept: usize,
    pub tags_dropped: usize,
    /// Entry lookups made to classify members
    pub existence_checks: usize,
}

/// Ids confirmed live earlier in the same GC pass.
///
/// Only positive results are kept: a live id can at worst stay in a tag set
/// until the next pass, while a cached miss could evict an entry that was
/// saved again in the meantime.
pub type ExistenceCache = HashSet<String>;

#[async_trait]
pub trait UpdateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn layout(&self) -> &Layout;

    /// Write the entry and move it between tag sets in one atomic section.
    async fn save(&self, conn: &mut MultiplexedConnection, request: &SaveRequest<'_>) -> CacheResult<()>;

    /// Delete the entry and its tag memberships. `false` if it did not exist.
    async fn remove(&self, conn: &mut MultiplexedConnection, id: &str) -> CacheResult<bool>;

    /// Delete every entry carrying any of `tags` and retire the tags.
    async fn clean_any_tags(&self, conn: &mut MultiplexedConnection, tags: &[String]) -> CacheResult<usize>;

    /// Repair one batch of tag sets after entries expired.
    async fn sweep_tags(
        &self,
        conn: &mut MultiplexedConnection,
        tags: &[String],
        seen: &mut ExistenceCache,
    ) -> CacheResult<SweepStats>;

    /// Delete entries by id, one transaction per `remove_chunk`. Tag sets
    /// keep the ids until the next GC pass.
    async fn remove_ids(&self, conn: &mut MultiplexedConnection, ids: &[String]) -> CacheResult<usize> {
        let layout = self.layout();
        let mut removed = 0;
        for chunk in ids.chunks(layout.remove_chunk) {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(layout.keys.entries_of(chunk));
            if layout.track_ids {
                pipe.srem(layout.keys.ids_key(), chunk).ignore();
            }
            let (count,): (usize,) = pipe.query_async(conn).await?;
            removed += count;
        }
        Ok(removed)
    }
}

/// Stored `t` field and its decoded tags.
#[derive(Debug, Clone, Default)]
pub(crate) struct PriorTags {
    pub raw: Option<Vec<u8>>,
    pub tags: Vec<String>,
}

impl PriorTags {
    pub async fn read(conn: &mut MultiplexedConnection, layout: &Layout, id: &str) -> CacheResult<Self> {
        let raw: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(layout.keys.entry(id))
            .arg(FIELD_TAGS)
            .query_async(conn)
            .await?;
        let tags = raw
            .as_deref()
            .map(|r| layout.codec.decode_tags(id, r))
            .unwrap_or_default();
        Ok(Self { raw, tags })
    }

    /// Tags present before but absent from `next`.
    pub fn dropped_by(&self, next: &[String]) -> Vec<String> {
        self.tags.iter().filter(|t| !next.contains(t)).cloned().collect()
    }
}

/// A tag set becomes empty after removing one id from it.
pub(crate) fn will_empty(cardinality: usize, is_member: bool) -> bool {
    cardinality == 0 || (cardinality == 1 && is_member)
}

/// Clear any `WATCH` left behind by a section that failed before `EXEC`,
/// so it cannot abort a later, unrelated transaction on this connection.
pub(crate) async fn release_watch(conn: &mut MultiplexedConnection) {
    if let Err(e) = redis::cmd("UNWATCH").query_async::<()>(conn).await {
        debug!(error = %e, "UNWATCH failed");
    }
}

/// Round budget for one contended section.
#[derive(Debug)]
pub(crate) struct Attempts<'a> {
    operation: &'static str,
    subject: &'a str,
    used: usize,
}

impl<'a> Attempts<'a> {
    pub fn new(operation: &'static str, subject: &'a str) -> Self {
        Self {
            operation,
            subject,
            used: 0,
        }
    }

    /// Claim the next round, failing once `MAX_CAS_ATTEMPTS` are spent.
    pub fn claim(&mut self) -> CacheResult<usize> {
        if self.used >= MAX_CAS_ATTEMPTS {
            return Err(contention_error(self.operation, self.subject));
        }
        self.used += 1;
        Ok(self.used)
    }
}

pub(crate) fn contention_error(operation: &str, id: &str) -> CacheError {
    CacheError::Store(format!(
        "{} of '{}' abandoned after {} concurrent modifications",
        operation, id, MAX_CAS_ATTEMPTS
    ))
}

/// Pick the strategy for `use_lua`.
pub fn strategy_for(use_lua: bool, layout: Layout) -> Box<dyn UpdateStrategy> {
    if use_lua {
        Box::new(ScriptedUpdates::new(layout))
    } else {
        Box::new(TransactionalUpdates::new(layout))
    }
}
