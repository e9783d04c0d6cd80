// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `MULTI`/`EXEC` strategy for servers where scripting is disabled.
//!
//! Reads that decide what a transaction writes happen under `WATCH`, so a
//! concurrent change aborts the `EXEC` (nil reply) and the section is
//! rebuilt from a fresh read.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use super::{
    contention_error, release_watch, will_empty, Attempts, ExistenceCache, Layout, PriorTags, SaveRequest,
    SweepStats, UpdateStrategy, MAX_CAS_ATTEMPTS,
};
use crate::entry::{FIELD_DATA, FIELD_INFINITE, FIELD_MTIME, FIELD_TAGS};
use crate::error::CacheResult;
use crate::gc;
use crate::metrics;

pub struct TransactionalUpdates {
    layout: Layout,
}

impl TransactionalUpdates {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    async fn watch(&self, conn: &mut MultiplexedConnection, keys: &[String]) -> CacheResult<()> {
        if !keys.is_empty() {
            redis::cmd("WATCH").arg(keys).query_async::<()>(conn).await?;
        }
        Ok(())
    }

    /// Tags among `dropping` whose set empties once `id` leaves it.
    /// Caller must already be watching the tag keys.
    async fn emptied_by_removal(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        dropping: &[String],
    ) -> CacheResult<Vec<String>> {
        if dropping.is_empty() {
            return Ok(Vec::new());
        }
        let keys = &self.layout.keys;
        let mut pipe = redis::pipe();
        for tag in dropping {
            let tag_key = keys.tag(tag);
            pipe.scard(&tag_key).sismember(&tag_key, id);
        }
        let cards: Vec<(usize, bool)> = pipe.query_async(conn).await?;
        Ok(dropping
            .iter()
            .zip(cards)
            .filter(|(_, (card, member))| will_empty(*card, *member))
            .map(|(tag, _)| tag.clone())
            .collect())
    }

    /// Read the entry's tags under `WATCH` on the entry and those tag sets.
    async fn watched_prior(&self, conn: &mut MultiplexedConnection, id: &str) -> CacheResult<PriorTags> {
        self.watch(conn, &[self.layout.keys.entry(id)]).await?;
        let prior = PriorTags::read(conn, &self.layout, id).await?;
        Ok(prior)
    }

    /// One save round. `false` when a watched key changed.
    async fn try_save(&self, conn: &mut MultiplexedConnection, request: &SaveRequest<'_>) -> CacheResult<bool> {
        let keys = &self.layout.keys;
        let entry_key = keys.entry(request.id);

        let prior = self.watched_prior(conn, request.id).await?;
        let dropped = prior.dropped_by(request.tags);
        self.watch(conn, &keys.tags_of(&dropped)).await?;
        let emptied = self.emptied_by_removal(conn, request.id, &dropped).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(&entry_key)
            .arg(FIELD_DATA)
            .arg(request.data)
            .arg(FIELD_TAGS)
            .arg(request.encoded_tags)
            .arg(FIELD_MTIME)
            .arg(request.mtime)
            .arg(FIELD_INFINITE)
            .arg(u8::from(request.ttl.is_none()))
            .ignore();
        match request.ttl {
            Some(ttl) => pipe.expire(&entry_key, ttl as i64).ignore(),
            None => pipe.persist(&entry_key).ignore(),
        };
        if !request.tags.is_empty() {
            pipe.sadd(keys.tags_key(), request.tags).ignore();
            for tag in request.tags {
                pipe.sadd(keys.tag(tag), request.id).ignore();
            }
        }
        for tag in &dropped {
            pipe.srem(keys.tag(tag), request.id).ignore();
        }
        if !emptied.is_empty() {
            pipe.srem(keys.tags_key(), &emptied[..]).ignore();
        }
        if self.layout.track_ids {
            pipe.sadd(keys.ids_key(), request.id).ignore();
        }

        let committed: Option<()> = pipe.query_async(conn).await?;
        if committed.is_some() {
            debug!(id = %request.id, tags = request.tags.len(), dropped = dropped.len(), "Saved");
        }
        Ok(committed.is_some())
    }

    /// One remove round. `None` when a watched key changed.
    async fn try_remove(&self, conn: &mut MultiplexedConnection, id: &str) -> CacheResult<Option<bool>> {
        let keys = &self.layout.keys;

        let prior = self.watched_prior(conn, id).await?;
        self.watch(conn, &keys.tags_of(&prior.tags)).await?;
        let emptied = self.emptied_by_removal(conn, id, &prior.tags).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys.entry(id));
        for tag in &prior.tags {
            pipe.srem(keys.tag(tag), id).ignore();
        }
        if !emptied.is_empty() {
            pipe.srem(keys.tags_key(), &emptied[..]).ignore();
        }
        if self.layout.track_ids {
            pipe.srem(keys.ids_key(), id).ignore();
        }

        let committed: Option<(usize,)> = pipe.query_async(conn).await?;
        Ok(committed.map(|(existed,)| existed > 0))
    }

    /// Clean one chunk of tags. Oversized unions are drained outside the
    /// transaction and re-read; every drain or conflict spends one round.
    async fn clean_chunk(&self, conn: &mut MultiplexedConnection, chunk: &[String]) -> CacheResult<usize> {
        let keys = &self.layout.keys;
        let tag_keys = keys.tags_of(chunk);
        let subject = chunk.join(",");
        let mut attempts = Attempts::new("clean", &subject);
        let mut removed = 0;

        loop {
            let round = attempts.claim()?;
            self.watch(conn, &tag_keys).await?;
            let ids: Vec<String> = redis::cmd("SUNION").arg(&tag_keys).query_async(conn).await?;

            if ids.len() > self.layout.remove_chunk {
                release_watch(conn).await;
                removed += self.drain(conn, &tag_keys, &ids).await?;
                debug!(round, drained = ids.len(), "Tag union too large for one transaction, drained");
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            if !ids.is_empty() {
                pipe.del(keys.entries_of(&ids));
                if self.layout.track_ids {
                    pipe.srem(keys.ids_key(), &ids[..]).ignore();
                }
            }
            pipe.del(&tag_keys).ignore();
            pipe.srem(keys.tags_key(), chunk).ignore();

            let committed: Option<Vec<usize>> = pipe.query_async(conn).await?;
            match committed {
                Some(counts) => return Ok(removed + counts.into_iter().sum::<usize>()),
                None => {
                    metrics::record_conflict("clean");
                    warn!(tags = %subject, round, "Watched tag sets changed during clean, retrying");
                }
            }
        }
    }

    /// Delete `ids` in independent `remove_chunk` transactions and take
    /// them out of the chunk's tag sets.
    async fn drain(
        &self,
        conn: &mut MultiplexedConnection,
        tag_keys: &[String],
        ids: &[String],
    ) -> CacheResult<usize> {
        let keys = &self.layout.keys;
        let mut removed = 0;
        for id_chunk in ids.chunks(self.layout.remove_chunk) {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(keys.entries_of(id_chunk));
            if self.layout.track_ids {
                pipe.srem(keys.ids_key(), id_chunk).ignore();
            }
            for tag_key in tag_keys {
                pipe.srem(tag_key, id_chunk).ignore();
            }
            let (count,): (usize,) = pipe.query_async(conn).await?;
            removed += count;
        }
        Ok(removed)
    }
}

#[async_trait]
impl UpdateStrategy for TransactionalUpdates {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn save(&self, conn: &mut MultiplexedConnection, request: &SaveRequest<'_>) -> CacheResult<()> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.try_save(conn, request).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    metrics::record_conflict("save");
                    warn!(id = %request.id, attempt, "Watched keys changed during save, retrying");
                }
                Err(e) => {
                    release_watch(conn).await;
                    return Err(e);
                }
            }
        }
        Err(contention_error("save", request.id))
    }

    async fn remove(&self, conn: &mut MultiplexedConnection, id: &str) -> CacheResult<bool> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.try_remove(conn, id).await {
                Ok(Some(existed)) => return Ok(existed),
                Ok(None) => {
                    metrics::record_conflict("remove");
                    warn!(id = %id, attempt, "Watched keys changed during remove, retrying");
                }
                Err(e) => {
                    release_watch(conn).await;
                    return Err(e);
                }
            }
        }
        Err(contention_error("remove", id))
    }

    async fn clean_any_tags(&self, conn: &mut MultiplexedConnection, tags: &[String]) -> CacheResult<usize> {
        let mut removed = 0;
        for chunk in tags.chunks(self.layout.sunion_chunk) {
            match self.clean_chunk(conn, chunk).await {
                Ok(count) => removed += count,
                Err(e) => {
                    release_watch(conn).await;
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }

    async fn sweep_tags(
        &self,
        conn: &mut MultiplexedConnection,
        tags: &[String],
        seen: &mut ExistenceCache,
    ) -> CacheResult<SweepStats> {
        gc::sweep_client_side(conn, &self.layout, tags, seen).await
    }
}
