// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Script-backed strategy: each atomic section is one script call.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use super::scripts::{self, LuaScript, ScriptCall};
use super::{
    contention_error, ExistenceCache, Layout, PriorTags, SaveRequest, SweepStats, UpdateStrategy,
    MAX_CAS_ATTEMPTS,
};
use crate::error::CacheResult;
use crate::metrics;

pub struct ScriptedUpdates {
    layout: Layout,
    save: LuaScript,
    remove: LuaScript,
    clean_any: LuaScript,
    collect: LuaScript,
}

impl ScriptedUpdates {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            save: LuaScript::new("save", scripts::SAVE),
            remove: LuaScript::new("remove", scripts::REMOVE),
            clean_any: LuaScript::new("clean_any", scripts::CLEAN_ANY),
            collect: LuaScript::new("collect_garbage", scripts::COLLECT_GARBAGE),
        }
    }

    fn expect_prior(call: &mut ScriptCall, prior: &PriorTags) {
        match &prior.raw {
            Some(raw) => call.flag(true).arg(raw.as_slice()),
            None => call.flag(false).arg(""),
        };
    }
}

#[async_trait]
impl UpdateStrategy for ScriptedUpdates {
    fn name(&self) -> &'static str {
        "lua"
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn save(&self, conn: &mut MultiplexedConnection, request: &SaveRequest<'_>) -> CacheResult<()> {
        let keys = &self.layout.keys;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let prior = PriorTags::read(conn, &self.layout, request.id).await?;
            let dropped = prior.dropped_by(request.tags);

            let mut call = ScriptCall::new();
            call.key(keys.entry(request.id))
                .key(keys.tags_key())
                .key(keys.ids_key())
                .arg(keys.tag_prefix())
                .arg(request.id)
                .arg(request.data)
                .arg(request.encoded_tags)
                .arg(request.mtime)
                .arg(request.ttl.unwrap_or(0))
                .flag(self.layout.track_ids)
                .arg(self.layout.arg_step);
            Self::expect_prior(&mut call, &prior);
            call.arg(request.tags.len()).arg(request.tags).arg(&dropped[..]);

            let applied: i64 = self.save.invoke(conn, &call).await?;
            if applied == 1 {
                debug!(id = %request.id, tags = request.tags.len(), dropped = dropped.len(), "Saved");
                return Ok(());
            }
            metrics::record_conflict("save");
            warn!(id = %request.id, attempt, "Tag field changed during save, retrying");
        }
        Err(contention_error("save", request.id))
    }

    async fn remove(&self, conn: &mut MultiplexedConnection, id: &str) -> CacheResult<bool> {
        let keys = &self.layout.keys;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let prior = PriorTags::read(conn, &self.layout, id).await?;

            let mut call = ScriptCall::new();
            call.key(keys.entry(id))
                .key(keys.tags_key())
                .key(keys.ids_key())
                .arg(keys.tag_prefix())
                .arg(id)
                .flag(self.layout.track_ids);
            Self::expect_prior(&mut call, &prior);
            call.arg(&prior.tags[..]);

            let existed: i64 = self.remove.invoke(conn, &call).await?;
            if existed >= 0 {
                return Ok(existed > 0);
            }
            metrics::record_conflict("remove");
            warn!(id = %id, attempt, "Tag field changed during remove, retrying");
        }
        Err(contention_error("remove", id))
    }

    async fn clean_any_tags(&self, conn: &mut MultiplexedConnection, tags: &[String]) -> CacheResult<usize> {
        let keys = &self.layout.keys;
        let mut removed = 0;
        for chunk in tags.chunks(self.layout.sunion_chunk) {
            let mut call = ScriptCall::new();
            call.key(keys.tags_key())
                .key(keys.ids_key())
                .arg(keys.entry_prefix())
                .arg(keys.tag_prefix())
                .flag(self.layout.track_ids)
                .arg(self.layout.arg_step)
                .arg(chunk);
            let count: usize = self.clean_any.invoke(conn, &call).await?;
            removed += count;
        }
        Ok(removed)
    }

    async fn sweep_tags(
        &self,
        conn: &mut MultiplexedConnection,
        tags: &[String],
        seen: &mut ExistenceCache,
    ) -> CacheResult<SweepStats> {
        if tags.is_empty() {
            return Ok(SweepStats::default());
        }
        let keys = &self.layout.keys;
        let known: Vec<&str> = seen.iter().map(String::as_str).collect();
        let mut call = ScriptCall::new();
        call.key(keys.tags_key())
            .key(keys.ids_key())
            .arg(keys.entry_prefix())
            .arg(keys.tag_prefix())
            .flag(self.layout.track_ids)
            .arg(self.layout.arg_step)
            .arg(known.len())
            .arg(&known[..])
            .arg(tags);
        let (ids_swept, tags_dropped, existence_checks, found): (usize, usize, usize, Vec<String>) =
            self.collect.invoke(conn, &call).await?;
        seen.extend(found);
        Ok(SweepStats {
            ids_swept,
            tags_dropped,
            existence_checks,
        })
    }
}
