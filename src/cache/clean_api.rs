// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag queries and bulk cleaning.
//!
//! All reads here go to the primary: they decide what gets deleted, so
//! they must not lag behind writes.

use std::time::Duration;

use tracing::info;

use super::{observe, TagCache};
use crate::entry::normalize_tags;
use crate::error::CacheResult;
use crate::gc::{self, GcReport};
use crate::metrics;
use crate::tags::{self as query, CleanMode};

impl TagCache {
    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Every stored id.
    pub async fn get_ids(&mut self) -> CacheResult<Vec<String>> {
        let layout = self.strategy.layout();
        query::all_ids(self.topology.primary(), layout).await
    }

    /// Every tag currently in use.
    pub async fn get_tags(&mut self) -> CacheResult<Vec<String>> {
        let layout = self.strategy.layout();
        query::all_tags(self.topology.primary(), layout).await
    }

    /// Ids carrying all of `tags`. Empty input gives no ids.
    pub async fn get_ids_matching_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<Vec<String>> {
        let tags = normalize_tags(tags);
        let layout = self.strategy.layout();
        query::matching_all(self.topology.primary(), layout, &tags).await
    }

    /// Ids carrying any of `tags`.
    pub async fn get_ids_matching_any_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<Vec<String>> {
        let tags = normalize_tags(tags);
        let layout = self.strategy.layout();
        query::matching_any(self.topology.primary(), layout, &tags).await
    }

    /// Ids carrying none of `tags`. Fails with `UnsupportedOperation`
    /// unless `not_matching_tags` is enabled.
    pub async fn get_ids_not_matching_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<Vec<String>> {
        let tags = normalize_tags(tags);
        let layout = self.strategy.layout();
        query::not_matching(self.topology.primary(), layout, &tags).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cleaning
    // ═══════════════════════════════════════════════════════════════════════

    /// Dispatch on `mode`. Tag modes with no tags do nothing. Returns the
    /// number of entries deleted (always 0 for `All` and `Old`).
    #[tracing::instrument(skip(self, tags), fields(tags = tags.len()))]
    pub async fn clean<S: AsRef<str>>(&mut self, mode: CleanMode, tags: &[S]) -> CacheResult<usize> {
        let _timer = crate::time_operation!("clean");
        let tags = normalize_tags(tags);
        if mode.takes_tags() && tags.is_empty() {
            return Ok(0);
        }

        let result = match mode {
            CleanMode::All => self.flush().await.map(|_| 0),
            CleanMode::Old => self.collect_garbage().await.map(|_| 0),
            CleanMode::MatchingTag | CleanMode::NotMatchingTag => self.remove_resolved(mode, &tags).await,
            CleanMode::MatchingAnyTag => self.strategy.clean_any_tags(self.topology.primary(), &tags).await,
        };

        observe("clean", &result);
        if let Ok(removed) = &result {
            let removed = *removed;
            metrics::record_clean(mode.as_str(), removed);
            info!(mode = %mode, removed, "Cleaned");
        }
        result
    }

    /// Parse a legacy mode name and clean.
    pub async fn clean_by_name<S: AsRef<str>>(&mut self, mode: &str, tags: &[S]) -> CacheResult<usize> {
        let mode: CleanMode = mode.parse()?;
        self.clean(mode, tags).await
    }

    pub async fn clean_all(&mut self) -> CacheResult<()> {
        self.clean::<&str>(CleanMode::All, &[]).await.map(|_| ())
    }

    pub async fn clean_old(&mut self) -> CacheResult<()> {
        self.clean::<&str>(CleanMode::Old, &[]).await.map(|_| ())
    }

    pub async fn clean_matching_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<usize> {
        self.clean(CleanMode::MatchingTag, tags).await
    }

    pub async fn clean_not_matching_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<usize> {
        self.clean(CleanMode::NotMatchingTag, tags).await
    }

    pub async fn clean_matching_any_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> CacheResult<usize> {
        self.clean(CleanMode::MatchingAnyTag, tags).await
    }

    /// One garbage collection pass, with its report.
    pub async fn collect_garbage(&mut self) -> CacheResult<GcReport> {
        let pause = Duration::from_millis(self.config.gc_pause_ms);
        gc::collect(
            self.topology.primary(),
            self.strategy.as_ref(),
            self.config.gc_batch_size,
            pause,
        )
        .await
    }

    /// Resolve ids with a primary read, then delete them in chunks.
    async fn remove_resolved(&mut self, mode: CleanMode, tags: &[String]) -> CacheResult<usize> {
        let layout = self.strategy.layout();
        let ids = if mode == CleanMode::NotMatchingTag {
            query::not_matching(self.topology.primary(), layout, tags).await?
        } else {
            query::matching_all(self.topology.primary(), layout, tags).await?
        };
        self.strategy.remove_ids(self.topology.primary(), &ids).await
    }

    async fn flush(&mut self) -> CacheResult<()> {
        redis::cmd("FLUSHDB").query_async::<()>(self.topology.primary()).await?;
        info!(database = self.config.connection.database, "Database flushed");
        Ok(())
    }
}
