// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The tag cache facade.
//!
//! [`TagCache`] owns its connections and the update strategy. Every
//! operation takes `&mut self` and runs to completion before the next one
//! starts; run several `TagCache` values for concurrency.
//!
//! Entry operations live here. Bulk cleaning and tag queries are in
//! `clean_api`, server introspection in `info_api`.
//!
//! # Example
//!
//! ```rust,no_run
//! # use tag_cache::{TagCache, TagCacheConfig, Lifetime};
//! # async fn example() -> Result<(), tag_cache::CacheError> {
//! let config = TagCacheConfig {
//!     server: Some("127.0.0.1:6379".into()),
//!     ..Default::default()
//! };
//! let mut cache = TagCache::connect(config).await?;
//!
//! cache.save("page:home", b"<html>", &["pages", "home"], Lifetime::Seconds(600)).await?;
//! assert_eq!(cache.load("page:home", false).await?.as_deref(), Some(&b"<html>"[..]));
//! cache.clean_matching_any_tags(&["pages"]).await?;
//! # Ok(())
//! # }
//! ```

mod clean_api;
mod info_api;

use std::sync::Arc;
use std::time::Duration;

use redis::ErrorKind;
use tracing::{debug, info, warn};

use crate::atomic::{strategy_for, Layout, SaveRequest, UpdateStrategy};
use crate::compression::{Codec, CodecRegistry, Envelope};
use crate::config::TagCacheConfig;
use crate::entry::{normalize_tags, unix_now, EntryCodec, EntryMetadata, FIELD_DATA, FIELD_INFINITE, FIELD_MTIME, FIELD_TAGS};
use crate::error::{CacheError, CacheResult};
use crate::keys::Keyspace;
use crate::lifetime::{Lifetime, LifetimePolicy};
use crate::metrics;
use crate::topology::{ReplicaSelector, Topology};

pub use info_api::Capabilities;

/// Pause before the single retry of a read that hit a loading primary.
const LOADING_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Builder for a [`TagCache`] with a custom replica selector or extra codecs.
pub struct TagCacheBuilder {
    config: TagCacheConfig,
    selector: ReplicaSelector,
    registry: CodecRegistry,
}

impl TagCacheBuilder {
    pub fn new(config: TagCacheConfig) -> Self {
        Self {
            config,
            selector: ReplicaSelector::default(),
            registry: CodecRegistry::with_defaults(),
        }
    }

    /// Decide which replica serves reads.
    pub fn replica_selector(mut self, selector: ReplicaSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Make a codec available by name for `compression.lib` and for reads.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.registry.register(codec);
        self
    }

    /// Validate, resolve the topology and connect.
    pub async fn connect(self) -> CacheResult<TagCache> {
        let Self {
            config,
            selector,
            registry,
        } = self;
        let (layout, lifetimes) = prepare(&config, registry)?;
        let topology = Topology::connect(&config, &selector).await?;
        let strategy = strategy_for(config.use_lua, layout);

        info!(
            strategy = strategy.name(),
            primary = %topology.primary_addr(),
            replica = topology.has_replica(),
            not_matching_tags = config.not_matching_tags,
            "Tag cache ready"
        );

        Ok(TagCache {
            config: Arc::new(config),
            topology,
            strategy,
            lifetimes,
        })
    }
}

/// Everything that can be derived from the config without a connection.
pub(crate) fn prepare(config: &TagCacheConfig, registry: CodecRegistry) -> CacheResult<(Layout, LifetimePolicy)> {
    config.validate()?;

    let compression = &config.compression;
    let codec = match compression.lib.as_deref() {
        Some(name) => Some(registry.by_name(name).ok_or_else(|| {
            CacheError::Configuration(format!(
                "unknown compression lib '{}' (available: {})",
                name,
                registry.names().join(", ")
            ))
        })?),
        None => None,
    };
    let envelope = Envelope::new(codec, compression.threshold, registry);

    let layout = Layout {
        keys: Keyspace::from_config(&config.keyspace),
        codec: EntryCodec::new(envelope, compression.data_level, compression.tags_level),
        track_ids: config.not_matching_tags,
        arg_step: config.lua_max_c_stack,
        sunion_chunk: config.sunion_chunk_size,
        remove_chunk: config.remove_chunk_size,
    };
    Ok((layout, LifetimePolicy::from_config(config)?))
}

fn observe<T>(operation: &str, result: &CacheResult<T>) {
    match result {
        Ok(_) => metrics::record_operation(operation, "success"),
        Err(e) => {
            metrics::record_operation(operation, "error");
            debug!(operation, kind = e.kind(), error = %e, "Operation failed");
        }
    }
}

fn check_id(id: &str) -> CacheResult<()> {
    if id.is_empty() {
        return Err(CacheError::Configuration("cache id must not be empty".into()));
    }
    Ok(())
}

/// Tag-indexed cache over one primary and an optional read replica.
pub struct TagCache {
    config: Arc<TagCacheConfig>,
    topology: Topology,
    strategy: Box<dyn UpdateStrategy>,
    lifetimes: LifetimePolicy,
}

impl TagCache {
    /// Connect with the default replica selector and codecs.
    pub async fn connect(config: TagCacheConfig) -> CacheResult<Self> {
        TagCacheBuilder::new(config).connect().await
    }

    pub fn builder(config: TagCacheConfig) -> TagCacheBuilder {
        TagCacheBuilder::new(config)
    }

    pub fn config(&self) -> &TagCacheConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// `"lua"` or `"transaction"`.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    fn layout(&self) -> &Layout {
        self.strategy.layout()
    }

    /// Store `data` under `id` with `tags`, replacing any previous entry
    /// and its tag memberships in one atomic section.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn save<S: AsRef<str>>(
        &mut self,
        id: &str,
        data: &[u8],
        tags: &[S],
        lifetime: impl Into<Lifetime>,
    ) -> CacheResult<()> {
        let _timer = crate::time_operation!("save");
        let result = self.save_inner(id, data, tags, lifetime.into()).await;
        observe("save", &result);
        result
    }

    async fn save_inner<S: AsRef<str>>(
        &mut self,
        id: &str,
        data: &[u8],
        tags: &[S],
        lifetime: Lifetime,
    ) -> CacheResult<()> {
        check_id(id)?;
        let tags = normalize_tags(tags);
        let layout = self.strategy.layout();
        let data = layout.codec.encode_data(data)?;
        let encoded_tags = layout.codec.encode_tags(&tags)?;
        let ttl = self.lifetimes.resolve(id, lifetime);

        let request = SaveRequest {
            id,
            data: &data,
            tags: &tags,
            encoded_tags: &encoded_tags,
            mtime: unix_now(),
            ttl,
        };
        self.strategy.save(self.topology.primary(), &request).await
    }

    /// Payload stored under `id`, or `None`.
    ///
    /// Reads go to the replica when one is connected. A replica that is
    /// still loading its dataset is bypassed for the primary; a replica
    /// miss is re-read from the primary when `retry_reads_on_primary` is
    /// set. `_skip_validity_check` has no effect: expiry is enforced by the
    /// store itself.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn load(&mut self, id: &str, _skip_validity_check: bool) -> CacheResult<Option<Vec<u8>>> {
        let _timer = crate::time_operation!("load");
        let result = self.load_inner(id).await;
        match &result {
            Ok(None) => metrics::record_operation("load", "miss"),
            other => observe("load", other),
        }
        result
    }

    async fn load_inner(&mut self, id: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = self.layout().keys.entry(id);
        let raw = self.read_data(&key).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let data = self.layout().codec.decode_data(id, &raw);

        if data.is_some() {
            if let Some(ttl) = self.lifetimes.refresh_on_load(id) {
                redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl)
                    .query_async::<()>(self.topology.primary())
                    .await?;
            }
        }
        Ok(data)
    }

    async fn read_data(&mut self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut hget = redis::cmd("HGET");
        hget.arg(key).arg(FIELD_DATA);

        let retry_on_miss = self.config.retry_reads_on_primary;
        if let Some(replica) = self.topology.replica() {
            match hget.query_async::<Option<Vec<u8>>>(replica).await {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) if !retry_on_miss => return Ok(None),
                Ok(None) => metrics::record_replica_fallback("miss"),
                Err(e) if e.kind() == ErrorKind::BusyLoadingError => {
                    warn!("Replica is loading its dataset, reading from primary");
                    metrics::record_replica_fallback("loading");
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(hget.query_async(self.topology.primary()).await?);
        }

        match hget.query_async::<Option<Vec<u8>>>(self.topology.primary()).await {
            Err(e) if e.kind() == ErrorKind::BusyLoadingError => {
                warn!("Primary is loading its dataset, retrying once");
                tokio::time::sleep(LOADING_RETRY_PAUSE).await;
                Ok(hget.query_async(self.topology.primary()).await?)
            }
            other => Ok(other?),
        }
    }

    /// Last save time of `id` (unix seconds), read from the primary.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn test(&mut self, id: &str) -> CacheResult<Option<u64>> {
        let key = self.layout().keys.entry(id);
        let result: CacheResult<Option<u64>> = redis::cmd("HGET")
            .arg(key)
            .arg(FIELD_MTIME)
            .query_async::<Option<u64>>(self.topology.primary())
            .await
            .map(|m| m.filter(|&m| m > 0))
            .map_err(CacheError::from);
        observe("test", &result);
        result
    }

    /// Delete `id` and drop it from its tag sets. `false` if it did not exist.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn remove(&mut self, id: &str) -> CacheResult<bool> {
        let _timer = crate::time_operation!("remove");
        let result = self.strategy.remove(self.topology.primary(), id).await;
        observe("remove", &result);
        result
    }

    /// Expiry, tags and mtime of `id`.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn metadata(&mut self, id: &str) -> CacheResult<Option<EntryMetadata>> {
        let result = self.metadata_inner(id).await;
        observe("metadata", &result);
        result
    }

    async fn metadata_inner(&mut self, id: &str) -> CacheResult<Option<EntryMetadata>> {
        let key = self.layout().keys.entry(id);
        let (tags, mtime, infinite): (Option<Vec<u8>>, Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(&key)
            .arg(FIELD_TAGS)
            .arg(FIELD_MTIME)
            .arg(FIELD_INFINITE)
            .query_async(self.topology.primary())
            .await?;

        let Some(mtime) = mtime.filter(|&m| m > 0) else {
            return Ok(None);
        };

        let expire_at = if infinite.as_deref() == Some("1") {
            None
        } else {
            let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(self.topology.primary()).await?;
            match expiry_from_ttl(ttl, unix_now()) {
                Some(expire_at) => expire_at,
                None => return Ok(None),
            }
        };

        let tags = tags
            .map(|raw| self.layout().codec.decode_tags(id, &raw))
            .unwrap_or_default();

        Ok(Some(EntryMetadata {
            expire_at,
            tags,
            mtime,
        }))
    }

    /// Push the expiry of a finite entry back by `extra_seconds`.
    /// Infinite and missing entries are left alone and report `false`.
    #[tracing::instrument(skip_all, fields(id = %id, extra_seconds = extra_seconds))]
    pub async fn touch(&mut self, id: &str, extra_seconds: u64) -> CacheResult<bool> {
        let result = self.touch_inner(id, extra_seconds).await;
        observe("touch", &result);
        result
    }

    async fn touch_inner(&mut self, id: &str, extra_seconds: u64) -> CacheResult<bool> {
        let key = self.layout().keys.entry(id);
        let conn = self.topology.primary();

        let infinite: Option<String> = redis::cmd("HGET").arg(&key).arg(FIELD_INFINITE).query_async(&mut *conn).await?;
        if infinite.as_deref() != Some("0") {
            return Ok(false);
        }

        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut *conn).await?;
        if ttl < 0 {
            return Ok(false);
        }
        let expire_at = unix_now() + ttl as u64 + extra_seconds;
        let applied: bool = redis::cmd("EXPIREAT").arg(&key).arg(expire_at).query_async(&mut *conn).await?;
        Ok(applied)
    }
}

/// Expiry for a `TTL` reply. `None` when the key is gone (`-2`), which
/// happens if it expired after its fields were read.
fn expiry_from_ttl(ttl: i64, now: u64) -> Option<Option<u64>> {
    match ttl {
        -2 => None,
        t if t >= 0 => Some(Some(now + t as u64)),
        _ => Some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionError;

    #[test]
    fn test_expiry_from_ttl() {
        assert_eq!(expiry_from_ttl(-2, 1_000), None);
        assert_eq!(expiry_from_ttl(-1, 1_000), Some(None));
        assert_eq!(expiry_from_ttl(0, 1_000), Some(Some(1_000)));
        assert_eq!(expiry_from_ttl(60, 1_000), Some(Some(1_060)));
    }

    fn config() -> TagCacheConfig {
        TagCacheConfig {
            server: Some("127.0.0.1:6379".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_maps_config_into_layout() {
        let config = TagCacheConfig {
            not_matching_tags: true,
            sunion_chunk_size: 7,
            remove_chunk_size: 11,
            lua_max_c_stack: 13,
            compression: crate::config::CompressionConfig {
                lib: None,
                ..Default::default()
            },
            ..config()
        };
        let (layout, lifetimes) = prepare(&config, CodecRegistry::new()).unwrap();
        assert!(layout.track_ids);
        assert_eq!(layout.sunion_chunk, 7);
        assert_eq!(layout.remove_chunk, 11);
        assert_eq!(layout.arg_step, 13);
        assert_eq!(layout.keys.entry("a"), "zc:k:a");
        assert_eq!(lifetimes.limit(), crate::config::MAX_LIFETIME);
    }

    #[test]
    fn test_prepare_rejects_unknown_codec() {
        let config = TagCacheConfig {
            compression: crate::config::CompressionConfig {
                lib: Some("lzf".into()),
                ..Default::default()
            },
            ..config()
        };
        let err = prepare(&config, CodecRegistry::with_defaults()).unwrap_err();
        assert!(matches!(err, CacheError::Configuration(ref m) if m.contains("lzf")));
    }

    #[test]
    fn test_prepare_accepts_registered_codec() {
        struct Passthrough;
        impl Codec for Passthrough {
            fn name(&self) -> &str {
                "lzf"
            }
            fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CompressionError> {
                Ok(data.to_vec())
            }
            fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
                Ok(data.to_vec())
            }
        }

        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(Passthrough));
        let config = TagCacheConfig {
            compression: crate::config::CompressionConfig {
                lib: Some("lzf".into()),
                threshold: 1,
                ..Default::default()
            },
            ..config()
        };
        let (layout, _) = prepare(&config, registry).unwrap();
        let stored = layout.codec.encode_data(b"abc").unwrap();
        assert_eq!(&stored[..2], b"lz");
    }

    #[test]
    fn test_prepare_surfaces_validation_errors() {
        assert!(matches!(
            prepare(&TagCacheConfig::default(), CodecRegistry::new()),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(check_id("").is_err());
        assert!(check_id("x").is_ok());
    }
}
