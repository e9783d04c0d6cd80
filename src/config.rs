// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the tag cache.
//!
//! # Example
//!
//! ```
//! use tag_cache::TagCacheConfig;
//!
//! // Minimal config: one primary, everything else defaulted
//! let config = TagCacheConfig {
//!     server: Some("127.0.0.1:6379".into()),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.sunion_chunk_size, 500);
//!
//! // Nothing to connect to
//! assert!(TagCacheConfig::default().validate().is_err());
//! ```

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};
use crate::topology::NodeAddress;

/// Hard ceiling for any entry TTL (30 days).
pub const MAX_LIFETIME: u64 = 2_592_000;

/// Lua's `unpack()` runs out of C stack slots around 8000 values.
pub const LUA_UNPACK_HARD_LIMIT: usize = 7990;

/// Configuration for the tag cache.
///
/// Exactly one of `server`, `sentinel` or `cluster` selects the topology.
/// When `sentinel` is present, `server` is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct TagCacheConfig {
    /// Direct primary address (`host[:port]`)
    #[serde(default)]
    pub server: Option<String>,

    /// Replica addresses for direct mode; one is drawn at connect time
    #[serde(default)]
    pub load_from_replicas: Vec<String>,

    /// Never send reads to the primary when replicas are configured
    #[serde(default)]
    pub master_write_only: bool,

    /// Coordinator (sentinel) discovery
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,

    /// Legacy static primary/replica list
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,

    /// Credentials, database and timeouts shared by every connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Key names and prefixes
    #[serde(default)]
    pub keyspace: KeyspaceConfig,

    /// Lifetime used when `save` is asked for the default (seconds, `None` = infinite)
    #[serde(default = "default_lifetime")]
    pub default_lifetime: Option<u64>,

    /// Upper bound applied to every per-save lifetime; capped at [`MAX_LIFETIME`]
    #[serde(default = "default_lifetime_limit")]
    pub lifetime_limit: u64,

    /// Maintain the global id set so "not matching" queries work
    #[serde(default)]
    pub not_matching_tags: bool,

    #[serde(default)]
    pub compression: CompressionConfig,

    /// Max tag sets per SUNION
    #[serde(default = "default_sunion_chunk_size")]
    pub sunion_chunk_size: usize,

    /// Max entry keys deleted per transaction
    #[serde(default = "default_remove_chunk_size")]
    pub remove_chunk_size: usize,

    /// Use server-side scripts; `false` selects the MULTI/EXEC strategy
    #[serde(default = "default_use_lua")]
    pub use_lua: bool,

    /// Max values handed to one `unpack()` call inside a script
    #[serde(default = "default_lua_max_c_stack")]
    pub lua_max_c_stack: usize,

    /// Re-read from the primary when the replica has no value
    #[serde(default)]
    pub retry_reads_on_primary: bool,

    #[serde(default)]
    pub auto_expire: Option<AutoExpireConfig>,

    /// Only reported through capabilities; cleaning is never scheduled here
    #[serde(default)]
    pub automatic_cleaning_factor: u32,

    /// Tags swept per garbage collection step
    #[serde(default = "default_gc_batch_size")]
    pub gc_batch_size: usize,

    /// Pause between garbage collection steps
    #[serde(default = "default_gc_pause_ms")]
    pub gc_pause_ms: u64,
}

/// Connection settings applied identically to primary, replica and coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Database index (never sent to coordinators)
    #[serde(default)]
    pub database: i64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// Extra attempts after the first failed connect
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Coordinator addresses, polled round-robin
    pub coordinators: Vec<String>,
    /// Name the coordinators know the primary by
    pub master_name: String,
    /// Ask the resolved node for its ROLE before accepting it
    #[serde(default)]
    pub verify_master: bool,
    #[serde(default)]
    pub load_from_replicas: ReplicaReads,
}

/// Where `load` reads go in coordinator mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaReads {
    /// Primary only
    #[default]
    Off,
    /// One of the replicas
    Replicas,
    /// One of the replicas or the primary
    ReplicasAndPrimary,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// The first usable address becomes the primary
    #[serde(default)]
    pub masters: Vec<String>,
    #[serde(default)]
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyspaceConfig {
    #[serde(default = "default_entry_prefix")]
    pub entry_prefix: String,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_ids_key")]
    pub ids_key: String,
    #[serde(default = "default_tags_key")]
    pub tags_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Codec name; `None` stores everything raw
    #[serde(default = "default_compression_lib")]
    pub lib: Option<String>,
    /// Payloads shorter than this are stored raw (minimum 1)
    #[serde(default = "default_compress_threshold")]
    pub threshold: usize,
    /// Codec level for entry data, 0 disables
    #[serde(default = "default_compress_level")]
    pub data_level: i32,
    /// Codec level for the tag list, 0 disables
    #[serde(default = "default_compress_level")]
    pub tags_level: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoExpireConfig {
    /// Lifetime forced on matching ids saved without one
    pub lifetime: u64,
    /// Regex matched against the id
    #[serde(default = "default_auto_expire_pattern")]
    pub pattern: String,
    /// Re-apply the lifetime on every load of a matching id
    #[serde(default)]
    pub refresh_on_load: bool,
}

fn default_lifetime() -> Option<u64> { Some(3600) }
fn default_lifetime_limit() -> u64 { MAX_LIFETIME }
fn default_sunion_chunk_size() -> usize { 500 }
fn default_remove_chunk_size() -> usize { 10_000 }
fn default_use_lua() -> bool { true }
fn default_lua_max_c_stack() -> usize { 5000 }
fn default_gc_batch_size() -> usize { 10 }
fn default_gc_pause_ms() -> u64 { 20 }
fn default_connect_timeout_ms() -> u64 { 2500 }
fn default_connect_retries() -> usize { 1 }
fn default_entry_prefix() -> String { "zc:k:".into() }
fn default_tag_prefix() -> String { "zc:ti:".into() }
fn default_ids_key() -> String { "zc:ids".into() }
fn default_tags_key() -> String { "zc:tags".into() }
fn default_compression_lib() -> Option<String> { Some("zstd".into()) }
fn default_compress_threshold() -> usize { 20480 }
fn default_compress_level() -> i32 { 1 }
fn default_auto_expire_pattern() -> String { "REQEST".into() }

impl Default for TagCacheConfig {
    fn default() -> Self {
        Self {
            server: None,
            load_from_replicas: Vec::new(),
            master_write_only: false,
            sentinel: None,
            cluster: None,
            connection: ConnectionConfig::default(),
            keyspace: KeyspaceConfig::default(),
            default_lifetime: default_lifetime(),
            lifetime_limit: default_lifetime_limit(),
            not_matching_tags: false,
            compression: CompressionConfig::default(),
            sunion_chunk_size: default_sunion_chunk_size(),
            remove_chunk_size: default_remove_chunk_size(),
            use_lua: default_use_lua(),
            lua_max_c_stack: default_lua_max_c_stack(),
            retry_reads_on_primary: false,
            auto_expire: None,
            automatic_cleaning_factor: 0,
            gc_batch_size: default_gc_batch_size(),
            gc_pause_ms: default_gc_pause_ms(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            database: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            connect_retries: default_connect_retries(),
        }
    }
}

impl Default for KeyspaceConfig {
    fn default() -> Self {
        Self {
            entry_prefix: default_entry_prefix(),
            tag_prefix: default_tag_prefix(),
            ids_key: default_ids_key(),
            tags_key: default_tags_key(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            lib: default_compression_lib(),
            threshold: default_compress_threshold(),
            data_level: default_compress_level(),
            tags_level: default_compress_level(),
        }
    }
}

impl TagCacheConfig {
    /// Check every option that can be checked without touching the network.
    pub fn validate(&self) -> CacheResult<()> {
        self.validate_topology()?;

        let ks = &self.keyspace;
        if ks.entry_prefix.is_empty() || ks.tag_prefix.is_empty() {
            return Err(CacheError::Configuration("key prefixes must not be empty".into()));
        }
        if ks.ids_key.is_empty() || ks.tags_key.is_empty() {
            return Err(CacheError::Configuration("global set keys must not be empty".into()));
        }

        for (name, value) in [
            ("sunion_chunk_size", self.sunion_chunk_size),
            ("remove_chunk_size", self.remove_chunk_size),
            ("lua_max_c_stack", self.lua_max_c_stack),
            ("gc_batch_size", self.gc_batch_size),
        ] {
            if value == 0 {
                return Err(CacheError::Configuration(format!("'{}' must be positive", name)));
            }
        }
        if self.lua_max_c_stack > LUA_UNPACK_HARD_LIMIT {
            return Err(CacheError::Configuration(format!(
                "'lua_max_c_stack' must not exceed {}",
                LUA_UNPACK_HARD_LIMIT
            )));
        }

        if let Some(lifetime) = self.default_lifetime {
            if lifetime > MAX_LIFETIME {
                return Err(CacheError::LifetimeLimit {
                    requested: lifetime,
                    limit: MAX_LIFETIME,
                });
            }
        }

        if let Some(auto) = &self.auto_expire {
            regex::Regex::new(&auto.pattern).map_err(|e| {
                CacheError::Configuration(format!("invalid auto_expire pattern: {}", e))
            })?;
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(CacheError::Configuration("'connect_timeout_ms' must be positive".into()));
        }

        Ok(())
    }

    fn validate_topology(&self) -> CacheResult<()> {
        if let Some(sentinel) = &self.sentinel {
            if sentinel.coordinators.is_empty() {
                return Err(CacheError::Configuration("sentinel coordinators not specified".into()));
            }
            if sentinel.master_name.trim().is_empty() {
                return Err(CacheError::Configuration("sentinel 'master_name' not specified".into()));
            }
            for addr in &sentinel.coordinators {
                addr.parse::<NodeAddress>()?;
            }
            return Ok(());
        }

        if let Some(server) = self.server.as_deref().filter(|s| !s.trim().is_empty()) {
            server.parse::<NodeAddress>()?;
            for addr in &self.load_from_replicas {
                addr.parse::<NodeAddress>()?;
            }
            return Ok(());
        }

        if let Some(cluster) = &self.cluster {
            if cluster.masters.iter().all(|m| m.trim().is_empty()) {
                return Err(CacheError::Configuration("cluster has no usable master".into()));
            }
            for addr in cluster.masters.iter().chain(&cluster.replicas).filter(|a| !a.trim().is_empty()) {
                addr.parse::<NodeAddress>()?;
            }
            return Ok(());
        }

        Err(CacheError::Configuration("Redis 'server' not specified".into()))
    }

    /// Per-save lifetime ceiling actually enforced.
    #[must_use]
    pub fn effective_lifetime_limit(&self) -> u64 {
        self.lifetime_limit.clamp(1, MAX_LIFETIME)
    }
}
