// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tag Cache
//!
//! A tag-indexed cache over Redis: opaque byte payloads stored under string
//! ids, grouped by tags, invalidated in bulk by tag.
//!
//! ## Layout
//!
//! The store has hashes and sets but no secondary indexes, so the index is
//! kept by hand:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  zc:k:<id>     hash  d=data m=mtime t=tags i=infinite       │
//! │  zc:ti:<tag>   set   ids carrying <tag>                     │
//! │  zc:tags       set   tags with a non-empty id set           │
//! │  zc:ids        set   all ids (not-matching-tags mode only)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes touching several keys go through one atomic section each, either
//! a server-side script or a `WATCH`/`MULTI`/`EXEC` transaction
//! ([`atomic`]). Entry expiry does not reach the tag sets on its own; the
//! garbage collector ([`gc`]) repairs them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tag_cache::{Lifetime, TagCache, TagCacheConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tag_cache::CacheError> {
//!     let config = TagCacheConfig {
//!         server: Some("127.0.0.1:6379".into()),
//!         not_matching_tags: true,
//!         ..Default::default()
//!     };
//!     let mut cache = TagCache::connect(config).await?;
//!
//!     cache.save("product:42", b"{...}", &["catalog", "product_42"], Lifetime::Default).await?;
//!     let ids = cache.get_ids_matching_any_tags(&["catalog"]).await?;
//!     assert_eq!(ids, vec!["product:42".to_string()]);
//!
//!     cache.clean_matching_any_tags(&["catalog"]).await?;
//!     cache.clean_old().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Topology
//!
//! Writes always go to the primary. Reads from `load` prefer a replica when
//! one is configured (direct list, sentinel discovery or legacy cluster
//! list) and fall back to the primary when the replica is loading. See
//! [`topology`].
//!
//! ## Modules
//!
//! - [`cache`]: the [`TagCache`] facade
//! - [`atomic`]: scripted and transactional update strategies
//! - [`tags`]: AND / OR / NOT tag queries
//! - [`gc`]: tag set garbage collection
//! - [`topology`]: primary discovery and replica selection
//! - [`compression`]: payload envelope and codecs
//! - [`stats`]: per-tag size statistics

pub mod atomic;
pub mod cache;
pub mod compression;
pub mod config;
pub mod entry;
pub mod error;
pub mod gc;
pub mod keys;
pub mod lifetime;
pub mod metrics;
pub mod resilience;
pub mod stats;
pub mod tags;
pub mod topology;

pub use atomic::{ScriptedUpdates, TransactionalUpdates, UpdateStrategy};
pub use cache::{Capabilities, TagCache, TagCacheBuilder};
pub use compression::{Codec, CodecRegistry, CompressionError};
pub use config::{
    AutoExpireConfig, ClusterConfig, CompressionConfig, ConnectionConfig, KeyspaceConfig, ReplicaReads,
    SentinelConfig, TagCacheConfig, MAX_LIFETIME,
};
pub use entry::EntryMetadata;
pub use error::{CacheError, CacheResult};
pub use gc::GcReport;
pub use lifetime::Lifetime;
pub use resilience::retry::RetryConfig;
pub use stats::{StatsOrder, TagStats};
pub use tags::CleanMode;
pub use topology::{NodeAddress, ReplicaSelector};
