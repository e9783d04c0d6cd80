// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary and replica resolution.
//!
//! Three ways to find the primary:
//!
//! - **direct**: `server` is the primary; `load_from_replicas` optionally
//!   lists read nodes
//! - **sentinel**: coordinators are polled round-robin for the primary's
//!   address (see [`sentinel`])
//! - **cluster**: legacy static list, first usable master plus one replica
//!
//! Every connection gets the same credentials and timeouts. Data
//! connections always send an explicit `SELECT`.
//!
//! The replica is best effort. If it cannot be opened the topology logs a
//! warning and serves reads from the primary.

pub mod replica;
pub mod sentinel;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ReplicaReads, TagCacheConfig};
use crate::error::{CacheError, CacheResult};
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

pub use replica::ReplicaSelector;

pub const DEFAULT_PORT: u16 = 6379;

/// `host:port` of one store node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddress {
    type Err = CacheError;

    /// Accepts `host`, `host:port`, `[v6]:port`, bare v6, with an optional
    /// `tcp://` or `redis://` scheme.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let raw = raw
            .strip_prefix("tcp://")
            .or_else(|| raw.strip_prefix("redis://"))
            .unwrap_or(raw)
            .trim_end_matches('/');

        let invalid = || CacheError::Configuration(format!("invalid node address '{}'", s));
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

        if raw.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(Self::new(host, port));
        }

        match raw.matches(':').count() {
            0 => Ok(Self::new(raw, DEFAULT_PORT)),
            1 => {
                let (host, port) = raw.split_once(':').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            _ => Ok(Self::new(raw, DEFAULT_PORT)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    Primary,
    Replica,
    Coordinator,
}

impl NodeRole {
    fn label(self) -> &'static str {
        match self {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
            NodeRole::Coordinator => "coordinator",
        }
    }
}

/// Open one connection. Coordinators never get a `SELECT`.
pub(crate) async fn open_node(
    addr: &NodeAddress,
    settings: &ConnectionConfig,
    role: NodeRole,
) -> CacheResult<MultiplexedConnection> {
    let info = ConnectionInfo {
        addr: ConnectionAddr::Tcp(addr.host.clone(), addr.port),
        redis: RedisConnectionInfo {
            username: settings.username.clone(),
            password: settings.password.clone(),
            ..Default::default()
        },
    };
    let client = Client::open(info)
        .map_err(|e| CacheError::Configuration(format!("{} {}: {}", role.label(), addr, e)))?;

    let mut async_config = AsyncConnectionConfig::new()
        .set_connection_timeout(Duration::from_millis(settings.connect_timeout_ms));
    if let Some(ms) = settings.read_timeout_ms {
        async_config = async_config.set_response_timeout(Duration::from_millis(ms));
    }

    let mut conn = client
        .get_multiplexed_async_connection_with_config(&async_config)
        .await
        .map_err(|e| {
            metrics::record_connection_error(role.label());
            CacheError::Connection(format!("{} {}: {}", role.label(), addr, e))
        })?;

    if role != NodeRole::Coordinator {
        redis::cmd("SELECT")
            .arg(settings.database)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                CacheError::Connection(format!(
                    "database {} could not be selected on {}: {}",
                    settings.database, addr, e
                ))
            })?;
    }

    debug!(node = %addr, role = role.label(), "Connection opened");
    Ok(conn)
}

async fn open_with_retry(
    addr: &NodeAddress,
    settings: &ConnectionConfig,
    role: NodeRole,
) -> CacheResult<MultiplexedConnection> {
    let policy = RetryConfig::connect(settings.connect_retries);
    retry(role.label(), &policy, || open_node(addr, settings, role)).await
}

/// Live connections: one writable primary and at most one replica for reads.
pub struct Topology {
    primary_addr: NodeAddress,
    primary: MultiplexedConnection,
    replica: Option<(NodeAddress, MultiplexedConnection)>,
}

impl Topology {
    /// Resolve and connect. Fails only if no primary can be opened.
    pub async fn connect(config: &TagCacheConfig, selector: &ReplicaSelector) -> CacheResult<Self> {
        let settings = &config.connection;

        let (primary_addr, primary, candidates) = if let Some(sentinel_config) = &config.sentinel {
            let resolved = sentinel::resolve(sentinel_config, settings).await?;
            let mut candidates = resolved.replicas;
            if sentinel_config.load_from_replicas == ReplicaReads::ReplicasAndPrimary {
                candidates.push(resolved.primary_addr.clone());
            }
            (resolved.primary_addr, resolved.primary, candidates)
        } else if let Some(server) = config.server.as_deref().filter(|s| !s.trim().is_empty()) {
            let addr: NodeAddress = server.parse()?;
            let primary = open_with_retry(&addr, settings, NodeRole::Primary).await?;
            let mut candidates = config
                .load_from_replicas
                .iter()
                .map(|r| r.parse())
                .collect::<CacheResult<Vec<NodeAddress>>>()?;
            // The primary joins the draw unless it is reserved for writes.
            if !candidates.is_empty() && !config.master_write_only {
                candidates.push(addr.clone());
            }
            (addr, primary, candidates)
        } else if let Some(cluster) = &config.cluster {
            let master = cluster
                .masters
                .iter()
                .find(|m| !m.trim().is_empty())
                .ok_or_else(|| CacheError::Configuration("cluster has no usable master".into()))?;
            let addr: NodeAddress = master.parse()?;
            let primary = open_with_retry(&addr, settings, NodeRole::Primary).await?;
            let candidates = cluster
                .replicas
                .iter()
                .filter(|r| !r.trim().is_empty())
                .map(|r| r.parse())
                .collect::<CacheResult<Vec<NodeAddress>>>()?;
            (addr, primary, candidates)
        } else {
            return Err(CacheError::Configuration("Redis 'server' not specified".into()));
        };

        let replica = match selector.choose(&candidates, &primary_addr) {
            Some(addr) => match open_with_retry(&addr, settings, NodeRole::Replica).await {
                Ok(conn) => Some((addr, conn)),
                Err(e) => {
                    warn!(replica = %addr, error = %e, "Replica unavailable, reading from primary");
                    None
                }
            },
            None => None,
        };

        metrics::set_replica_active(replica.is_some());
        info!(
            primary = %primary_addr,
            replica = ?replica.as_ref().map(|(addr, _)| addr.to_string()),
            "Topology resolved"
        );

        Ok(Self {
            primary_addr,
            primary,
            replica,
        })
    }

    /// Connection for writes and primary-only reads.
    pub fn primary(&mut self) -> &mut MultiplexedConnection {
        &mut self.primary
    }

    pub fn replica(&mut self) -> Option<&mut MultiplexedConnection> {
        self.replica.as_mut().map(|(_, conn)| conn)
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub fn primary_addr(&self) -> &NodeAddress {
        &self.primary_addr
    }

    pub fn replica_addr(&self) -> Option<&NodeAddress> {
        self.replica.as_ref().map(|(addr, _)| addr)
    }
}
