// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary discovery through sentinel coordinators.
//!
//! Coordinators are tried in order, for `connect_retries + 1` rounds. The
//! first coordinator that names a reachable primary wins. With
//! `verify_master`, the named node must answer `ROLE` with `master`; one
//! re-resolution is attempted after a 100ms pause before giving up on that
//! coordinator.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};

use super::{open_node, NodeAddress, NodeRole};
use crate::config::{ConnectionConfig, ReplicaReads, SentinelConfig};
use crate::error::{CacheError, CacheResult};

const VERIFY_PAUSE: Duration = Duration::from_millis(100);

/// Replica flags that make a node unusable for reads.
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

pub(crate) struct SentinelResolution {
    pub primary_addr: NodeAddress,
    pub primary: MultiplexedConnection,
    /// Healthy replicas; empty unless replica reads are enabled.
    pub replicas: Vec<NodeAddress>,
}

pub(crate) async fn resolve(
    sentinel: &SentinelConfig,
    settings: &ConnectionConfig,
) -> CacheResult<SentinelResolution> {
    let coordinators = sentinel
        .coordinators
        .iter()
        .map(|c| c.parse())
        .collect::<CacheResult<Vec<NodeAddress>>>()?;
    if coordinators.is_empty() {
        return Err(CacheError::Configuration("sentinel coordinators not specified".into()));
    }

    let mut last_error = None;
    for round in 0..=settings.connect_retries {
        for coordinator in &coordinators {
            match resolve_via(coordinator, sentinel, settings).await {
                Ok(resolution) => {
                    info!(
                        coordinator = %coordinator,
                        primary = %resolution.primary_addr,
                        replicas = resolution.replicas.len(),
                        "Primary resolved through sentinel"
                    );
                    return Ok(resolution);
                }
                Err(e) => {
                    warn!(coordinator = %coordinator, round, error = %e, "Sentinel lookup failed");
                    last_error = Some(e);
                }
            }
        }
    }

    Err(CacheError::Connection(format!(
        "Unable to connect to a redis sentinel: {}",
        last_error.map_or_else(|| "no coordinator answered".to_string(), |e| e.to_string())
    )))
}

async fn resolve_via(
    coordinator: &NodeAddress,
    sentinel: &SentinelConfig,
    settings: &ConnectionConfig,
) -> CacheResult<SentinelResolution> {
    let mut coord = open_node(coordinator, settings, NodeRole::Coordinator).await?;

    let (mut primary_addr, mut primary) = master_of(&mut coord, sentinel, settings).await?;

    if sentinel.verify_master && !is_master(&mut primary).await? {
        debug!(node = %primary_addr, "Named primary does not report master role, asking again");
        tokio::time::sleep(VERIFY_PAUSE).await;
        (primary_addr, primary) = master_of(&mut coord, sentinel, settings).await?;
        if !is_master(&mut primary).await? {
            return Err(CacheError::Connection(format!(
                "Unable to determine master redis server ({} is not a master)",
                primary_addr
            )));
        }
    }

    let replicas = if sentinel.load_from_replicas == ReplicaReads::Off {
        Vec::new()
    } else {
        match replicas_of(&mut coord, &sentinel.master_name).await {
            Ok(replicas) => replicas,
            Err(e) => {
                warn!(coordinator = %coordinator, error = %e, "Could not list replicas");
                Vec::new()
            }
        }
    };

    Ok(SentinelResolution {
        primary_addr,
        primary,
        replicas,
    })
}

async fn master_of(
    coord: &mut MultiplexedConnection,
    sentinel: &SentinelConfig,
    settings: &ConnectionConfig,
) -> CacheResult<(NodeAddress, MultiplexedConnection)> {
    let reply: Option<Vec<String>> = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(&sentinel.master_name)
        .query_async(coord)
        .await?;

    let addr = parse_master_addr(reply).ok_or_else(|| {
        CacheError::Connection(format!("sentinel does not know master '{}'", sentinel.master_name))
    })?;
    let conn = open_node(&addr, settings, NodeRole::Primary).await?;
    Ok((addr, conn))
}

async fn is_master(conn: &mut MultiplexedConnection) -> CacheResult<bool> {
    let role: Vec<redis::Value> = redis::cmd("ROLE").query_async(conn).await?;
    Ok(role_is_master(&role))
}

async fn replicas_of(coord: &mut MultiplexedConnection, master_name: &str) -> CacheResult<Vec<NodeAddress>> {
    let reply: Vec<Vec<String>> = redis::cmd("SENTINEL")
        .arg("replicas")
        .arg(master_name)
        .query_async(coord)
        .await?;
    Ok(parse_replicas(reply))
}

/// `SENTINEL get-master-addr-by-name` answers `[ip, port]` or nil.
pub(crate) fn parse_master_addr(reply: Option<Vec<String>>) -> Option<NodeAddress> {
    match reply?.as_slice() {
        [host, port] => port.parse().ok().map(|port| NodeAddress::new(host.as_str(), port)),
        _ => None,
    }
}

pub(crate) fn role_is_master(role: &[redis::Value]) -> bool {
    role.first()
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
        .is_some_and(|r| r == "master")
}

/// Each replica is a flat `[name, value, name, value, ...]` list.
pub(crate) fn parse_replicas(reply: Vec<Vec<String>>) -> Vec<NodeAddress> {
    reply
        .into_iter()
        .filter_map(|fields| {
            let map: HashMap<&str, &str> = fields
                .chunks_exact(2)
                .map(|kv| (kv[0].as_str(), kv[1].as_str()))
                .collect();
            let flags = map.get("flags").copied().unwrap_or("");
            if flags.split(',').any(|f| UNHEALTHY_FLAGS.contains(&f)) {
                return None;
            }
            let host = *map.get("ip")?;
            let port = map.get("port")?.parse().ok()?;
            Some(NodeAddress::new(host, port))
        })
        .collect()
}
