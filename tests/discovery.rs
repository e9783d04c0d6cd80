// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topology discovery and loading-state handling against scripted nodes.
//!
//! Each node is a small RESP server on a local port that answers from a
//! handler and logs every command it receives. Unhandled commands get
//! `+OK`, which covers connection setup and `SELECT`. No Docker needed.
//!
//! Run with: `cargo test --test discovery`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use tag_cache::{CacheError, NodeAddress, ReplicaReads, ReplicaSelector, SentinelConfig, TagCache, TagCacheConfig};

const LOADING: &str = "LOADING Redis is loading the dataset in memory";

// =============================================================================
// Scripted node
// =============================================================================

type Handler = dyn Fn(&[String]) -> Option<String> + Send + Sync;
type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

struct FakeNode {
    port: u16,
    log: CommandLog,
}

impl FakeNode {
    async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = CommandLog::default();
        let handler: Arc<Handler> = Arc::new(handler);

        let server_log = log.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, handler.clone(), server_log.clone()));
            }
        });
        Self { port, log }
    }

    fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn node(&self) -> NodeAddress {
        NodeAddress::new("127.0.0.1", self.port)
    }

    /// Commands received that start with `prefix` (name case-insensitive).
    fn count(&self, prefix: &[&str]) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|cmd| cmd.len() >= prefix.len() && prefix.iter().zip(cmd.iter()).all(|(p, a)| a.eq_ignore_ascii_case(p)))
            .count()
    }
}

async fn serve(socket: TcpStream, handler: Arc<Handler>, log: CommandLog) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    while let Some(command) = read_command(&mut reader).await {
        let reply = handler(&command).unwrap_or_else(|| "+OK\r\n".to_string());
        log.lock().push(command);
        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// One `*N` array of bulk strings; the command name comes back uppercased.
async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    args.first_mut()?.make_ascii_uppercase();
    Some(args)
}

fn bulk(s: &str) -> String {
    format!("${}\r\n{}\r\n", s.len(), s)
}

fn array(items: &[String]) -> String {
    format!("*{}\r\n{}", items.len(), items.concat())
}

fn error(message: &str) -> String {
    format!("-{}\r\n", message)
}

fn master_role() -> String {
    array(&[bulk("master"), ":0\r\n".into(), "*0\r\n".into()])
}

fn replica_role() -> String {
    array(&[bulk("slave"), bulk("127.0.0.1"), ":6379\r\n".into(), bulk("connected"), ":0\r\n".into()])
}

/// A data node that reports `role` and serves `payload` for every `HGET`.
fn data_node(role: fn() -> String, payload: &'static str) -> impl Fn(&[String]) -> Option<String> {
    move |cmd: &[String]| match cmd[0].as_str() {
        "ROLE" => Some(role()),
        "HGET" => Some(bulk(payload)),
        _ => None,
    }
}

fn master_addr_reply(port: u16) -> String {
    array(&[bulk("127.0.0.1"), bulk(&port.to_string())])
}

fn is_sentinel(cmd: &[String], sub: &str) -> bool {
    cmd[0] == "SENTINEL" && cmd.get(1).is_some_and(|s| s.eq_ignore_ascii_case(sub))
}

fn sentinel_config(sentinel: &FakeNode, verify_master: bool, reads: ReplicaReads) -> TagCacheConfig {
    let mut config = TagCacheConfig {
        sentinel: Some(SentinelConfig {
            coordinators: vec![sentinel.address()],
            master_name: "mymaster".into(),
            verify_master,
            load_from_replicas: reads,
        }),
        ..Default::default()
    };
    config.connection.connect_timeout_ms = 500;
    config.connection.connect_retries = 0;
    config
}

// =============================================================================
// Sentinel discovery
// =============================================================================

#[tokio::test]
async fn sentinel_names_the_primary() {
    let primary = FakeNode::spawn(data_node(master_role, "from-primary")).await;
    let primary_port = primary.port;
    let sentinel = FakeNode::spawn(move |cmd: &[String]| {
        is_sentinel(cmd, "get-master-addr-by-name").then(|| master_addr_reply(primary_port))
    })
    .await;

    let mut cache = TagCache::connect(sentinel_config(&sentinel, true, ReplicaReads::Off)).await.unwrap();
    assert_eq!(cache.topology().primary_addr(), &primary.node());
    assert!(!cache.topology().has_replica());
    assert_eq!(cache.load("k", false).await.unwrap().unwrap(), b"from-primary");

    assert_eq!(sentinel.count(&["SENTINEL", "get-master-addr-by-name", "mymaster"]), 1);
    assert_eq!(sentinel.count(&["SENTINEL", "replicas"]), 0);
    assert_eq!(sentinel.count(&["SELECT"]), 0);
    assert_eq!(primary.count(&["ROLE"]), 1);
}

#[tokio::test]
async fn sentinel_is_asked_again_when_named_node_is_not_master() {
    let primary = FakeNode::spawn(data_node(master_role, "from-primary")).await;
    let demoted = FakeNode::spawn(data_node(replica_role, "stale")).await;
    let (primary_port, demoted_port) = (primary.port, demoted.port);
    let lookups = Arc::new(AtomicUsize::new(0));
    let answered = lookups.clone();
    let sentinel = FakeNode::spawn(move |cmd: &[String]| {
        is_sentinel(cmd, "get-master-addr-by-name").then(|| {
            // Failover still in flight on the first lookup.
            let port = if answered.fetch_add(1, Ordering::SeqCst) == 0 { demoted_port } else { primary_port };
            master_addr_reply(port)
        })
    })
    .await;

    let started = Instant::now();
    let mut cache = TagCache::connect(sentinel_config(&sentinel, true, ReplicaReads::Off)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(cache.topology().primary_addr(), &primary.node());
    assert_eq!(lookups.load(Ordering::SeqCst), 2);
    assert_eq!(demoted.count(&["ROLE"]), 1);
    assert_eq!(primary.count(&["ROLE"]), 1);
    assert_eq!(cache.load("k", false).await.unwrap().unwrap(), b"from-primary");
}

#[tokio::test]
async fn sentinel_gives_up_when_named_node_stays_replica() {
    let demoted = FakeNode::spawn(data_node(replica_role, "stale")).await;
    let demoted_port = demoted.port;
    let sentinel = FakeNode::spawn(move |cmd: &[String]| {
        is_sentinel(cmd, "get-master-addr-by-name").then(|| master_addr_reply(demoted_port))
    })
    .await;

    let result = TagCache::connect(sentinel_config(&sentinel, true, ReplicaReads::Off)).await;
    assert!(matches!(result, Err(CacheError::Connection(ref m)) if m.contains("sentinel")));
    assert_eq!(sentinel.count(&["SENTINEL", "get-master-addr-by-name"]), 2);
}

#[tokio::test]
async fn sentinel_without_verification_trusts_the_answer() {
    let demoted = FakeNode::spawn(data_node(replica_role, "stale")).await;
    let demoted_port = demoted.port;
    let sentinel = FakeNode::spawn(move |cmd: &[String]| {
        is_sentinel(cmd, "get-master-addr-by-name").then(|| master_addr_reply(demoted_port))
    })
    .await;

    let cache = TagCache::connect(sentinel_config(&sentinel, false, ReplicaReads::Off)).await.unwrap();
    assert_eq!(cache.topology().primary_addr(), &demoted.node());
    assert_eq!(demoted.count(&["ROLE"]), 0);
}

#[tokio::test]
async fn sentinel_unknown_master_is_connection_error() {
    let sentinel = FakeNode::spawn(|cmd: &[String]| {
        is_sentinel(cmd, "get-master-addr-by-name").then(|| "*-1\r\n".to_string())
    })
    .await;

    let result = TagCache::connect(sentinel_config(&sentinel, true, ReplicaReads::Off)).await;
    assert!(matches!(result, Err(CacheError::Connection(_))));
}

#[tokio::test]
async fn sentinel_replicas_serve_reads() {
    let primary = FakeNode::spawn(data_node(master_role, "from-primary")).await;
    let replica = FakeNode::spawn(data_node(replica_role, "from-replica")).await;
    let (primary_port, replica_port) = (primary.port, replica.port);
    let sentinel = FakeNode::spawn(move |cmd: &[String]| {
        if is_sentinel(cmd, "get-master-addr-by-name") {
            return Some(master_addr_reply(primary_port));
        }
        if is_sentinel(cmd, "replicas") {
            let entry = |port: u16, flags: &str| {
                let fields = ["name", "r", "ip", "127.0.0.1", "port", &port.to_string(), "flags", flags]
                    .iter()
                    .map(|f| bulk(f))
                    .collect::<Vec<_>>();
                array(&fields)
            };
            return Some(array(&[entry(1, "slave,s_down"), entry(replica_port, "slave")]));
        }
        None
    })
    .await;

    let mut cache = TagCache::builder(sentinel_config(&sentinel, true, ReplicaReads::Replicas))
        .replica_selector(ReplicaSelector::first())
        .connect()
        .await
        .unwrap();
    assert_eq!(cache.topology().primary_addr(), &primary.node());
    assert_eq!(cache.topology().replica_addr(), Some(&replica.node()));
    assert_eq!(cache.load("k", false).await.unwrap().unwrap(), b"from-replica");
    assert_eq!(primary.count(&["HGET"]), 0);
}

// =============================================================================
// Loading state
// =============================================================================

#[tokio::test]
async fn loading_replica_falls_back_to_primary() {
    let primary = FakeNode::spawn(data_node(master_role, "from-primary")).await;
    let replica = FakeNode::spawn(|cmd: &[String]| (cmd[0] == "HGET").then(|| error(LOADING))).await;

    let config = TagCacheConfig {
        server: Some(primary.address()),
        load_from_replicas: vec![replica.address()],
        master_write_only: true,
        ..Default::default()
    };
    let mut cache = TagCache::builder(config)
        .replica_selector(ReplicaSelector::first())
        .connect()
        .await
        .unwrap();
    assert_eq!(cache.topology().replica_addr(), Some(&replica.node()));

    let started = Instant::now();
    assert_eq!(cache.load("k", false).await.unwrap().unwrap(), b"from-primary");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(replica.count(&["HGET"]), 1);
    assert_eq!(primary.count(&["HGET"]), 1);
}

#[tokio::test]
async fn loading_primary_is_read_again_after_pause() {
    let hgets = Arc::new(AtomicUsize::new(0));
    let served = hgets.clone();
    let primary = FakeNode::spawn(move |cmd: &[String]| {
        (cmd[0] == "HGET").then(|| {
            if served.fetch_add(1, Ordering::SeqCst) == 0 {
                error(LOADING)
            } else {
                bulk("loaded")
            }
        })
    })
    .await;

    let mut cache = TagCache::connect(TagCacheConfig {
        server: Some(primary.address()),
        ..Default::default()
    })
    .await
    .unwrap();

    let started = Instant::now();
    assert_eq!(cache.load("k", false).await.unwrap().unwrap(), b"loaded");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(hgets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn primary_still_loading_after_retry_is_an_error() {
    let primary = FakeNode::spawn(|cmd: &[String]| (cmd[0] == "HGET").then(|| error(LOADING))).await;

    let mut cache = TagCache::connect(TagCacheConfig {
        server: Some(primary.address()),
        ..Default::default()
    })
    .await
    .unwrap();

    assert!(cache.load("k", false).await.is_err());
    assert_eq!(primary.count(&["HGET"]), 2);
}
