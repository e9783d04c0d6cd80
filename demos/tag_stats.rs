// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tag size report for a live cache.
//!
//! Prints the largest tags by total size, average entry size and entry
//! count, then the metrics the scan emitted.
//!
//! # Run
//!
//! ```bash
//! cargo run --example tag_stats -- --host 127.0.0.1 --port 6379 --database 0 --limit 20
//! ```

use clap::Parser;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use tag_cache::stats::{format_bytes, top};
use tag_cache::{StatsOrder, TagCache, TagCacheConfig, TagStats};

/// Per-tag size report for a tag cache database.
#[derive(Parser, Debug)]
#[command(name = "tag_stats")]
#[command(about, long_about = None)]
struct Args {
    /// Redis host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Redis port.
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Database index.
    #[arg(short, long, default_value_t = 0)]
    database: i64,

    /// Rows per table.
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
}

fn print_table(stats: &[TagStats], order: StatsOrder, limit: usize) {
    println!("\n  Top {} tags by {}", limit, order.label());
    println!("  {:<40} {:>8} {:>14} {:>14} {:>14} {:>14}", "Tag", "Count", "Min", "Max", "Avg", "Total");
    println!("  {}", "─".repeat(110));
    for s in top(stats, order, limit) {
        println!(
            "  {:<40} {:>8} {:>14} {:>14} {:>14} {:>14}",
            s.tag,
            s.count,
            format_bytes(s.min as f64),
            format_bytes(s.max as f64),
            format_bytes(s.average()),
            format_bytes(s.total as f64),
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let server = format!("{}:{}", args.host, args.port);

    let mut config = TagCacheConfig {
        server: Some(server.clone()),
        ..Default::default()
    };
    config.connection.database = args.database;

    let mut cache = TagCache::connect(config).await?;
    let stats = cache.tag_stats().await?;

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           tag-cache: Tag Statistics                           ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!("\n  Server: {} (db {})", server, args.database);
    println!("  Live tags: {}", stats.len());
    let missing: usize = stats.iter().map(|s| s.missing).sum();
    if missing > 0 {
        println!("  Stale tag members: {} (run clean_old to repair)", missing);
    }

    for order in [StatsOrder::TotalSize, StatsOrder::AverageSize, StatsOrder::Count] {
        print_table(&stats, order, args.limit);
    }

    println!("\n  Metrics");
    println!("  {}", "─".repeat(60));
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(v) => format!("{} samples", v.len()),
        };
        println!("  {:<50} {}", key.key().name(), rendered);
    }

    Ok(())
}
