use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use xdht::{
    BlockType, DhtConfig, DhtNode, GetRequest, Keypair, MemoryNetwork, PutRequest, RouteOptions,
    key_for,
};

/// Run a ring of in-memory nodes and report on it.
#[derive(Parser, Debug)]
#[command(name = "xdht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes to simulate.
    #[arg(short, long, default_value = "16")]
    nodes: usize,

    /// Extra random links per node on top of the ring.
    #[arg(short, long, default_value = "1")]
    chords: usize,

    /// Use short protocol timers.
    #[arg(long)]
    fast: bool,

    /// Seconds to wait before the demo PUT/GET.
    #[arg(long, default_value = "5")]
    settle: u64,

    /// Seconds between telemetry summaries.
    #[arg(short, long, default_value = "30")]
    telemetry_interval: u64,

    /// Derive node keys and chords from this seed for repeatable runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(short, long)]
    duration: Option<u64>,

    #[arg(long, default_value = "64")]
    routing_table_threshold: usize,

    #[arg(long, default_value = "2")]
    max_trails_per_finger: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        anyhow::bail!("need at least 2 nodes, got {}", args.nodes);
    }
    if args.telemetry_interval == 0 {
        anyhow::bail!("telemetry interval must be at least 1 second");
    }
    let base = if args.fast { DhtConfig::fast() } else { DhtConfig::default() };
    let config = DhtConfig {
        routing_table_threshold: args.routing_table_threshold,
        max_trails_per_finger: args.max_trails_per_finger,
        ..base
    };
    config.validate().context("invalid configuration")?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let keypair = match args.seed {
            Some(_) => Keypair::from_secret_key_bytes(&rng.r#gen()),
            None => Keypair::generate(),
        };
        let contact = keypair.contact(vec![format!("mem:{index}")]);
        let (transport, events) = network.endpoint(contact.identity).await;
        nodes.push(DhtNode::spawn(contact, config.clone(), transport, events)?);
    }
    nodes.sort_by_key(|node| node.identity().ring_value());

    for (i, node) in nodes.iter().enumerate() {
        let next = &nodes[(i + 1) % nodes.len()];
        network.connect(node.identity(), next.identity()).await?;
    }
    for node in &nodes {
        for _ in 0..args.chords {
            let other = &nodes[rng.gen_range(0..nodes.len())];
            if other.identity() != node.identity() {
                network.connect(node.identity(), other.identity()).await?;
            }
        }
    }
    info!(nodes = nodes.len(), links = network.link_count().await, "network assembled");

    time::sleep(Duration::from_secs(args.settle)).await;
    demo_put_get(&nodes).await;

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));
    let deadline = time::sleep(
        args.duration
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(365 * 24 * 3600)),
    );
    tokio::pin!(deadline);

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = &mut deadline => {
                info!("run duration elapsed, exiting");
                break;
            }
            _ = interval.tick() => {
                report(&nodes).await;
            }
        }
    }

    for node in &nodes {
        node.quit().await;
    }
    Ok(())
}

async fn demo_put_get(nodes: &[DhtNode]) {
    let (Some(writer), Some(reader)) = (nodes.first(), nodes.last()) else {
        return;
    };
    let value = b"hello from the ring".to_vec();
    let key = key_for(&value);
    let put = PutRequest {
        key,
        value: value.clone(),
        block_type: BlockType::Data,
        options: RouteOptions::RECORD_ROUTE,
        replication: 2,
        expiration_ms: 0,
    };
    if let Err(e) = writer.put(put).await {
        warn!(error = %e, "demo put failed");
        return;
    }
    // Let the PUT land before reading it back.
    time::sleep(Duration::from_millis(500)).await;
    let get = GetRequest {
        key,
        block_type: BlockType::Data,
        options: RouteOptions::RECORD_ROUTE,
        replication: 1,
        xquery: Vec::new(),
    };
    match reader.get(get).await {
        Ok(replies) if replies.iter().any(|r| r.value == value) => {
            let reply = replies.iter().find(|r| r.value == value);
            info!(
                key = %key.short(),
                get_hops = reply.map(|r| r.get_path.len()).unwrap_or(0),
                put_hops = reply.map(|r| r.put_path.len()).unwrap_or(0),
                "demo get found value"
            );
        }
        Ok(_) => warn!(key = %key.short(), "demo get returned nothing"),
        Err(e) => warn!(error = %e, "demo get failed"),
    }

    match reader.find_peer(writer.identity()).await {
        Ok(Some(contact)) => info!(
            wanted = %writer.identity().short(),
            found = %contact.identity.short(),
            addr = contact.primary_addr().unwrap_or("-"),
            "demo find_peer"
        ),
        Ok(None) => warn!(wanted = %writer.identity().short(), "demo find_peer found nobody"),
        Err(e) => warn!(error = %e, "demo find_peer failed"),
    }
}

async fn report(nodes: &[DhtNode]) {
    let mut with_successor = 0;
    let mut with_predecessor = 0;
    let mut fingers = 0;
    let mut routes = 0;
    let mut stored = 0;
    let mut dropped = 0;
    for node in nodes {
        let Ok(snapshot) = node.telemetry().await else {
            continue;
        };
        with_successor += usize::from(snapshot.successor.is_some());
        with_predecessor += usize::from(snapshot.predecessor.is_some());
        fingers += snapshot.fingers;
        routes += snapshot.routing_entries;
        stored += snapshot.stored_records;
        dropped += snapshot.stats.malformed_dropped + snapshot.stats.queue_dropped;
    }
    info!(
        nodes = nodes.len(),
        with_successor,
        with_predecessor,
        avg_fingers = %format!("{:.1}", fingers as f64 / nodes.len() as f64),
        routes,
        stored,
        dropped,
        "telemetry snapshot"
    );
}
