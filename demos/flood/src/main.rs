//! Gossip blocks across a simulated network and report coverage.
//!
//! One origin mints blocks and pushes them to a few random peers; every
//! peer forwards each block the first time it arrives. Deduplication rides
//! on each peer's block cache, so the flood quiesces once every forward has
//! either landed or been torn down.

use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use simnet::{
    latency::{self, GnpLatencyModel, LinkMetrics},
    network, subnet, BlockCache, Message, NetId, Network, Node, Scheduler, Subnet, Transport,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Regions peers cycle through, matched against the measured link table.
const LOCALITIES: [&str; 5] = ["DE", "US", "JP", "BR", "CA"];

/// Create a block body carrying the ID as a big-endian u64, padded to the
/// given size.
fn create_block(id: u64, size: usize) -> Bytes {
    let mut body = Vec::with_capacity(size.max(8));
    body.extend_from_slice(&id.to_be_bytes());
    if size > 8 {
        body.resize(size, 0);
    }
    Bytes::from(body)
}

/// Extract the block ID from a delivered message.
fn extract_block_id(message: &Message) -> u64 {
    let prefix: [u8; 8] = message.payload[..8]
        .try_into()
        .expect("blocks are at least 8 bytes");
    u64::from_be_bytes(prefix)
}

/// Measured summaries for a handful of region pairs; everything else rides
/// the default intercontinental entry.
fn latency_model(fragment_loss: f64) -> GnpLatencyModel {
    let mut model = GnpLatencyModel::new(latency::Config {
        default: LinkMetrics {
            min_delay: 150.0,
            avg_delay: 190.0,
            weight: 0.0,
        },
        fragment_loss,
    });
    let entries = [
        ("DE", "DE", 10.0, 12.5),
        ("US", "DE", 200.0, 250.0),
        ("US", "US", 15.0, 20.0),
        ("JP", "JP", 20.0, 25.0),
        ("JP", "CA", 250.0, 275.0),
        ("US", "CA", 30.0, 30.0),
        ("BR", "BR", 40.0, 45.0),
        ("CA", "BR", 100.0, 120.0),
    ];
    for (a, b, min_delay, avg_delay) in entries {
        model.insert(
            a,
            b,
            LinkMetrics {
                min_delay,
                avg_delay,
                weight: 1.0,
            },
        );
    }
    model
}

fn main() {
    let matches = Command::new("simnet-flood")
        .about("Gossip blocks across a simulated network and report coverage")
        .arg(
            Arg::new("peers")
                .long("peers")
                .value_parser(value_parser!(u64))
                .default_value("10")
                .help("Number of peers in the network"),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .value_parser(value_parser!(u64))
                .default_value("8")
                .help("Number of blocks the origin mints"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .value_parser(value_parser!(usize))
                .default_value("200000")
                .help("Block size in bytes"),
        )
        .arg(
            Arg::new("fanout")
                .long("fanout")
                .value_parser(value_parser!(usize))
                .default_value("3")
                .help("Peers each new block is forwarded to"),
        )
        .arg(
            Arg::new("bandwidth")
                .long("bandwidth")
                .value_parser(value_parser!(f64))
                .default_value("12500")
                .help("Uplink and downlink capacity per peer, bytes per tick"),
        )
        .arg(
            Arg::new("loss")
                .long("loss")
                .value_parser(value_parser!(f64))
                .default_value("0.01")
                .help("Per-fragment loss probability"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .default_value("42")
                .help("Seed for the loss draw and the gossip targets"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Dump transport counters after the run"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Log at debug level"),
        )
        .get_matches();

    let peers = *matches.get_one::<u64>("peers").unwrap();
    let blocks = *matches.get_one::<u64>("blocks").unwrap();
    let size = *matches.get_one::<usize>("size").unwrap();
    let fanout = *matches.get_one::<usize>("fanout").unwrap();
    let bandwidth = *matches.get_one::<f64>("bandwidth").unwrap();
    let loss = *matches.get_one::<f64>("loss").unwrap();
    let seed = *matches.get_one::<u64>("seed").unwrap();

    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    assert!(peers >= 2, "need at least an origin and one peer");

    // Topology: peers cycle through the measured regions.
    let registry = Arc::new(Mutex::new(Registry::default()));
    let mut network = Network::new(network::Config { seed });
    for peer in 0..peers {
        let locality = LOCALITIES[peer as usize % LOCALITIES.len()];
        network
            .register(Node::new(peer, bandwidth, bandwidth, locality))
            .expect("peer ids are unique");
    }
    let mut subnet = Subnet::new(subnet::Config {
        latency: latency_model(loss),
        registry: registry.clone(),
    });
    let mut scheduler = Scheduler::new(0);
    let mut caches: BTreeMap<NetId, BlockCache> = (0..peers).map(|p| (p, BlockCache::new())).collect();

    // The origin mints every block and seeds the gossip.
    let mut targets = StdRng::seed_from_u64(seed);
    for block in 0..blocks {
        let body = create_block(block, size);
        caches
            .get_mut(&0)
            .expect("origin registered")
            .insert(block, body.clone());
        for _ in 0..fanout {
            let target = targets.gen_range(1..peers);
            let mut message = Message::new(0, target, body.clone(), Transport::Ordered);
            let events = subnet
                .send(&mut network, &mut message, scheduler.now())
                .expect("origin and target registered");
            scheduler.schedule(events);
        }
    }
    info!(peers, blocks, size, fanout, "flood seeded");

    // Drive the simulation, forwarding each first sighting.
    let mut dispatched = 0u64;
    let mut forwarded = 0u64;
    while scheduler
        .step(&mut subnet, &mut network)
        .expect("dispatch failed")
    {
        dispatched += 1;
        let now = scheduler.now();
        for peer in 0..peers {
            while let Some(message) = network.node_mut(peer).expect("peer registered").recv() {
                let block = extract_block_id(&message);
                let cache = caches.get_mut(&peer).expect("cache per peer");
                if !cache.insert(block, message.payload.clone()) {
                    // Seen before; the flood stops here.
                    continue;
                }
                debug!(peer, block, now, "first sighting");
                for _ in 0..fanout {
                    let target = targets.gen_range(0..peers);
                    if target == peer {
                        continue;
                    }
                    let mut copy = Message::new(peer, target, message.payload.clone(), Transport::Ordered);
                    let events = subnet
                        .send(&mut network, &mut copy, now)
                        .expect("peers registered");
                    scheduler.schedule(events);
                    forwarded += 1;
                }
            }
        }
    }

    let covered = caches
        .values()
        .filter(|cache| cache.len() as u64 == blocks)
        .count();
    println!("peers:          {peers}");
    println!("blocks:         {blocks}");
    println!("elapsed ticks:  {}", scheduler.now());
    println!("dispatched:     {dispatched}");
    println!("forwarded:      {forwarded}");
    println!("full coverage:  {covered}/{peers}");
    for (peer, cache) in &caches {
        println!("  peer {peer:>3}: {}/{} blocks", cache.len(), blocks);
    }
    println!("auditor:        {}", scheduler.auditor().state());

    if matches.get_flag("metrics") {
        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).expect("encode metrics");
        println!("{buffer}");
    }
}
