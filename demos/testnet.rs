//! Put and get values across an in-memory testnet and print a latency histogram.
//!
//! Run: `cargo run --release --example testnet -- --size 50`

use std::time::Instant;

use clap::Parser;
use histo::Histogram;
use tracing::Level;

use kademlia::{Bytes, Testnet};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes
    #[arg(short, long, default_value_t = 50)]
    size: usize,
    /// Number of values to put then get
    #[arg(short, long, default_value_t = 20)]
    values: usize,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    let cli = Cli::parse();

    let start = Instant::now();
    let testnet = Testnet::new(cli.size).expect("Failed to build testnet");
    println!(
        "Bootstrapped {} nodes in {:.2}s\n",
        cli.size,
        start.elapsed().as_secs_f64()
    );

    let nodes = &testnet.nodes;

    let mut puts = Histogram::with_buckets(10);
    let mut gets = Histogram::with_buckets(10);
    let mut misses = 0;

    for i in 0..cli.values {
        let key = format!("key-{i}");
        let value = Bytes::from(format!("value-{i}"));

        let start = Instant::now();
        let stored_at = nodes[i % nodes.len()]
            .put(key.as_bytes(), value.clone())
            .expect("put failed");
        puts.add(start.elapsed().as_millis() as u64);

        let reader = &nodes[(i * 7 + 1) % nodes.len()];

        let start = Instant::now();
        let found = reader.get(key.as_bytes()).expect("get failed");
        gets.add(start.elapsed().as_millis() as u64);

        if found.as_ref() != Some(&value) {
            misses += 1;
        }

        println!("{key}: stored at {stored_at} nodes");
    }

    println!("\nput latency (ms)\n{}", puts);
    println!("get latency (ms)\n{}", gets);
    println!("misses: {misses}/{}", cli.values);
}
