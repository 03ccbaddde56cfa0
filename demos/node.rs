//! Run a Kademlia node over UDP, optionally joining through a bootstrap contact.
//!
//! Run: `cargo run --example node -- --port 6881`
//! Then: `cargo run --example node -- --bootstrap <id>@127.0.0.1:6881`

use std::sync::mpsc::channel;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};

use kademlia::{Bytes, Contact, Node};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// UDP port to listen on, random if omitted
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrap contact as `<hex id>@<ip:port>`
    #[arg(short, long)]
    bootstrap: Option<Contact>,
    /// Store this value under `key` once connected
    #[arg(long, requires = "key")]
    put: Option<String>,
    /// Key to put or get
    #[arg(long)]
    key: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let mut builder = Node::builder();
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }

    let node = builder.build().expect("Failed to start node");
    let contact = node.contact().expect("Node was shutdown");

    info!("Node is running as {} Press Ctrl+C to stop.", contact);

    if let Some(bootstrap) = cli.bootstrap {
        match node.connect(bootstrap) {
            Ok(()) => info!("Connected through {}", bootstrap),
            Err(error) => info!(?error, "Failed to connect"),
        }
    }

    if let Some(key) = &cli.key {
        match &cli.put {
            Some(value) => {
                let stored_at = node
                    .put(key.as_bytes(), Bytes::from(value.clone()))
                    .expect("put failed");
                info!("Stored {:?} at {} nodes", key, stored_at);
            }
            None => {
                let value = node.get(key.as_bytes()).expect("get failed");
                info!("Got {:?} for {:?}", value, key);
            }
        }
    }

    let (tx_interrupted, rx_interrupted) = channel();

    ctrlc::set_handler(move || {
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    while rx_interrupted.recv_timeout(Duration::from_secs(30)).is_err() {
        let info = node.info().expect("Node was shutdown");

        info!("=== Node Status ===");
        info!("Node ID: {}", info.id());
        info!("Local address: {}", info.local_addr());
        info!("Routing table size: {}", info.routing_table_size());
        info!("Inflight requests: {}", info.inflight_requests());
    }

    info!("Shutting down");
    node.shutdown();
}
