//! Micro-benchmarks for RoutingTable operations: add, closest, refresh
//! planning and remove at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use kademlia::{Contact, Id, RoutingTable, ID_BITS};

fn main() {
    println!("routing_table\n");

    bench_add();
    bench_closest();
    bench_refresh_targets();
    bench_remove();
}

fn address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6881))
}

fn filled(size: usize) -> RoutingTable {
    let mut table = RoutingTable::new(Id::random());
    for _ in 0..size {
        table.add(Contact::new(Id::random(), address()));
    }
    table
}

fn bench_add() {
    println!("add");

    // Pre-generate random contacts outside the timed section
    let contacts: Vec<_> = (0..1000)
        .map(|_| Contact::new(Id::random(), address()))
        .collect();

    for size in [0, 100, 400] {
        let mut table = filled(size);

        let start = Instant::now();
        for contact in &contacts {
            table.add(*contact);
        }
        let per_op = start.elapsed().as_nanos() / contacts.len() as u128;
        println!(
            "{size:>3} contacts: {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    println!();
}

fn bench_closest() {
    println!("closest");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let table = filled(size);

        let start = Instant::now();
        for target in &targets {
            let _ = table.closest(target, table.k());
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} contacts: {per_op}ns/op");
    }

    println!();
}

fn bench_refresh_targets() {
    println!("refresh targets");

    let table = filled(200);
    let id = *table.id();

    let start = Instant::now();
    let mut count = 0;
    for _ in 0..100 {
        for index in table.stale_buckets(ID_BITS - 1, Duration::ZERO) {
            let _ = id.random_in_bucket(index);
            count += 1;
        }
    }
    let per_op = start.elapsed().as_nanos() / count as u128;
    println!("{per_op}ns/bucket ({count} buckets)");
    println!();
}

fn bench_remove() {
    println!("remove");

    let mut table = RoutingTable::new(Id::random());

    let mut ids = Vec::new();
    for _ in 0..200 {
        let id = Id::random();
        ids.push(id);
        table.add(Contact::new(id, address()));
    }

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
