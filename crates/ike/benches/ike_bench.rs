//! IKE Performance Benchmarks
//!
//! Benchmarks for message parsing, key exchange primitives and a full
//! Main Mode plus Quick Mode negotiation between two engines.
//!
//! Run with: `cargo bench --bench ike_bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fynx_ike::crypto::{DhGroup, HashAlgorithm};
use fynx_ike::isakmp::{ExchangeType, IsakmpFlags, IsakmpHeader, MessageBuilder, PayloadType};
use fynx_ike::{
    ConnectionConfig, DaemonConfig, EndConfig, IkeDaemon, MemoryKernel, WhackCommand, WhackMessage,
};
use std::net::IpAddr;
use std::time::{Duration, Instant};

fn daemon(iface: IpAddr) -> IkeDaemon {
    let config = DaemonConfig::builder().with_interface(iface).build().unwrap();
    IkeDaemon::new(config, Box::new(MemoryKernel::new())).unwrap()
}

fn connection(me: IpAddr, him: IpAddr) -> ConnectionConfig {
    ConnectionConfig::builder("west-east")
        .with_left(EndConfig::host(me))
        .with_right(EndConfig::host(him))
        .with_psk(b"benchmark secret".to_vec())
        .build()
        .unwrap()
}

/// Run one negotiation to completion; returns the datagrams exchanged
fn negotiate() -> usize {
    let west_addr: IpAddr = "192.0.2.1".parse().unwrap();
    let east_addr: IpAddr = "198.51.100.7".parse().unwrap();
    let now = Instant::now();
    let mut west = daemon(west_addr);
    let mut east = daemon(east_addr);
    for (d, cfg) in [
        (&mut west, connection(west_addr, east_addr)),
        (&mut east, connection(east_addr, west_addr)),
    ] {
        d.handle_whack(
            WhackMessage::new()
                .with(WhackCommand::AddConnection(cfg))
                .with(WhackCommand::Listen),
            now,
        );
    }
    west.handle_whack(
        WhackMessage::new().with(WhackCommand::Initiate {
            name: "west-east".into(),
            asynchronous: true,
        }),
        now,
    );

    let mut moved = 0;
    loop {
        let from_west = west.take_outgoing();
        let from_east = east.take_outgoing();
        if from_west.is_empty() && from_east.is_empty() {
            break;
        }
        moved += from_west.len() + from_east.len();
        for d in from_west {
            east.process_datagram(d.from, d.to, &d.data, now);
        }
        for d in from_east {
            west.process_datagram(d.from, d.to, &d.data, now);
        }
    }
    moved
}

/// Benchmark ISAKMP header parsing
fn bench_header_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("isakmp");
    let hdr = IsakmpHeader::new([0x11; 8], [0x22; 8], ExchangeType::IdProt, IsakmpFlags::default(), 0);
    let mut b = MessageBuilder::new(&hdr);
    b.add_payload(PayloadType::NONCE, &[0x33; 32]);
    b.add_payload(PayloadType::VID, &[0x44; 16]);
    let msg = b.finish();

    group.throughput(Throughput::Bytes(msg.len() as u64));
    group.bench_function("parse_header", |b| {
        b.iter(|| black_box(IsakmpHeader::from_bytes(black_box(&msg)).unwrap()))
    });
    group.finish();
}

/// Benchmark the PRF and Diffie-Hellman primitives
fn bench_key_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_exchange");

    group.bench_function("prf_hmac_sha1", |b| {
        let key = vec![0xAB; 20];
        let ni = vec![0x11; 16];
        let nr = vec![0x22; 16];
        b.iter(|| black_box(HashAlgorithm::Sha1.prf(&key, &[&ni, &nr])))
    });

    group.bench_function("modp1024_generate", |b| {
        b.iter(|| black_box(DhGroup::Modp1024.generate()))
    });

    group.bench_function("modp1024_shared_secret", |b| {
        let ours = DhGroup::Modp1024.generate();
        let theirs = DhGroup::Modp1024.generate();
        b.iter(|| black_box(ours.compute_shared_secret(theirs.public_key()).unwrap()))
    });

    group.finish();
}

/// Benchmark a complete negotiation
fn bench_full_negotiation(c: &mut Criterion) {
    let mut group = c.benchmark_group("negotiation");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    group.bench_function("main_and_quick_mode", |b| b.iter(|| black_box(negotiate())));

    group.finish();
}

criterion_group!(benches, bench_header_parse, bench_key_exchange, bench_full_negotiation);
criterion_main!(benches);
