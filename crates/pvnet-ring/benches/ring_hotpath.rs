//! Hot-path benchmarks for pvnet-ring.
//!
//! Measures the per-packet cost of:
//! - Codec encode (inline and by reference) and decode
//! - Descriptor acquire/release
//! - RSS queue selection and Toeplitz hashing
//! - A full enqueue → submit → completion cycle against the loopback remote
//!
//! Run with: cargo bench --package pvnet-ring

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pvnet_ring::codec::Codec;
use pvnet_ring::config::DeviceConfig;
use pvnet_ring::loopback::{LoopbackConfig, LoopbackTransport};
use pvnet_ring::packet::{HashType, L4Protocol, PacketDescriptor, VlanTag};
use pvnet_ring::pool::DescriptorPool;
use pvnet_ring::rss::{FlowTuple, RssTable, SharedRssTable, Toeplitz};
use pvnet_ring::wire::PayloadMode;
use pvnet_ring::ChannelManager;

fn packet(len: usize) -> PacketDescriptor {
    PacketDescriptor::new(Bytes::from(vec![0xAB; len]))
        .with_vlan(VlanTag::from_tci(0x602A))
        .with_flow_hash(0x1234_5678, HashType::TcpIpv4)
}

// ─── Codec ───────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let codec = Codec::default();
    let mut group = c.benchmark_group("codec_encode");
    for (name, len, mode) in [
        ("inline_64B", 64, PayloadMode::Inline),
        ("inline_1500B", 1500, PayloadMode::Inline),
        ("reference_1500B", 1500, PayloadMode::Reference),
        ("reference_9000B", 9000, PayloadMode::Reference),
    ] {
        let pkt = packet(len);
        let mut scratch = BytesMut::with_capacity(2048);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(name, |b| {
            b.iter(|| black_box(codec.encode(black_box(&pkt), mode, &mut scratch)));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let codec = Codec::default();
    let mut scratch = BytesMut::new();
    let raw = codec.encode(&packet(1500), PayloadMode::Inline, &mut scratch).head;
    c.bench_function("codec_decode_1500B", |b| {
        b.iter(|| black_box(codec.decode(black_box(&raw))));
    });
}

// ─── Pool ────────────────────────────────────────────────────────────────

fn bench_pool(c: &mut Criterion) {
    let pool = DescriptorPool::new(512);
    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            if let Some(h) = pool.acquire() {
                black_box(pool.release(h));
            }
        });
    });
}

// ─── RSS ─────────────────────────────────────────────────────────────────

fn bench_rss(c: &mut Criterion) {
    let shared = SharedRssTable::new(RssTable::new(256, 8));
    c.bench_function("rss_select", |b| {
        let mut h = 0u32;
        b.iter(|| {
            h = h.wrapping_add(0x9E37_79B9);
            black_box(shared.select(h))
        });
    });

    let toeplitz = Toeplitz::default();
    let tuple = FlowTuple::v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
        .with_ports(L4Protocol::Tcp, 40000, 443);
    c.bench_function("toeplitz_tcp4", |b| {
        b.iter(|| black_box(toeplitz.hash_flow(black_box(&tuple))));
    });
}

// ─── Full cycle ──────────────────────────────────────────────────────────

fn bench_cycle(c: &mut Criterion) {
    let remote = LoopbackConfig {
        record_frames: false,
        ..Default::default()
    };
    let transport = Arc::new(LoopbackTransport::new(remote));
    let (sink, _out) = crossbeam_channel::unbounded::<PacketDescriptor>();
    let mut mgr =
        ChannelManager::new(transport, DeviceConfig::default(), Arc::new(sink)).unwrap();
    mgr.attach_all(1).unwrap();

    let mut group = c.benchmark_group("tx_cycle");
    for len in [64usize, 1500] {
        let pkt = packet(len);
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{len}B"), |b| {
            b.iter(|| {
                let _ = mgr.enqueue(0, pkt.clone());
                black_box(mgr.poll(4));
            });
        });
    }
    group.finish();
    let _ = mgr.shutdown();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_pool,
    bench_rss,
    bench_cycle,
);
criterion_main!(benches);
