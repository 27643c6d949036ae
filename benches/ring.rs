// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring hot-path benchmarks.
//
// Run with:
//   cargo bench --bench ring
//
// Groups:
//   ring_transfer — alloc/fill/publish on one end, poll/done on the other,
//                   both ends mapped in this process
//
// Exercised at three frame sizes: 64, 256, and 1500 bytes.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use simbricks::channel::{Channel, SyncMode};
use simbricks::connect::{establish, Endpoint};
use simbricks::proto::net::{self, NetMsg};
use simbricks::ShmPool;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_256", 256), ("mtu_1500", 1500)];

/// Establish a network channel pair and keep both ends in this process.
fn channel_pair(dir: &tempfile::TempDir) -> (Channel, Channel) {
    let sock = dir.path().join("sock").to_str().unwrap().to_string();
    let shm = dir.path().join("pool").to_str().unwrap().to_string();

    let mut lp = net::default_params(&sock);
    lp.sync_mode = SyncMode::Disabled;
    let mut cp = lp.clone();
    cp.sync_mode = SyncMode::Disabled;

    let listener = thread::spawn(move || {
        let pool = Arc::new(ShmPool::create(&shm, lp.shm_size()).expect("pool"));
        let mut ep = Endpoint::new(lp, true).expect("endpoint");
        ep.listen(&pool).expect("listen");
        establish(&mut [&mut ep]).expect("establish");
        ep.into_channel().expect("channel")
    });

    let mut ep = Endpoint::new(cp, false).expect("endpoint");
    ep.connect().expect("connect");
    establish(&mut [&mut ep]).expect("establish");
    let conn = ep.into_channel().expect("channel");

    (listener.join().expect("listener"), conn)
}

fn bench_ring_transfer(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut producer, mut consumer) = channel_pair(&dir);

    let mut group = c.benchmark_group("ring_transfer");
    for &(label, size) in SIZES {
        let frame = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, _| {
            let mut ts = 0u64;
            b.iter(|| {
                ts += 1;
                assert!(net::send_packet(&mut producer.tx, ts, 0, &frame));
                let msg = consumer.rx.poll(u64::MAX).expect("readable");
                match NetMsg::decode(&msg).expect("decode") {
                    NetMsg::Packet(_, data) => {
                        black_box(data.len());
                    }
                    _ => unreachable!(),
                }
                msg.done();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ring_transfer);
criterion_main!(benches);
