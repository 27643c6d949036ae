// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel integration tests: real handshake over Unix sockets with fd
// passing, then ring and sync protocol behavior. Listener and connecter run
// in separate threads, as separate processes would.

use std::sync::Arc;
use std::thread;

use simbricks::channel::{Channel, ChannelParams, SyncMode};
use simbricks::connect::{establish, Endpoint};
use simbricks::proto::base::{MSG_TYPE_SYNC, MSG_TYPE_TERMINATE};
use simbricks::proto::net::{self, NetMsg};
use simbricks::ShmPool;

/// Network channel parameters with small rings to keep test pools small.
fn net_params(sock: &str, nentries: usize) -> ChannelParams {
    let mut params = net::default_params(sock);
    params.out_nentries = nentries;
    params.in_nentries = nentries;
    params
}

/// Run the handshake for one listener/connecter pair, each on its own thread.
fn run_pair(lp: ChannelParams, cp: ChannelParams, shm: String) -> (Channel, Channel) {
    let listener = thread::spawn(move || {
        let pool = Arc::new(ShmPool::create(&shm, lp.shm_size()).expect("pool"));
        let mut ep = Endpoint::new(lp, true).expect("listener endpoint");
        ep.listen(&pool).expect("listen");
        establish(&mut [&mut ep]).expect("listener establish");
        ep.into_channel().expect("listener channel")
    });

    let mut ep = Endpoint::new(cp, false).expect("connecter endpoint");
    ep.connect().expect("connect");
    establish(&mut [&mut ep]).expect("connecter establish");
    let conn = ep.into_channel().expect("connecter channel");

    (listener.join().expect("listener thread"), conn)
}

/// Paths for one test, kept alive with the TempDir.
fn paths(dir: &tempfile::TempDir) -> (String, String) {
    let sock = dir.path().join("sock").to_str().unwrap().to_string();
    let shm = dir.path().join("pool").to_str().unwrap().to_string();
    (sock, shm)
}

fn sync_pair(nentries: usize) -> (Channel, Channel, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, shm) = paths(&dir);
    let lp = net_params(&sock, nentries);
    let cp = net_params(&sock, nentries);
    let (l, c) = run_pair(lp, cp, shm);
    (l, c, dir)
}

// ---------------------------------------------------------------------------
// Establishment and negotiation
// ---------------------------------------------------------------------------

#[test]
fn sync_enabled_when_both_request() {
    let (l, c, _dir) = sync_pair(64);
    assert!(l.sync_enabled());
    assert!(c.sync_enabled());
}

#[test]
fn sync_disabled_when_one_declines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, shm) = paths(&dir);
    let lp = net_params(&sock, 64);
    let mut cp = net_params(&sock, 64);
    cp.sync_mode = SyncMode::Disabled;
    let (l, c) = run_pair(lp, cp, shm);
    assert!(!l.sync_enabled());
    assert!(!c.sync_enabled());
}

#[test]
fn sync_forced_over_declining_peer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, shm) = paths(&dir);
    let mut lp = net_params(&sock, 64);
    lp.sync_mode = SyncMode::Disabled;
    let mut cp = net_params(&sock, 64);
    cp.sync_mode = SyncMode::Required;
    cp.sync_force = true;
    let (l, c) = run_pair(lp, cp, shm);
    assert!(l.sync_enabled());
    assert!(c.sync_enabled());
}

#[test]
fn mismatched_upper_layer_protocol_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, shm) = paths(&dir);
    let lp = net_params(&sock, 64);
    let mut cp = net_params(&sock, 64);
    cp.upper_layer_proto = simbricks::proto::base::PROTO_ID_PCIE;

    let listener = thread::spawn(move || {
        let pool = Arc::new(ShmPool::create(&shm, lp.shm_size()).expect("pool"));
        let mut ep = Endpoint::new(lp, true).expect("listener endpoint");
        ep.listen(&pool).expect("listen");
        establish(&mut [&mut ep]).is_err()
    });

    let mut ep = Endpoint::new(cp, false).expect("connecter endpoint");
    ep.connect().expect("connect");
    assert!(establish(&mut [&mut ep]).is_err());
    drop(ep); // closes the socket, unblocking the listener

    assert!(listener.join().expect("listener thread"));
}

// ---------------------------------------------------------------------------
// Data transfer
// ---------------------------------------------------------------------------

#[test]
fn packet_roundtrip_byte_identical() {
    let (mut l, mut c, _dir) = sync_pair(64);

    let frame: Vec<u8> = (0..200).map(|i| (i % 251) as u8).collect();
    assert!(net::send_packet(&mut l.tx, 1_000, 3, &frame));

    let msg = c.rx.poll(u64::MAX).expect("frame readable");
    match NetMsg::decode(&msg).expect("decode") {
        NetMsg::Packet(head, data) => {
            assert_eq!(head.port, 3);
            assert_eq!(data, &frame[..]);
        }
        _ => panic!("expected packet"),
    }
    msg.done();
}

#[test]
fn bidirectional_transfer() {
    let (mut l, mut c, _dir) = sync_pair(64);

    assert!(net::send_packet(&mut l.tx, 0, 0, b"from-listener"));
    assert!(net::send_packet(&mut c.tx, 0, 0, b"from-connecter"));

    let msg = c.rx.poll(u64::MAX).expect("readable");
    match NetMsg::decode(&msg).expect("decode") {
        NetMsg::Packet(_, data) => assert_eq!(data, b"from-listener"),
        _ => panic!("expected packet"),
    }
    msg.done();

    let msg = l.rx.poll(u64::MAX).expect("readable");
    match NetMsg::decode(&msg).expect("decode") {
        NetMsg::Packet(_, data) => assert_eq!(data, b"from-connecter"),
        _ => panic!("expected packet"),
    }
    msg.done();
}

// ---------------------------------------------------------------------------
// Synchronization protocol
// ---------------------------------------------------------------------------

#[test]
fn no_future_delivery() {
    let (mut l, mut c, _dir) = sync_pair(64);

    // Default link latency is 500000 ps; a message sent at t=0 carries
    // timestamp 500000 and must stay invisible before then.
    assert!(net::send_packet(&mut l.tx, 0, 0, b"early"));
    assert!(c.rx.poll(0).is_none());
    assert!(c.rx.poll(499_999).is_none());

    let msg = c.rx.poll(500_000).expect("due message readable");
    assert!(msg.timestamp() <= 500_000);
    msg.done();
}

#[test]
fn sync_heartbeat_advances_peer_clock() {
    let (mut l, mut c, _dir) = sync_pair(64);

    assert!(l.tx.sync(0));
    // poll consumes the heartbeat silently but learns the peer's clock.
    assert!(c.rx.poll(u64::MAX).is_none());
    assert_eq!(c.rx.timestamp(), 500_000);

    // The peer goes quiet: the observed clock stops advancing.
    assert!(c.rx.poll(u64::MAX).is_none());
    assert_eq!(c.rx.timestamp(), 500_000);
}

#[test]
fn heartbeats_respect_the_interval() {
    let (mut l, mut c, _dir) = sync_pair(64);

    // First sync always fires.
    assert!(l.tx.sync(0));
    assert_eq!(l.tx.next_sync(), 500_000);

    // Not due yet: nothing is emitted.
    assert!(l.tx.sync(499_999));
    assert!(l.tx.sync(500_000)); // due: emits

    let first = c.rx.peek(u64::MAX).expect("first heartbeat");
    assert_eq!(first.ty(), MSG_TYPE_SYNC);
    assert_eq!(first.timestamp(), 500_000);
    first.done();

    let second = c.rx.peek(u64::MAX).expect("second heartbeat");
    assert_eq!(second.ty(), MSG_TYPE_SYNC);
    assert_eq!(second.timestamp(), 1_000_000);
    second.done();

    assert!(c.rx.peek(u64::MAX).is_none());
}

#[test]
fn timestamps_monotone_per_ring() {
    let (mut l, mut c, _dir) = sync_pair(64);

    for ts in [0u64, 10, 10, 250, 1_000] {
        assert!(net::send_packet(&mut l.tx, ts, 0, b"x"));
    }

    let mut last = 0;
    for _ in 0..5 {
        let msg = c.rx.poll(u64::MAX).expect("readable");
        assert!(msg.timestamp() >= last);
        last = msg.timestamp();
        msg.done();
    }
}

#[test]
fn terminate_is_delivered() {
    let (mut l, mut c, _dir) = sync_pair(64);

    assert!(l.tx.terminate(42));
    let msg = c.rx.poll(u64::MAX).expect("terminate readable");
    assert_eq!(msg.ty(), MSG_TYPE_TERMINATE);
    msg.done();
}

// ---------------------------------------------------------------------------
// Ring mechanics
// ---------------------------------------------------------------------------

#[test]
fn full_ring_rejects_alloc_until_consumed() {
    let (mut l, mut c, _dir) = sync_pair(4);

    for i in 0..4 {
        assert!(net::send_packet(&mut l.tx, i, 0, b"fill"), "send {i}");
    }
    // All four entries are consumer-owned now.
    assert!(l.tx.alloc(4).is_none());
    assert!(!net::send_packet(&mut l.tx, 4, 0, b"overflow"));

    // Consuming one entry frees exactly one slot.
    c.rx.poll(u64::MAX).expect("readable").done();
    assert!(net::send_packet(&mut l.tx, 5, 0, b"refill"));
    assert!(l.tx.alloc(6).is_none());
}

#[test]
fn peek_does_not_advance() {
    let (mut l, mut c, _dir) = sync_pair(64);

    assert!(net::send_packet(&mut l.tx, 7, 1, b"peeked"));

    let ts_first = {
        let msg = c.rx.peek(u64::MAX).expect("peek");
        let ts = msg.timestamp();
        // Dropping without done leaves the entry in place.
        drop(msg);
        ts
    };
    let msg = c.rx.peek(u64::MAX).expect("peek again");
    assert_eq!(msg.timestamp(), ts_first);
    msg.done();

    assert!(c.rx.poll(u64::MAX).is_none());
}

#[test]
fn consumed_entries_are_not_redelivered() {
    let (mut l, mut c, _dir) = sync_pair(64);

    assert!(net::send_packet(&mut l.tx, 0, 0, b"one"));
    assert!(net::send_packet(&mut l.tx, 0, 0, b"two"));

    c.rx.poll(u64::MAX).expect("one").done();
    c.rx.poll(u64::MAX).expect("two").done();
    assert!(c.rx.poll(u64::MAX).is_none());

    // The producer reuses the freed entries.
    assert!(net::send_packet(&mut l.tx, 1, 0, b"three"));
    let msg = c.rx.poll(u64::MAX).expect("three");
    match NetMsg::decode(&msg).expect("decode") {
        NetMsg::Packet(_, data) => assert_eq!(data, b"three"),
        _ => panic!("expected packet"),
    }
    msg.done();
}
