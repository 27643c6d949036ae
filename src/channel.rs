// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Base channel: a pair of lock-free single-producer/single-consumer rings in
// shared memory, plus the per-channel timestamp synchronization protocol.
//
// Each ring entry is published by flipping the ownership bit in its last
// header byte with a release store; the consumer observes it with an acquire
// load. No other byte of an entry is ever accessed concurrently, and each
// ring end keeps its position private — there is no shared index.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::proto::base::{
    MsgHead, MSG_HEADER_LEN, MSG_OWN_CONSUMER, MSG_OWN_MASK, MSG_OWN_PRODUCER, MSG_TIMESTAMP_OFF,
    MSG_TYPE_MASK, MSG_TYPE_SYNC, MSG_TYPE_TERMINATE,
};
use crate::shm::ShmPool;

/// Synchronization negotiation mode for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Never synchronize, regardless of the peer's wishes.
    Disabled,
    /// Synchronize if the peer also requests it.
    Optional,
    /// Request synchronization (the adapter-URL `sync=true` setting).
    Required,
}

/// Synchronization protocol selector.
///
/// Only the per-channel protocol is implemented; the legacy barrier mode is
/// kept in the interface for compatibility and rejected at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProtocol {
    PerChannel,
    Barrier,
}

/// Per-endpoint channel parameters, fixed at handshake time.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    /// Unix socket path used for the handshake.
    pub sock_path: String,
    pub sync_mode: SyncMode,
    /// Force synchronization on even if the peer does not request it.
    pub sync_force: bool,
    pub sync_protocol: SyncProtocol,
    /// Added to every outgoing timestamp (picoseconds).
    pub link_latency: u64,
    /// Maximum virtual-time gap between outgoing messages when synchronized
    /// (picoseconds).
    pub sync_interval: u64,
    /// Entry stride of the outgoing ring, header included.
    pub out_entry_len: usize,
    pub out_nentries: usize,
    /// Entry stride of the incoming ring, header included.
    pub in_entry_len: usize,
    pub in_nentries: usize,
    /// Upper-layer protocol id announced in the intro.
    pub upper_layer_proto: u64,
}

/// Default link latency and sync interval: 500 ns in picoseconds.
pub const DEFAULT_LINK_LATENCY: u64 = 500_000;
pub const DEFAULT_SYNC_INTERVAL: u64 = 500_000;

/// Default entry stride: 4 KiB payload plus the 64-byte header.
pub const DEFAULT_ENTRY_LEN: usize = 4096 + MSG_HEADER_LEN;
pub const DEFAULT_NENTRIES: usize = 1024;

impl ChannelParams {
    pub fn new(sock_path: &str, upper_layer_proto: u64) -> Self {
        Self {
            sock_path: sock_path.to_string(),
            sync_mode: SyncMode::Optional,
            sync_force: false,
            sync_protocol: SyncProtocol::PerChannel,
            link_latency: DEFAULT_LINK_LATENCY,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            out_entry_len: DEFAULT_ENTRY_LEN,
            out_nentries: DEFAULT_NENTRIES,
            in_entry_len: DEFAULT_ENTRY_LEN,
            in_nentries: DEFAULT_NENTRIES,
            upper_layer_proto,
        }
    }

    /// Bytes of shared memory both rings of this channel occupy.
    pub fn shm_size(&self) -> usize {
        self.out_entry_len * self.out_nentries + self.in_entry_len * self.in_nentries
    }
}

// ---------------------------------------------------------------------------
// Ring — one direction's region in the pool plus this end's private cursor
// ---------------------------------------------------------------------------

struct Ring {
    base: *mut u8,
    entry_len: usize,
    nentries: usize,
    pos: usize,
}

impl Ring {
    fn entry_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(self.pos * self.entry_len) }
    }

    /// `own_type` byte of the current entry, viewed as an atomic.
    fn own_type(&self) -> &AtomicU8 {
        unsafe { &*(self.entry_ptr().add(MSG_HEADER_LEN - 1) as *const AtomicU8) }
    }

    fn advance(&mut self) {
        self.pos = (self.pos + 1) % self.nentries;
    }
}

fn read_timestamp(entry: *const u8) -> u64 {
    let mut buf = [0u8; 8];
    unsafe {
        std::ptr::copy_nonoverlapping(entry.add(MSG_TIMESTAMP_OFF), buf.as_mut_ptr(), 8);
    }
    u64::from_le_bytes(buf)
}

fn write_timestamp(entry: *mut u8, ts: u64) {
    let buf = ts.to_le_bytes();
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), entry.add(MSG_TIMESTAMP_OFF), 8);
    }
}

// ---------------------------------------------------------------------------
// TxQueue — producer end of the outgoing ring
// ---------------------------------------------------------------------------

/// Producer half of a channel.
pub struct TxQueue {
    ring: Ring,
    sync_enabled: bool,
    sync_interval: u64,
    link_latency: u64,
    /// Producer timestamp (before latency) of the last published message.
    last_tx_ts: u64,
    _pool: Arc<ShmPool>,
}

// Safety: strictly single-producer; moving the half to another thread is
// fine, sharing it is not (no &self mutation).
unsafe impl Send for TxQueue {}

impl TxQueue {
    /// Reserve the next outgoing entry if it is free.
    ///
    /// The entry's timestamp is stamped with `ts` plus the link latency.
    /// Returns `None` when the ring is full; the caller decides whether to
    /// spin (sync heartbeats) or drop (data).
    pub fn alloc(&mut self, ts: u64) -> Option<OutMsg<'_>> {
        let own = self.ring.own_type();
        if own.load(Ordering::Acquire) & MSG_OWN_MASK != MSG_OWN_PRODUCER {
            return None;
        }
        let entry = self.ring.entry_ptr();
        write_timestamp(entry, ts + self.link_latency);
        Some(OutMsg {
            entry,
            ts,
            q: self,
        })
    }

    /// Emit a sync heartbeat if one is due at `ts`.
    ///
    /// Returns `false` only when a heartbeat was due and the ring was full;
    /// correctness-critical callers spin until it succeeds.
    pub fn sync(&mut self, ts: u64) -> bool {
        if !self.sync_enabled {
            return true;
        }
        if self.last_tx_ts != 0 && ts - self.last_tx_ts < self.sync_interval {
            return true;
        }
        match self.alloc(ts) {
            Some(msg) => {
                msg.send(MSG_TYPE_SYNC);
                true
            }
            None => false,
        }
    }

    /// Deadline by which the next sync heartbeat must be emitted.
    pub fn next_sync(&self) -> u64 {
        self.last_tx_ts + self.sync_interval
    }

    /// Publish a termination notice. Best-effort: returns `false` when the
    /// ring is full.
    pub fn terminate(&mut self, ts: u64) -> bool {
        match self.alloc(ts) {
            Some(msg) => {
                msg.send(MSG_TYPE_TERMINATE);
                true
            }
            None => false,
        }
    }

    /// Entry stride of the outgoing ring (header included).
    pub fn entry_len(&self) -> usize {
        self.ring.entry_len
    }

    /// Payload bytes available per outgoing message.
    pub fn payload_capacity(&self) -> usize {
        self.ring.entry_len - MSG_HEADER_LEN
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }
}

/// A reserved outgoing entry. Fill head and payload, then [`send`](Self::send).
///
/// Dropping without sending leaves the entry unpublished; the next `alloc`
/// reuses it.
pub struct OutMsg<'q> {
    q: &'q mut TxQueue,
    entry: *mut u8,
    ts: u64,
}

impl OutMsg<'_> {
    /// Typed view of the 64-byte header.
    pub fn head_mut<T: MsgHead>(&mut self) -> &mut T {
        debug_assert!(self.entry as usize % std::mem::align_of::<T>() == 0);
        unsafe { &mut *(self.entry as *mut T) }
    }

    /// Payload region after the header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.entry.add(MSG_HEADER_LEN),
                self.q.ring.entry_len - MSG_HEADER_LEN,
            )
        }
    }

    pub fn payload_capacity(&self) -> usize {
        self.q.ring.entry_len - MSG_HEADER_LEN
    }

    /// Publish the entry with the given type tag.
    ///
    /// This is the release store that hands the entry to the consumer; head
    /// and payload must be complete before calling.
    pub fn send(self, msg_type: u8) {
        let own = self.q.ring.own_type();
        own.store(
            (msg_type & MSG_TYPE_MASK) | MSG_OWN_CONSUMER,
            Ordering::Release,
        );
        self.q.last_tx_ts = self.ts;
        self.q.ring.advance();
    }
}

// ---------------------------------------------------------------------------
// RxQueue — consumer end of the incoming ring
// ---------------------------------------------------------------------------

/// Consumer half of a channel.
pub struct RxQueue {
    ring: Ring,
    sync_enabled: bool,
    /// Timestamp of the newest filled entry observed; a lower bound on the
    /// peer's virtual clock.
    last_rx_ts: u64,
    _pool: Arc<ShmPool>,
}

unsafe impl Send for RxQueue {}

impl RxQueue {
    /// Return the next incoming entry without consuming sync heartbeats.
    ///
    /// Yields `None` when the entry is empty, or (on synchronized channels)
    /// when its timestamp is still in the future of `ts`. Seeing a filled
    /// entry updates [`timestamp`](Self::timestamp) either way.
    pub fn peek(&mut self, ts: u64) -> Option<InMsg<'_>> {
        if !self.ready(ts) {
            return None;
        }
        let entry = self.ring.entry_ptr();
        Some(InMsg { entry, q: self })
    }

    /// Like [`peek`](Self::peek), but discards sync heartbeats in place and
    /// returns the first readable non-sync message.
    pub fn poll(&mut self, ts: u64) -> Option<InMsg<'_>> {
        loop {
            if !self.ready(ts) {
                return None;
            }
            let entry = self.ring.entry_ptr();
            let own = self.ring.own_type();
            let ty = own.load(Ordering::Relaxed) & MSG_TYPE_MASK;
            if ty == MSG_TYPE_SYNC {
                own.store(ty | MSG_OWN_PRODUCER, Ordering::Release);
                self.ring.advance();
                continue;
            }
            return Some(InMsg { entry, q: self });
        }
    }

    /// The peer's virtual-time lower bound: the timestamp of the newest
    /// filled entry seen on this ring.
    pub fn timestamp(&self) -> u64 {
        self.last_rx_ts
    }

    pub fn entry_len(&self) -> usize {
        self.ring.entry_len
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Whether the current entry is filled and admissible at local time `ts`.
    fn ready(&mut self, ts: u64) -> bool {
        let own = self.ring.own_type();
        if own.load(Ordering::Acquire) & MSG_OWN_MASK != MSG_OWN_CONSUMER {
            return false;
        }
        let msg_ts = read_timestamp(self.ring.entry_ptr());
        self.last_rx_ts = msg_ts;
        // Future messages stay invisible until local time catches up. This
        // admission rule is what keeps a fast peer from delivering events
        // ahead of the consumer's clock.
        if self.sync_enabled && msg_ts > ts {
            return false;
        }
        true
    }
}

/// A readable incoming entry. Read head and payload, then [`done`](Self::done).
pub struct InMsg<'q> {
    q: &'q mut RxQueue,
    entry: *mut u8,
}

impl InMsg<'_> {
    /// The message type tag (low 7 bits of `own_type`).
    pub fn ty(&self) -> u8 {
        self.q.ring.own_type().load(Ordering::Relaxed) & MSG_TYPE_MASK
    }

    /// The producer-stamped timestamp (link latency included).
    pub fn timestamp(&self) -> u64 {
        read_timestamp(self.entry)
    }

    /// Typed view of the 64-byte header.
    pub fn head<T: MsgHead>(&self) -> &T {
        debug_assert!(self.entry as usize % std::mem::align_of::<T>() == 0);
        unsafe { &*(self.entry as *const T) }
    }

    /// Payload region after the header.
    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.entry.add(MSG_HEADER_LEN),
                self.q.ring.entry_len - MSG_HEADER_LEN,
            )
        }
    }

    /// Hand the entry back to the producer and advance the consumer cursor.
    pub fn done(self) {
        let own = self.q.ring.own_type();
        let ty = own.load(Ordering::Relaxed) & MSG_TYPE_MASK;
        own.store(ty | MSG_OWN_PRODUCER, Ordering::Release);
        self.q.ring.advance();
    }
}

// ---------------------------------------------------------------------------
// Channel — both halves
// ---------------------------------------------------------------------------

/// Geometry of one ring inside a pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingGeom {
    pub offset: usize,
    pub entry_len: usize,
    pub nentries: usize,
}

/// One established connection to a peer: an outgoing and an incoming ring.
pub struct Channel {
    pub tx: TxQueue,
    pub rx: RxQueue,
}

impl Channel {
    pub(crate) fn new(
        pool: Arc<ShmPool>,
        out: RingGeom,
        inc: RingGeom,
        sync_enabled: bool,
        sync_interval: u64,
        link_latency: u64,
    ) -> Self {
        let tx = TxQueue {
            ring: Ring {
                base: pool.ptr_at(out.offset),
                entry_len: out.entry_len,
                nentries: out.nentries,
                pos: 0,
            },
            sync_enabled,
            sync_interval,
            link_latency,
            last_tx_ts: 0,
            _pool: Arc::clone(&pool),
        };
        let rx = RxQueue {
            ring: Ring {
                base: pool.ptr_at(inc.offset),
                entry_len: inc.entry_len,
                nentries: inc.nentries,
                pos: 0,
            },
            sync_enabled,
            last_rx_ts: 0,
            _pool: pool,
        };
        Self { tx, rx }
    }

    pub fn sync_enabled(&self) -> bool {
        self.tx.sync_enabled
    }
}
