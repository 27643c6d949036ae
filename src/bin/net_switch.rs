// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synchronized L2 learning switch.
//
// Each port is one network channel (connecting with -s, listening with -h).
// Frames are forwarded by destination MAC; unknown and broadcast
// destinations flood every port except the ingress. Source MACs are learned
// per port. SIGUSR2 opens a statistics window reported at exit.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info, warn};

use simbricks::channel::{RxQueue, SyncMode, TxQueue};
use simbricks::connect::{establish, Endpoint};
use simbricks::proto::base::intro_bytes;
use simbricks::proto::net::{self, NetIntro, NetMsg};
use simbricks::signals;
use simbricks::ShmPool;

#[derive(Parser)]
#[command(name = "net_switch", disable_help_flag = true)]
#[command(about = "Synchronized Ethernet learning switch")]
struct Cli {
    /// Connect a port to a listening peer's socket (repeatable)
    #[arg(short = 's', value_name = "SOCKET")]
    connect: Vec<String>,

    /// Listen for a peer on a socket (repeatable)
    #[arg(short = 'h', value_name = "SOCKET")]
    listen: Vec<String>,

    /// Sync period in nanoseconds
    #[arg(short = 'S', default_value_t = 500)]
    sync_period: u64,

    /// Ethernet latency in nanoseconds
    #[arg(short = 'E', default_value_t = 500)]
    eth_latency: u64,

    /// Disable synchronization
    #[arg(short = 'u')]
    unsync: bool,

    /// Shared memory pool path for listening ports
    #[arg(long, default_value = "./net_switch.shm")]
    pool: String,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

// ---------------------------------------------------------------------------
// MAC learning table
// ---------------------------------------------------------------------------

type Mac = [u8; 6];

const BCAST: Mac = [0xff; 6];

struct MacTable {
    map: HashMap<Mac, usize>,
}

impl MacTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Learn the source address of a frame seen on `port`.
    fn learn(&mut self, src: Mac, port: usize) {
        if src != BCAST {
            self.map.insert(src, port);
        }
    }

    /// Egress port for a destination, if known. Broadcast is never known.
    fn lookup(&self, dst: &Mac) -> Option<usize> {
        self.map.get(dst).copied()
    }
}

// ---------------------------------------------------------------------------
// Switching
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Stats {
    poll_total: u64,
    poll_suc: u64,
    // Window counters, accumulated only after SIGUSR2.
    w_poll_total: u64,
    w_poll_suc: u64,
}

struct Switch {
    txs: Vec<TxQueue>,
    rxs: Vec<RxQueue>,
    mac_table: MacTable,
    cur_ts: u64,
    stats: Stats,
}

impl Switch {
    /// Poll one port and forward at most one frame.
    fn switch_pkt(&mut self, iport: usize) -> bool {
        self.stats.poll_total += 1;
        if signals::stats_enabled() {
            self.stats.w_poll_total += 1;
        }

        let Some(msg) = self.rxs[iport].poll(self.cur_ts) else {
            return false;
        };
        self.stats.poll_suc += 1;
        if signals::stats_enabled() {
            self.stats.w_poll_suc += 1;
        }

        match NetMsg::decode(&msg) {
            Some(NetMsg::Packet(_, data)) if data.len() >= 12 => {
                let mut dst = [0u8; 6];
                let mut src = [0u8; 6];
                dst.copy_from_slice(&data[0..6]);
                src.copy_from_slice(&data[6..12]);

                self.mac_table.learn(src, iport);

                match self.mac_table.lookup(&dst) {
                    Some(eport) => {
                        forward_pkt(&mut self.txs[eport], self.cur_ts, data);
                    }
                    None => {
                        for eport in 0..self.txs.len() {
                            if eport != iport {
                                forward_pkt(&mut self.txs[eport], self.cur_ts, data);
                            }
                        }
                    }
                }
            }
            Some(NetMsg::Packet(..)) => {
                warn!("switch_pkt: runt frame on port {iport}");
            }
            Some(NetMsg::Terminate) => {
                debug!("port {iport}: peer terminated");
            }
            None => {
                warn!("switch_pkt: unsupported type={}", msg.ty());
            }
        }
        msg.done();
        true
    }

    fn run(&mut self) {
        info!("start polling");
        while !signals::exiting() {
            if signals::take_time_report() {
                info!("main_time = {}", self.cur_ts);
            }
            for tx in self.txs.iter_mut() {
                while !tx.sync(self.cur_ts) {
                    warn!("sync failed (t={})", self.cur_ts);
                }
            }

            let mut min_ts;
            loop {
                min_ts = u64::MAX;
                for port in 0..self.txs.len() {
                    self.switch_pkt(port);
                    if self.rxs[port].sync_enabled() {
                        let ts = self.rxs[port]
                            .timestamp()
                            .min(self.txs[port].next_sync());
                        min_ts = min_ts.min(ts);
                    }
                }
                if signals::exiting() || min_ts > self.cur_ts {
                    break;
                }
            }

            if min_ts < u64::MAX && min_ts > self.cur_ts {
                self.cur_ts = min_ts;
            }
        }

        let s = &self.stats;
        info!(
            "poll_total: {} poll_suc: {} suc_rate: {:.6}",
            s.poll_total,
            s.poll_suc,
            s.poll_suc as f64 / s.poll_total.max(1) as f64
        );
        info!(
            "window poll_total: {} poll_suc: {} suc_rate: {:.6}",
            s.w_poll_total,
            s.w_poll_suc,
            s.w_poll_suc as f64 / s.w_poll_total.max(1) as f64
        );
    }
}

/// Copy one frame onto an egress port; drop it when the ring is full.
fn forward_pkt(tx: &mut TxQueue, ts: u64, data: &[u8]) {
    if !net::send_packet(tx, ts, 0, data) {
        warn!("forward_pkt: dropping packet");
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.connect.is_empty() && cli.listen.is_empty() {
        eprintln!(
            "Usage: net_switch [-S SYNC-PERIOD] [-E ETH-LATENCY] [-u] \
             -s SOCKET-A [-s SOCKET-B ...] [-h LISTEN-SOCKET ...]"
        );
        std::process::exit(1);
    }

    let sync_interval = cli.sync_period * 1000;
    let link_latency = cli.eth_latency * 1000;
    let sync_mode = if cli.unsync {
        SyncMode::Disabled
    } else {
        SyncMode::Optional
    };

    // (listen?, socket) per port, listeners first so the pool is carved
    // before any connect round-trips.
    let mut port_specs: Vec<(bool, &str)> = Vec::new();
    for sock in &cli.listen {
        port_specs.push((true, sock));
    }
    for sock in &cli.connect {
        port_specs.push((false, sock));
    }

    let mut endpoints = Vec::new();
    let mut pool_size = 0;
    for (listen, sock) in &port_specs {
        let mut params = net::default_params(sock);
        params.sync_mode = sync_mode;
        params.sync_interval = sync_interval;
        params.link_latency = link_latency;
        if *listen {
            pool_size += params.shm_size();
        }
        let mut ep = match Endpoint::new(params, *listen) {
            Ok(ep) => ep,
            Err(e) => {
                error!("port setup failed for {sock}: {e}");
                std::process::exit(1);
            }
        };
        ep.set_intro(intro_bytes(&NetIntro::default()).to_vec());
        ep.expect_peer_intro_len(std::mem::size_of::<NetIntro>());
        endpoints.push(ep);
    }

    let pool = if pool_size > 0 {
        match ShmPool::create(&cli.pool, pool_size) {
            Ok(p) => Some(Arc::new(p)),
            Err(e) => {
                error!("pool creation failed at {}: {e}", cli.pool);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    for (ep, (listen, sock)) in endpoints.iter_mut().zip(port_specs.iter()) {
        info!(
            "{} port: {sock}",
            if *listen { "listening" } else { "connecting" }
        );
        let res = if *listen {
            ep.listen(pool.as_ref().unwrap())
        } else {
            ep.connect()
        };
        if let Err(e) = res {
            error!("port setup failed for {sock}: {e}");
            std::process::exit(1);
        }
    }

    {
        let mut refs: Vec<&mut Endpoint> = endpoints.iter_mut().collect();
        if let Err(e) = establish(&mut refs) {
            error!("establishing ports failed: {e}");
            std::process::exit(1);
        }
    }

    let mut txs = Vec::new();
    let mut rxs = Vec::new();
    for ep in endpoints {
        match ep.into_channel() {
            Ok(ch) => {
                txs.push(ch.tx);
                rxs.push(ch.rx);
            }
            Err(e) => {
                error!("channel setup failed: {e}");
                std::process::exit(1);
            }
        }
    }

    signals::install();
    Switch {
        txs,
        rxs,
        mac_table: MacTable::new(),
        cur_ts: 0,
        stats: Stats::default(),
    }
    .run();
}

#[cfg(test)]
mod tests {
    use super::{Mac, MacTable, BCAST};

    #[test]
    fn learn_and_lookup() {
        let mut table = MacTable::new();
        let a: Mac = [0x02, 0, 0, 0, 0, 0xaa];
        assert_eq!(table.lookup(&a), None);

        table.learn(a, 3);
        assert_eq!(table.lookup(&a), Some(3));

        // Moving to another port relearns.
        table.learn(a, 1);
        assert_eq!(table.lookup(&a), Some(1));
    }

    #[test]
    fn broadcast_is_never_learned() {
        let mut table = MacTable::new();
        table.learn(BCAST, 0);
        assert_eq!(table.lookup(&BCAST), None);
    }
}
