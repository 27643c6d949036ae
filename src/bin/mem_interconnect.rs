// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory interconnect: routes host reads and writes to memory devices by
// address range.
//
// Ports are adapter URLs: -h adds a host-facing port, -d NAME=URL adds a
// device-facing port. Routes (-m vstart,vend,pstart,devname) translate a
// host address window onto a device-local base. Completions travel back with
// the host's original request id.

use std::collections::HashMap;

use clap::Parser;
use log::{error, info, warn};

use simbricks::channel::{RxQueue, TxQueue};
use simbricks::parser::{establish_with_urls, UrlInterface};
use simbricks::proto::base::intro_bytes;
use simbricks::proto::mem::{self, MemH2M, MemIntro, MemM2H};
use simbricks::signals;
use slab::Slab;

#[derive(Parser)]
#[command(name = "mem_interconnect", disable_help_flag = true)]
#[command(about = "Memory interconnect between hosts and memory devices")]
struct Cli {
    /// Shared memory pool path for listening ports
    #[arg(short = 'p', value_name = "POOL-PATH", required = true)]
    pool: String,

    /// Add a device port: NAME=URL (repeatable)
    #[arg(short = 'd', value_name = "NAME=URL")]
    device: Vec<String>,

    /// Add a host port: URL (repeatable)
    #[arg(short = 'h', value_name = "URL")]
    host: Vec<String>,

    /// Add a route: vstart,vend,pstart,devname (repeatable)
    #[arg(short = 'm', value_name = "ROUTE")]
    route: Vec<String>,

    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    vaddr_start: u64,
    vaddr_end: u64,
    phys_start: u64,
    dev: usize,
}

struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Find the device serving `addr` and remap into its local space.
    /// Accesses straddling the end of a window are unsupported.
    fn lookup(&self, addr: u64, len: u64) -> Option<(usize, u64)> {
        for entry in &self.entries {
            if entry.vaddr_start <= addr && addr < entry.vaddr_end {
                if addr + len > entry.vaddr_end {
                    error!(
                        "lookup: access {addr:#x}+{len:#x} crosses the end of its window"
                    );
                    return None;
                }
                return Some((entry.dev, entry.phys_start + (addr - entry.vaddr_start)));
            }
        }
        None
    }
}

fn parse_route(arg: &str, devices: &HashMap<String, usize>) -> Option<RouteEntry> {
    let mut fields = arg.split(',');
    let vaddr_start = parse_u64(fields.next()?)?;
    let vaddr_end = parse_u64(fields.next()?)?;
    let phys_start = parse_u64(fields.next()?)?;
    let dev = *devices.get(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some(RouteEntry {
        vaddr_start,
        vaddr_end,
        phys_start,
        dev,
    })
}

/// Decimal or 0x-prefixed hex.
fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Interconnect
// ---------------------------------------------------------------------------

/// A host request forwarded to a device and awaiting its completion.
struct Pending {
    host: usize,
    req_id: u64,
    len: usize,
}

enum PortKind {
    Host,
    Device,
}

struct Interconnect {
    kinds: Vec<PortKind>,
    txs: Vec<TxQueue>,
    rxs: Vec<RxQueue>,
    routes: RouteTable,
    pending: Slab<Pending>,
    cur_ts: u64,
}

impl Interconnect {
    /// Handle at most one message on one port.
    fn poll_port(&mut self, port: usize) -> bool {
        match self.kinds[port] {
            PortKind::Host => self.poll_host(port),
            PortKind::Device => self.poll_device(port),
        }
    }

    fn poll_host(&mut self, port: usize) -> bool {
        let Some(msg) = self.rxs[port].poll(self.cur_ts) else {
            return false;
        };
        match MemH2M::decode(&msg) {
            Some(MemH2M::Read(read)) => {
                match self.routes.lookup(read.addr, read.len as u64) {
                    Some((dev, addr)) => {
                        let key = self.pending.insert(Pending {
                            host: port,
                            req_id: read.req_id,
                            len: read.len as usize,
                        });
                        while !mem::h2m_read(
                            &mut self.txs[dev],
                            self.cur_ts,
                            key as u64,
                            read.as_id,
                            addr,
                            read.len,
                        ) {
                            warn!("device read: no entry available");
                        }
                    }
                    None => warn!("read at {:#x}: no matching device", read.addr),
                }
            }
            Some(MemH2M::Write(write, data)) => {
                match self.routes.lookup(write.addr, write.len as u64) {
                    Some((dev, addr)) => {
                        let key = self.pending.insert(Pending {
                            host: port,
                            req_id: write.req_id,
                            len: write.len as usize,
                        });
                        while !mem::h2m_write(
                            &mut self.txs[dev],
                            self.cur_ts,
                            key as u64,
                            write.as_id,
                            addr,
                            data,
                            false,
                        ) {
                            warn!("device write: no entry available");
                        }
                    }
                    None => warn!("write at {:#x}: no matching device", write.addr),
                }
            }
            Some(MemH2M::WritePosted(write, data)) => {
                // Posted writes complete nowhere; no pending entry.
                match self.routes.lookup(write.addr, write.len as u64) {
                    Some((dev, addr)) => {
                        while !mem::h2m_write(
                            &mut self.txs[dev],
                            self.cur_ts,
                            0,
                            write.as_id,
                            addr,
                            data,
                            true,
                        ) {
                            warn!("device posted write: no entry available");
                        }
                    }
                    None => warn!("posted write at {:#x}: no matching device", write.addr),
                }
            }
            Some(MemH2M::Terminate) => {
                info!("host port {port}: peer terminated");
            }
            None => warn!("poll_host: unsupported type={}", msg.ty()),
        }
        msg.done();
        true
    }

    fn poll_device(&mut self, port: usize) -> bool {
        let Some(msg) = self.rxs[port].poll(self.cur_ts) else {
            return false;
        };
        match MemM2H::decode(&msg) {
            Some(MemM2H::Readcomp(rc, data)) => {
                match self.pending.try_remove(rc.req_id as usize) {
                    Some(p) => {
                        while !mem::m2h_readcomp(
                            &mut self.txs[p.host],
                            self.cur_ts,
                            p.req_id,
                            &data[..p.len],
                        ) {
                            warn!("host readcomp: no entry available");
                        }
                    }
                    None => warn!("readcomp for unknown req_id {}", rc.req_id),
                }
            }
            Some(MemM2H::Writecomp(wc)) => {
                match self.pending.try_remove(wc.req_id as usize) {
                    Some(p) => {
                        while !mem::m2h_writecomp(&mut self.txs[p.host], self.cur_ts, p.req_id) {
                            warn!("host writecomp: no entry available");
                        }
                    }
                    None => warn!("writecomp for unknown req_id {}", wc.req_id),
                }
            }
            Some(MemM2H::Terminate) => {
                info!("device port {port}: peer terminated");
            }
            None => warn!("poll_device: unsupported type={}", msg.ty()),
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
                    self.poll_port(port);
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
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.device.is_empty() || cli.route.is_empty() {
        eprintln!(
            "Usage: mem_interconnect -p POOL-PATH [-d DEV-NAME=DEV-URL ...] \
             [-h HOST-URL ...] [-m ROUTE ...]"
        );
        std::process::exit(1);
    }

    // Ports: devices first, then hosts; routes refer to devices by name.
    let mut urls: Vec<String> = Vec::new();
    let mut kinds: Vec<PortKind> = Vec::new();
    let mut devices: HashMap<String, usize> = HashMap::new();

    for arg in &cli.device {
        let Some((name, url)) = arg.split_once('=') else {
            error!("no equal sign in device argument: {arg}");
            std::process::exit(1);
        };
        devices.insert(name.to_string(), urls.len());
        urls.push(url.to_string());
        kinds.push(PortKind::Device);
    }
    for url in &cli.host {
        urls.push(url.clone());
        kinds.push(PortKind::Host);
    }

    let mut routes = Vec::new();
    for arg in &cli.route {
        match parse_route(arg, &devices) {
            Some(entry) => routes.push(entry),
            None => {
                error!("error parsing route config: {arg}");
                std::process::exit(1);
            }
        }
    }

    let interfaces = urls
        .iter()
        .map(|_| UrlInterface {
            base: mem::default_params(""),
            tx_intro: intro_bytes(&MemIntro::default()).to_vec(),
            peer_intro_len: std::mem::size_of::<MemIntro>(),
        })
        .collect();

    info!("connecting all {} ports...", urls.len());
    let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let established = match establish_with_urls(&url_refs, interfaces, &cli.pool) {
        Ok(chans) => chans,
        Err(e) => {
            error!("establishing ports failed: {e}");
            std::process::exit(1);
        }
    };
    info!("connected");

    let mut txs = Vec::new();
    let mut rxs = Vec::new();
    for est in established {
        txs.push(est.channel.tx);
        rxs.push(est.channel.rx);
    }

    signals::install();
    Interconnect {
        kinds,
        txs,
        rxs,
        routes: RouteTable { entries: routes },
        pending: Slab::new(),
        cur_ts: 0,
    }
    .run();
}

#[cfg(test)]
mod tests {
    use super::{RouteEntry, RouteTable};

    fn table() -> RouteTable {
        RouteTable {
            entries: vec![
                RouteEntry {
                    vaddr_start: 0x1000,
                    vaddr_end: 0x2000,
                    phys_start: 0x0,
                    dev: 0,
                },
                RouteEntry {
                    vaddr_start: 0x2000,
                    vaddr_end: 0x3000,
                    phys_start: 0x8000,
                    dev: 1,
                },
            ],
        }
    }

    #[test]
    fn remaps_into_device_window() {
        let t = table();
        assert_eq!(t.lookup(0x1800, 8), Some((0, 0x800)));
        assert_eq!(t.lookup(0x2000, 8), Some((1, 0x8000)));
        assert_eq!(t.lookup(0x2004, 4), Some((1, 0x8004)));
    }

    #[test]
    fn unmapped_and_straddling_accesses_fail() {
        let t = table();
        assert_eq!(t.lookup(0x800, 8), None);
        assert_eq!(t.lookup(0x3000, 8), None);
        // Crosses the 0x2000 boundary between windows.
        assert_eq!(t.lookup(0x1ffc, 8), None);
    }
}
