// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Reference runtime for NIC-style behavioral device models.
//
// The runtime owns one PCIe channel (device side, listening), optionally one
// network channel, a timestamp-ordered set of timed events, and a bounded
// queue of in-flight DMA operations. The device model is a polymorphic
// collaborator: it implements the `Device` callbacks and talks back to the
// runtime exclusively through the `&mut Runtime` handle it is passed —
// there are no back-pointers.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use slab::Slab;

use crate::channel::{Channel, RxQueue, SyncMode, SyncProtocol, TxQueue};
use crate::connect::{establish, Endpoint};
use crate::error::Result;
use crate::proto::base::{intro_bytes, intro_from_bytes};
use crate::proto::net::{self, NetIntro, NetMsg};
use crate::proto::pcie::{
    self, PcieDevIntro, PcieH2D, PcieHostIntro, CTRL_INTX_EN, CTRL_MSIX_EN, CTRL_MSI_EN,
    INT_LEGACY_HI, INT_LEGACY_LO, INT_MSI, INT_MSIX,
};
use crate::shm::ShmPool;
use crate::signals;

/// Maximum number of DMA operations in flight at once; further issues queue.
pub const DMA_MAX_PENDING: usize = 64;

/// One DMA operation. For writes, `data` is the source; for reads it is
/// sized by the device and filled in by the time `dma_complete` runs.
#[derive(Debug)]
pub struct DmaOp {
    pub write: bool,
    pub dma_addr: u64,
    pub data: Vec<u8>,
    /// Device-private correlation value, handed back on completion.
    pub tag: u64,
}

/// Handle for a scheduled timed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(u64, u64);

/// Callbacks a device model implements.
pub trait Device {
    /// Fill in the PCIe device description sent to the host at handshake.
    fn setup_intro(&self, intro: &mut PcieDevIntro);
    /// MMIO read from a BAR; fill `dst` completely.
    fn reg_read(&mut self, rt: &mut Runtime, bar: u8, offset: u64, dst: &mut [u8]);
    /// MMIO write to a BAR.
    fn reg_write(&mut self, rt: &mut Runtime, bar: u8, offset: u64, src: &[u8]);
    /// A DMA operation issued earlier has completed.
    fn dma_complete(&mut self, rt: &mut Runtime, op: DmaOp);
    /// A frame arrived on the network channel.
    fn eth_rx(&mut self, rt: &mut Runtime, port: u8, data: &[u8]);
    /// Interrupt-enable state changed; the runtime tracks the flags either way.
    fn devctrl_update(&mut self, _rt: &mut Runtime, _flags: u64) {}
    /// A timed event scheduled via `event_schedule` came due.
    fn timed(&mut self, rt: &mut Runtime, tag: u64);
}

/// Runtime configuration. Latencies and intervals are picoseconds.
#[derive(Debug, Clone)]
pub struct RunnerArgs {
    pub pci_socket: String,
    pub eth_socket: Option<String>,
    pub shm_path: String,
    pub sync_protocol: SyncProtocol,
    pub start_ts: u64,
    pub sync_interval: u64,
    pub pci_latency: u64,
    pub eth_latency: u64,
    pub max_step: u64,
}

impl RunnerArgs {
    pub fn new(pci_socket: &str, eth_socket: Option<&str>, shm_path: &str) -> Self {
        Self {
            pci_socket: pci_socket.to_string(),
            eth_socket: eth_socket.map(str::to_string),
            shm_path: shm_path.to_string(),
            sync_protocol: SyncProtocol::PerChannel,
            start_ts: 0,
            sync_interval: 500_000,
            pci_latency: 500_000,
            eth_latency: 500_000,
            max_step: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime — the state device callbacks operate on
// ---------------------------------------------------------------------------

/// The device-visible side of the runtime: virtual time, outgoing queues,
/// DMA tracking, timed events, interrupt state.
pub struct Runtime {
    pcie_tx: TxQueue,
    eth_tx: Option<TxQueue>,
    cur_ts: u64,
    mac_addr: u64,
    dma_pending: Slab<DmaOp>,
    dma_queue: VecDeque<DmaOp>,
    events: BTreeMap<(u64, u64), u64>,
    event_seq: u64,
    int_intx_en: bool,
    int_msi_en: bool,
    int_msix_en: bool,
    scratch: Vec<u8>,
}

impl Runtime {
    /// Current virtual time in picoseconds.
    pub fn time_ps(&self) -> u64 {
        self.cur_ts
    }

    /// The MAC address assigned to this device instance.
    pub fn mac_addr(&self) -> u64 {
        self.mac_addr
    }

    pub fn intx_enabled(&self) -> bool {
        self.int_intx_en
    }

    pub fn msi_enabled(&self) -> bool {
        self.int_msi_en
    }

    pub fn msix_enabled(&self) -> bool {
        self.int_msix_en
    }

    /// Issue a DMA operation towards the host. Issues directly while fewer
    /// than [`DMA_MAX_PENDING`] operations are in flight, otherwise queues;
    /// the host observes operations in issue order either way.
    pub fn issue_dma(&mut self, op: DmaOp) {
        if self.dma_pending.len() < DMA_MAX_PENDING {
            self.dma_do(op);
        } else {
            self.dma_queue.push_back(op);
        }
    }

    fn dma_do(&mut self, op: DmaOp) {
        let key = self.dma_pending.insert(op);
        let op = &self.dma_pending[key];
        if op.write {
            while !pcie::d2h_write(
                &mut self.pcie_tx,
                self.cur_ts,
                key as u64,
                op.dma_addr,
                &op.data,
            ) {
                warn!("dma write: no d2h entry available");
            }
        } else {
            while !pcie::d2h_read(
                &mut self.pcie_tx,
                self.cur_ts,
                key as u64,
                op.dma_addr,
                op.data.len() as u16,
            ) {
                warn!("dma read: no d2h entry available");
            }
        }
    }

    /// Issue queued DMA operations while capacity is available.
    fn dma_trigger(&mut self) {
        if self.dma_pending.len() >= DMA_MAX_PENDING {
            return;
        }
        if let Some(op) = self.dma_queue.pop_front() {
            self.dma_do(op);
        }
    }

    pub fn msi_issue(&mut self, vec: u8) {
        self.interrupt_issue(vec as u16, INT_MSI);
    }

    pub fn msix_issue(&mut self, vec: u16) {
        self.interrupt_issue(vec, INT_MSIX);
    }

    /// Legacy INTx level change: `true` asserts, `false` deasserts.
    pub fn intx_issue(&mut self, level: bool) {
        let kind = if level { INT_LEGACY_HI } else { INT_LEGACY_LO };
        self.interrupt_issue(0, kind);
    }

    fn interrupt_issue(&mut self, vector: u16, inttype: u8) {
        while !pcie::d2h_interrupt(&mut self.pcie_tx, self.cur_ts, vector, inttype) {
            warn!("interrupt: no d2h entry available");
        }
    }

    /// Send an Ethernet frame on port 0.
    ///
    /// Dropped with a warning when the ring is full — packet loss, not stall.
    pub fn eth_send(&mut self, data: &[u8]) {
        let Some(eth_tx) = self.eth_tx.as_mut() else {
            warn!("eth_send: no network channel");
            return;
        };
        if !net::send_packet(eth_tx, self.cur_ts, 0, data) {
            warn!("eth_send: dropping packet, ring full");
        }
    }

    /// Schedule a timed event at virtual time `ts` with a device tag.
    pub fn event_schedule(&mut self, ts: u64, tag: u64) -> EventId {
        let seq = self.event_seq;
        self.event_seq += 1;
        self.events.insert((ts, seq), tag);
        EventId(ts, seq)
    }

    /// Cancel a scheduled event. Returns false if it already fired.
    pub fn event_cancel(&mut self, id: EventId) -> bool {
        self.events.remove(&(id.0, id.1)).is_some()
    }

    fn readcomp_spin(&mut self, req_id: u64, data: &[u8]) {
        while !pcie::d2h_readcomp(&mut self.pcie_tx, self.cur_ts, req_id, data) {
            warn!("readcomp: no d2h entry available");
        }
    }

    fn writecomp_spin(&mut self, req_id: u64) {
        while !pcie::d2h_writecomp(&mut self.pcie_tx, self.cur_ts, req_id) {
            warn!("writecomp: no d2h entry available");
        }
    }
}

/// Derive a per-instance MAC address from process identity and time.
fn derive_mac() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(1);
    let mut x = nanos ^ ((std::process::id() as u64) << 32);
    // xorshift mix
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x & 0xffff_ffff_ffff) & !3
}

// ---------------------------------------------------------------------------
// Runner — channel setup plus the main loop
// ---------------------------------------------------------------------------

/// Device runtime: establishes the channels, then runs the simulator loop.
pub struct Runner<D: Device> {
    rt: Runtime,
    pcie_rx: RxQueue,
    eth_rx: Option<RxQueue>,
    dev: D,
    max_step: u64,
}

impl<D: Device> Runner<D> {
    /// Set up the shared memory pool, listen on both sockets, and run the
    /// intro handshake. The device's `setup_intro` fills the PCIe intro.
    pub fn new(dev: D, args: RunnerArgs) -> Result<Self> {
        let mut dev_intro = PcieDevIntro::default();
        dev.setup_intro(&mut dev_intro);

        let mut pcie_params = pcie::default_params(&args.pci_socket);
        pcie_params.sync_mode = SyncMode::Optional;
        pcie_params.sync_protocol = args.sync_protocol;
        pcie_params.link_latency = args.pci_latency;
        pcie_params.sync_interval = args.sync_interval;

        let mut eth_params = args
            .eth_socket
            .as_deref()
            .map(net::default_params)
            .map(|mut p| {
                p.sync_mode = SyncMode::Optional;
                p.sync_protocol = args.sync_protocol;
                p.link_latency = args.eth_latency;
                p.sync_interval = args.sync_interval;
                p
            });

        let mut pool_size = pcie_params.shm_size();
        if let Some(ep) = &eth_params {
            pool_size += ep.shm_size();
        }
        let pool = Arc::new(ShmPool::create(&args.shm_path, pool_size)?);

        let mut pcie_ep = Endpoint::new(pcie_params, true)?;
        pcie_ep.set_intro(intro_bytes(&dev_intro).to_vec());
        pcie_ep.expect_peer_intro_len(mem::size_of::<PcieHostIntro>());
        pcie_ep.listen(&pool)?;

        let mut eth_ep = match eth_params.take() {
            Some(params) => {
                let mut ep = Endpoint::new(params, true)?;
                ep.set_intro(intro_bytes(&NetIntro::default()).to_vec());
                ep.expect_peer_intro_len(mem::size_of::<NetIntro>());
                ep.listen(&pool)?;
                Some(ep)
            }
            None => None,
        };

        {
            let mut eps: Vec<&mut Endpoint> = Vec::with_capacity(2);
            eps.push(&mut pcie_ep);
            if let Some(ep) = eth_ep.as_mut() {
                eps.push(ep);
            }
            establish(&mut eps)?;
        }

        let pcie = pcie_ep.into_channel()?;
        let eth = match eth_ep {
            Some(ep) => Some(ep.into_channel()?),
            None => None,
        };
        info!(
            "channels up: sync_pci={} sync_eth={}",
            pcie.sync_enabled(),
            eth.as_ref().map(Channel::sync_enabled).unwrap_or(false)
        );

        let (eth_tx, eth_rx) = match eth {
            Some(ch) => (Some(ch.tx), Some(ch.rx)),
            None => (None, None),
        };

        Ok(Self {
            rt: Runtime {
                pcie_tx: pcie.tx,
                eth_tx,
                cur_ts: args.start_ts,
                mac_addr: derive_mac(),
                dma_pending: Slab::with_capacity(DMA_MAX_PENDING),
                dma_queue: VecDeque::new(),
                events: BTreeMap::new(),
                event_seq: 0,
                int_intx_en: false,
                int_msi_en: false,
                int_msix_en: false,
                scratch: Vec::new(),
            },
            pcie_rx: pcie.rx,
            eth_rx,
            dev,
            max_step: args.max_step,
        })
    }

    /// Device-visible runtime state (for tests and embedding).
    pub fn runtime(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Handle at most one host-to-device message. Returns whether one was
    /// consumed.
    pub fn poll_pcie(&mut self) -> bool {
        let Some(msg) = self.pcie_rx.poll(self.rt.cur_ts) else {
            return false;
        };
        match PcieH2D::decode(&msg) {
            Some(PcieH2D::Read(read)) => {
                let (req_id, bar, offset) = (read.req_id, read.bar, read.offset);
                let len = read.len as usize;
                let mut buf = mem::take(&mut self.rt.scratch);
                buf.clear();
                buf.resize(len, 0);
                self.dev.reg_read(&mut self.rt, bar, offset, &mut buf);
                self.rt.readcomp_spin(req_id, &buf);
                self.rt.scratch = buf;
            }
            Some(PcieH2D::Write(write, data)) => {
                self.dev.reg_write(&mut self.rt, write.bar, write.offset, data);
                self.rt.writecomp_spin(write.req_id);
            }
            Some(PcieH2D::Readcomp(rc, data)) => {
                match self.rt.dma_pending.try_remove(rc.req_id as usize) {
                    Some(mut op) => {
                        let len = op.data.len();
                        op.data.copy_from_slice(&data[..len]);
                        self.dev.dma_complete(&mut self.rt, op);
                        self.rt.dma_trigger();
                    }
                    None => warn!("readcomp for unknown req_id {}", rc.req_id),
                }
            }
            Some(PcieH2D::Writecomp(wc)) => {
                match self.rt.dma_pending.try_remove(wc.req_id as usize) {
                    Some(op) => {
                        self.dev.dma_complete(&mut self.rt, op);
                        self.rt.dma_trigger();
                    }
                    None => warn!("writecomp for unknown req_id {}", wc.req_id),
                }
            }
            Some(PcieH2D::Devctrl(dc)) => {
                let flags = dc.flags;
                self.rt.int_intx_en = flags & CTRL_INTX_EN != 0;
                self.rt.int_msi_en = flags & CTRL_MSI_EN != 0;
                self.rt.int_msix_en = flags & CTRL_MSIX_EN != 0;
                self.dev.devctrl_update(&mut self.rt, flags);
            }
            Some(PcieH2D::Terminate) => {
                info!("pci peer terminated");
            }
            None => {
                warn!("poll_pcie: unsupported type={}", msg.ty());
            }
        }
        msg.done();
        true
    }

    /// Handle at most one network message.
    pub fn poll_eth(&mut self) -> bool {
        let Some(eth_rx) = self.eth_rx.as_mut() else {
            return false;
        };
        let Some(msg) = eth_rx.poll(self.rt.cur_ts) else {
            return false;
        };
        match NetMsg::decode(&msg) {
            Some(NetMsg::Packet(pkt, data)) => {
                self.dev.eth_rx(&mut self.rt, pkt.port, data);
            }
            Some(NetMsg::Terminate) => {
                info!("eth peer terminated");
            }
            None => {
                warn!("poll_eth: unsupported type={}", msg.ty());
            }
        }
        msg.done();
        true
    }

    /// Fire at most one due timed event.
    pub fn event_trigger(&mut self) -> bool {
        let Some((&(ts, _seq), _)) = self.rt.events.first_key_value() else {
            return false;
        };
        if ts > self.rt.cur_ts {
            return false;
        }
        let ((_, _), tag) = self.rt.events.pop_first().unwrap();
        self.dev.timed(&mut self.rt, tag);
        true
    }

    /// Emit due sync heartbeats, spinning while rings are full.
    pub fn sync_outputs(&mut self) {
        while !self.rt.pcie_tx.sync(self.rt.cur_ts) {
            warn!("pci sync failed (t={})", self.rt.cur_ts);
        }
        if let Some(eth_tx) = self.rt.eth_tx.as_mut() {
            while !eth_tx.sync(self.rt.cur_ts) {
                warn!("eth sync failed (t={})", self.rt.cur_ts);
            }
        }
    }

    /// The next permissible virtual time: bounded by every synchronized
    /// peer's observed clock and our own heartbeat deadlines, the next timed
    /// event, and the maximum step.
    pub fn next_timestamp(&self) -> u64 {
        let mut next = self.rt.cur_ts + self.max_step;
        if self.pcie_rx.sync_enabled() {
            next = next
                .min(self.pcie_rx.timestamp())
                .min(self.rt.pcie_tx.next_sync());
        }
        if let (Some(eth_rx), Some(eth_tx)) = (&self.eth_rx, &self.rt.eth_tx) {
            if eth_rx.sync_enabled() {
                next = next.min(eth_rx.timestamp()).min(eth_tx.next_sync());
            }
        }
        if let Some((&(ev_ts, _), _)) = self.rt.events.first_key_value() {
            next = next.min(ev_ts);
        }
        next
    }

    /// Set the current virtual time (tests drive the loop manually).
    pub fn set_time(&mut self, ts: u64) {
        self.rt.cur_ts = ts;
    }

    /// The main simulation loop; returns on SIGINT/SIGTERM.
    pub fn run(&mut self) -> Result<()> {
        signals::install();

        while !signals::exiting() {
            if signals::take_time_report() {
                info!("main_time = {}", self.rt.cur_ts);
            }
            self.sync_outputs();

            let mut next;
            loop {
                while self.poll_pcie() {}
                while self.poll_eth() {}
                while self.event_trigger() {}
                next = self.next_timestamp();
                if next > self.rt.cur_ts || signals::exiting() {
                    break;
                }
            }
            if next > self.rt.cur_ts {
                self.rt.cur_ts = next;
            }
        }

        info!("exit main_time: {}", self.rt.cur_ts);
        self.rt.pcie_tx.terminate(self.rt.cur_ts);
        if let Some(eth_tx) = self.rt.eth_tx.as_mut() {
            eth_tx.terminate(self.rt.cur_ts);
        }
        Ok(())
    }
}

/// Read the host's intro blob back out of an established endpoint.
pub fn host_intro(blob: &[u8]) -> Option<PcieHostIntro> {
    intro_from_bytes(blob)
}
