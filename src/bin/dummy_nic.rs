// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal NIC behavioral model on top of the device runtime.
//
// BAR 0 register map (all 64-bit):
//   0x00 CTRL      bit 0 enables the periodic status tick
//   0x08 STATUS    tick counter (read-only)
//   0x10 MAC       device MAC address (read-only)
//   0x18 TX_ADDR   host buffer of the next transmit
//   0x20 TX_LEN    writing issues a DMA read of the buffer, then sends the
//                  frame and raises MSI vector 0
//   0x28 RX_ADDR   host buffer for received frames
//   0x30 RX_CAP    capacity of the receive buffer
//   0x38 RX_LEN    length of the last received frame (read-only)

use clap::Parser;
use log::{error, info, warn};

use simbricks::channel::SyncProtocol;
use simbricks::nicbm::{Device, DmaOp, Runner, RunnerArgs, Runtime};
use simbricks::proto::pcie::PcieDevIntro;

const REG_CTRL: u64 = 0x00;
const REG_STATUS: u64 = 0x08;
const REG_MAC: u64 = 0x10;
const REG_TX_ADDR: u64 = 0x18;
const REG_TX_LEN: u64 = 0x20;
const REG_RX_ADDR: u64 = 0x28;
const REG_RX_CAP: u64 = 0x30;
const REG_RX_LEN: u64 = 0x38;

const CTRL_TICK_EN: u64 = 1 << 0;

const TAG_TX: u64 = 0;
const TAG_RX: u64 = 1;

/// Status tick period: 1 ms.
const TICK_PERIOD: u64 = 1_000_000_000;

#[derive(Default)]
struct DummyNic {
    ctrl: u64,
    status: u64,
    tx_addr: u64,
    rx_addr: u64,
    rx_cap: u64,
    rx_len: u64,
}

impl DummyNic {
    fn reg(&self, rt: &Runtime, offset: u64) -> u64 {
        match offset {
            REG_CTRL => self.ctrl,
            REG_STATUS => self.status,
            REG_MAC => rt.mac_addr(),
            REG_TX_ADDR => self.tx_addr,
            REG_RX_ADDR => self.rx_addr,
            REG_RX_CAP => self.rx_cap,
            REG_RX_LEN => self.rx_len,
            _ => {
                warn!("read from unknown register {offset:#x}");
                0
            }
        }
    }
}

impl Device for DummyNic {
    fn setup_intro(&self, intro: &mut PcieDevIntro) {
        intro.bars[0].len = 0x1000;
        intro.pci_vendor_id = 0xdead;
        intro.pci_device_id = 0xbeef;
        intro.pci_class = 0x02; // network controller
        intro.pci_msi_nvecs = 2;
    }

    fn reg_read(&mut self, rt: &mut Runtime, bar: u8, offset: u64, dst: &mut [u8]) {
        if bar != 0 || dst.len() != 8 {
            warn!("unsupported read: bar {bar} offset {offset:#x} len {}", dst.len());
            dst.fill(0);
            return;
        }
        dst.copy_from_slice(&self.reg(rt, offset).to_le_bytes());
    }

    fn reg_write(&mut self, rt: &mut Runtime, bar: u8, offset: u64, src: &[u8]) {
        if bar != 0 || src.len() != 8 {
            warn!("unsupported write: bar {bar} offset {offset:#x} len {}", src.len());
            return;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(src);
        let value = u64::from_le_bytes(buf);

        match offset {
            REG_CTRL => {
                let was_ticking = self.ctrl & CTRL_TICK_EN != 0;
                self.ctrl = value;
                if !was_ticking && value & CTRL_TICK_EN != 0 {
                    rt.event_schedule(rt.time_ps() + TICK_PERIOD, 0);
                }
            }
            REG_TX_ADDR => self.tx_addr = value,
            REG_TX_LEN => {
                // Fetch the frame from host memory; completion transmits it.
                rt.issue_dma(DmaOp {
                    write: false,
                    dma_addr: self.tx_addr,
                    data: vec![0; value as usize],
                    tag: TAG_TX,
                });
            }
            REG_RX_ADDR => self.rx_addr = value,
            REG_RX_CAP => self.rx_cap = value,
            _ => warn!("write to unknown register {offset:#x}"),
        }
    }

    fn dma_complete(&mut self, rt: &mut Runtime, op: DmaOp) {
        match op.tag {
            TAG_TX => {
                rt.eth_send(&op.data);
                if rt.msi_enabled() {
                    rt.msi_issue(0);
                }
            }
            TAG_RX => {
                if rt.msi_enabled() {
                    rt.msi_issue(1);
                }
            }
            tag => warn!("dma completion with unknown tag {tag}"),
        }
    }

    fn eth_rx(&mut self, rt: &mut Runtime, _port: u8, data: &[u8]) {
        if self.rx_addr == 0 {
            warn!("eth_rx: dropping frame, no receive buffer");
            return;
        }
        let len = data.len().min(self.rx_cap as usize);
        self.rx_len = len as u64;
        rt.issue_dma(DmaOp {
            write: true,
            dma_addr: self.rx_addr,
            data: data[..len].to_vec(),
            tag: TAG_RX,
        });
    }

    fn timed(&mut self, rt: &mut Runtime, _tag: u64) {
        self.status = self.status.wrapping_add(1);
        if self.ctrl & CTRL_TICK_EN != 0 {
            rt.event_schedule(rt.time_ps() + TICK_PERIOD, 0);
        }
    }
}

#[derive(Parser)]
#[command(name = "dummy_nic")]
#[command(about = "Minimal NIC behavioral model")]
struct Cli {
    pci_socket: String,
    eth_socket: String,
    shm_path: String,

    /// Sync mode: 0 = per-channel, 1 = barrier (unsupported)
    #[arg(default_value_t = 0)]
    sync_mode: u32,

    /// Starting virtual time in picoseconds
    #[arg(default_value_t = 0)]
    start_tick: u64,

    /// Sync period in nanoseconds
    #[arg(default_value_t = 500)]
    sync_period: u64,

    /// PCI latency in nanoseconds
    #[arg(default_value_t = 500)]
    pci_latency: u64,

    /// Ethernet latency in nanoseconds
    #[arg(default_value_t = 500)]
    eth_latency: u64,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut args = RunnerArgs::new(&cli.pci_socket, Some(&cli.eth_socket), &cli.shm_path);
    args.sync_protocol = match cli.sync_mode {
        0 => SyncProtocol::PerChannel,
        _ => SyncProtocol::Barrier,
    };
    args.start_ts = cli.start_tick;
    args.sync_interval = cli.sync_period * 1000;
    args.pci_latency = cli.pci_latency * 1000;
    args.eth_latency = cli.eth_latency * 1000;

    let mut runner = match Runner::new(DummyNic::default(), args) {
        Ok(r) => r,
        Err(e) => {
            error!("initialization failed: {e}");
            std::process::exit(1);
        }
    };
    info!("mac_addr = {:#x}", runner.runtime().mac_addr());
    if let Err(e) = runner.run() {
        error!("runtime failure: {e}");
        std::process::exit(1);
    }
}
