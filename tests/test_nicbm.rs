// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Device runtime tests. The runtime (device side) runs on the test thread;
// a host-side thread performs the handshake and then the test drives both
// ends deterministically, one message at a time.

use std::mem;
use std::thread;

use simbricks::channel::Channel;
use simbricks::connect::{establish, Endpoint};
use simbricks::nicbm::{Device, DmaOp, Runner, RunnerArgs, Runtime, DMA_MAX_PENDING};
use simbricks::proto::base::intro_bytes;
use simbricks::proto::net::{self, NetIntro, NetMsg};
use simbricks::proto::pcie::{
    self, PcieD2H, PcieDevIntro, PcieHostIntro, CTRL_MSI_EN, INT_MSI,
};

const REG_DMA_TRIGGER: u64 = 0x40;
const REG_MSI_TRIGGER: u64 = 0x48;
const REG_ETH_TRIGGER: u64 = 0x50;

const DMA_BASE: u64 = 0x1000;

/// Records every callback; registers trigger DMA, MSI, and transmit.
#[derive(Default)]
struct TestDev {
    writes: Vec<(u8, u64, Vec<u8>)>,
    completions: Vec<(u64, Vec<u8>)>,
    rx_frames: Vec<Vec<u8>>,
}

impl Device for TestDev {
    fn setup_intro(&self, intro: &mut PcieDevIntro) {
        intro.bars[0].len = 0x1000;
        intro.pci_vendor_id = 0x1234;
        intro.pci_device_id = 0x5678;
        intro.pci_msi_nvecs = 4;
    }

    fn reg_read(&mut self, _rt: &mut Runtime, _bar: u8, offset: u64, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = (offset as u8).wrapping_add(i as u8);
        }
    }

    fn reg_write(&mut self, rt: &mut Runtime, bar: u8, offset: u64, src: &[u8]) {
        self.writes.push((bar, offset, src.to_vec()));
        let mut buf = [0u8; 8];
        buf[..src.len().min(8)].copy_from_slice(&src[..src.len().min(8)]);
        let value = u64::from_le_bytes(buf);

        match offset {
            REG_DMA_TRIGGER => {
                for i in 0..value {
                    rt.issue_dma(DmaOp {
                        write: false,
                        dma_addr: DMA_BASE + i * 8,
                        data: vec![0; 8],
                        tag: i,
                    });
                }
            }
            REG_MSI_TRIGGER => rt.msi_issue(value as u8),
            REG_ETH_TRIGGER => rt.eth_send(&vec![0xee; value as usize]),
            _ => {}
        }
    }

    fn dma_complete(&mut self, _rt: &mut Runtime, op: DmaOp) {
        self.completions.push((op.tag, op.data));
    }

    fn eth_rx(&mut self, _rt: &mut Runtime, _port: u8, data: &[u8]) {
        self.rx_frames.push(data.to_vec());
    }

    fn timed(&mut self, _rt: &mut Runtime, _tag: u64) {}
}

/// Bring up a runner (device side, this thread) against a host thread.
fn setup(with_eth: bool) -> (Runner<TestDev>, Channel, Option<Channel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pci_sock = dir.path().join("pci").to_str().unwrap().to_string();
    let eth_sock = dir.path().join("eth").to_str().unwrap().to_string();
    let shm = dir.path().join("pool").to_str().unwrap().to_string();

    let host_pci_sock = pci_sock.clone();
    let host_eth_sock = eth_sock.clone();
    let host = thread::spawn(move || {
        let mut pep =
            Endpoint::new(pcie::default_params(&host_pci_sock), false).expect("pci endpoint");
        pep.set_intro(intro_bytes(&PcieHostIntro::default()).to_vec());
        pep.expect_peer_intro_len(mem::size_of::<PcieDevIntro>());
        pep.connect().expect("pci connect");

        let mut nep = if with_eth {
            let mut ep =
                Endpoint::new(net::default_params(&host_eth_sock), false).expect("eth endpoint");
            ep.set_intro(intro_bytes(&NetIntro::default()).to_vec());
            ep.expect_peer_intro_len(mem::size_of::<NetIntro>());
            ep.connect().expect("eth connect");
            Some(ep)
        } else {
            None
        };

        {
            let mut eps: Vec<&mut Endpoint> = vec![&mut pep];
            if let Some(ep) = nep.as_mut() {
                eps.push(ep);
            }
            establish(&mut eps).expect("host establish");
        }

        let pci = pep.into_channel().expect("pci channel");
        let eth = nep.map(|ep| ep.into_channel().expect("eth channel"));
        (pci, eth)
    });

    let args = RunnerArgs::new(&pci_sock, with_eth.then_some(eth_sock.as_str()), &shm);
    let runner = Runner::new(TestDev::default(), args).expect("runner");
    let (host_pci, host_eth) = host.join().expect("host thread");
    (runner, host_pci, host_eth, dir)
}

/// Drain every currently-readable device-to-host message, decoded.
enum HostMsg {
    Read { req_id: u64, offset: u64, len: u16 },
    Writecomp(u64),
    Readcomp(u64, Vec<u8>),
    Interrupt(u16, u8),
}

fn drain_host(host: &mut Channel) -> Vec<HostMsg> {
    let mut out = Vec::new();
    while let Some(msg) = host.rx.poll(u64::MAX) {
        match PcieD2H::decode(&msg) {
            Some(PcieD2H::Read(read)) => out.push(HostMsg::Read {
                req_id: read.req_id,
                offset: read.offset,
                len: read.len,
            }),
            Some(PcieD2H::Writecomp(wc)) => out.push(HostMsg::Writecomp(wc.req_id)),
            Some(PcieD2H::Readcomp(rc, data)) => {
                out.push(HostMsg::Readcomp(rc.req_id, data[..8].to_vec()))
            }
            Some(PcieD2H::Interrupt(intr)) => {
                out.push(HostMsg::Interrupt(intr.vector, intr.inttype))
            }
            _ => panic!("unexpected d2h message"),
        }
        msg.done();
    }
    out
}

// ---------------------------------------------------------------------------

#[test]
fn register_write_round_trip() {
    let (mut runner, mut host, _, _dir) = setup(false);

    let data = 0xdeadbeefu32.to_le_bytes();
    assert!(pcie::h2d_write(&mut host.tx, 0, 7, 0, 0x10, &data));

    runner.set_time(500_000);
    assert!(runner.poll_pcie());
    assert!(!runner.poll_pcie());

    assert_eq!(runner.device().writes, vec![(0, 0x10, data.to_vec())]);

    let msgs = drain_host(&mut host);
    assert_eq!(msgs.len(), 1);
    match &msgs[0] {
        HostMsg::Writecomp(req_id) => assert_eq!(*req_id, 7),
        _ => panic!("expected writecomp"),
    }
}

#[test]
fn register_read_yields_exactly_one_completion() {
    let (mut runner, mut host, _, _dir) = setup(false);

    assert!(pcie::h2d_read(&mut host.tx, 0, 9, 0, 0x20, 8));
    runner.set_time(500_000);
    assert!(runner.poll_pcie());

    let msgs = drain_host(&mut host);
    assert_eq!(msgs.len(), 1);
    match &msgs[0] {
        HostMsg::Readcomp(req_id, data) => {
            assert_eq!(*req_id, 9);
            let expect: Vec<u8> = (0..8).map(|i| 0x20 + i as u8).collect();
            assert_eq!(data, &expect);
        }
        _ => panic!("expected readcomp"),
    }
}

#[test]
fn dma_cap_and_issue_order() {
    let (mut runner, mut host, _, _dir) = setup(false);

    // The device issues 70 DMA reads synchronously from one register write.
    assert!(pcie::h2d_write(
        &mut host.tx,
        0,
        1,
        0,
        REG_DMA_TRIGGER,
        &70u64.to_le_bytes()
    ));
    runner.set_time(500_000);
    assert!(runner.poll_pcie());

    // Exactly the cap goes out, in issue order; the rest queues.
    let msgs = drain_host(&mut host);
    assert_eq!(msgs.len(), DMA_MAX_PENDING + 1);
    let mut read_reqs = Vec::new();
    for (i, msg) in msgs.iter().take(DMA_MAX_PENDING).enumerate() {
        match msg {
            HostMsg::Read {
                req_id,
                offset,
                len,
            } => {
                assert_eq!(*offset, DMA_BASE + i as u64 * 8);
                assert_eq!(*len, 8);
                read_reqs.push(*req_id);
            }
            _ => panic!("expected dma read at {i}"),
        }
    }
    assert!(matches!(msgs[DMA_MAX_PENDING], HostMsg::Writecomp(1)));

    // Complete the first three: exactly three more go out, in original order.
    runner.set_time(1_500_000);
    for (i, req_id) in read_reqs.iter().take(3).enumerate() {
        let data = [i as u8; 8];
        assert!(pcie::h2d_readcomp(&mut host.tx, 1_000_000, *req_id, &data));
        assert!(runner.poll_pcie());
    }

    let completed: Vec<u64> = runner.device().completions.iter().map(|c| c.0).collect();
    assert_eq!(completed, vec![0, 1, 2]);
    assert_eq!(runner.device().completions[1].1, vec![1u8; 8]);

    let msgs = drain_host(&mut host);
    assert_eq!(msgs.len(), 3);
    for (i, msg) in msgs.iter().enumerate() {
        match msg {
            HostMsg::Read { offset, .. } => {
                assert_eq!(*offset, DMA_BASE + (DMA_MAX_PENDING + i) as u64 * 8);
            }
            _ => panic!("expected queued dma read"),
        }
    }
}

#[test]
fn devctrl_gates_msi() {
    let (mut runner, mut host, _, _dir) = setup(false);
    runner.set_time(500_000);

    assert!(pcie::h2d_devctrl(&mut host.tx, 0, CTRL_MSI_EN));
    assert!(runner.poll_pcie());
    assert!(runner.runtime().msi_enabled());
    assert!(!runner.runtime().msix_enabled());

    assert!(pcie::h2d_write(
        &mut host.tx,
        0,
        2,
        0,
        REG_MSI_TRIGGER,
        &3u64.to_le_bytes()
    ));
    assert!(runner.poll_pcie());

    let msgs = drain_host(&mut host);
    assert_eq!(msgs.len(), 2);
    match &msgs[0] {
        HostMsg::Interrupt(vector, inttype) => {
            assert_eq!(*vector, 3);
            assert_eq!(*inttype, INT_MSI);
        }
        _ => panic!("expected interrupt"),
    }
    assert!(matches!(msgs[1], HostMsg::Writecomp(2)));
}

#[test]
fn frames_cross_the_runtime_byte_identical() {
    let (mut runner, mut host_pci, host_eth, _dir) = setup(true);
    let mut host_eth = host_eth.expect("eth channel");
    runner.set_time(500_000);

    // Host to device.
    let frame: Vec<u8> = (0..64).map(|i| i as u8 ^ 0x5a).collect();
    assert!(net::send_packet(&mut host_eth.tx, 0, 0, &frame));
    assert!(runner.poll_eth());
    assert_eq!(runner.device().rx_frames, vec![frame]);

    // Device to network, triggered by a register write.
    assert!(pcie::h2d_write(
        &mut host_pci.tx,
        0,
        3,
        0,
        REG_ETH_TRIGGER,
        &5u64.to_le_bytes()
    ));
    assert!(runner.poll_pcie());

    let msg = host_eth.rx.poll(u64::MAX).expect("frame");
    match NetMsg::decode(&msg).expect("decode") {
        NetMsg::Packet(head, data) => {
            assert_eq!(head.port, 0);
            assert_eq!(data, &[0xee; 5]);
        }
        _ => panic!("expected packet"),
    }
    msg.done();
}

#[test]
fn sync_heartbeats_and_admission() {
    let (mut runner, mut host, _, _dir) = setup(false);

    // Device heartbeat at t=0 arrives stamped with the pci latency.
    runner.sync_outputs();
    assert!(host.rx.poll(u64::MAX).is_none());
    assert_eq!(host.rx.timestamp(), 500_000);

    // Until the host advertises its clock, the device may not advance:
    // its view of the host is still at 0.
    assert_eq!(runner.next_timestamp(), 0);

    // A host heartbeat unblocks the device up to its step limit.
    assert!(host.tx.sync(0));
    assert!(!runner.poll_pcie());
    assert_eq!(runner.next_timestamp(), 10_000);
}

#[test]
fn timed_events_fire_in_order() {
    let (mut runner, _host, _, _dir) = setup(false);

    let rt = runner.runtime();
    rt.event_schedule(2_000, 2);
    rt.event_schedule(1_000, 1);
    rt.event_schedule(3_000, 3);
    let cancelled = rt.event_schedule(2_500, 9);
    assert!(rt.event_cancel(cancelled));
    assert!(!rt.event_cancel(cancelled));

    assert!(!runner.event_trigger()); // nothing due at t=0

    runner.set_time(2_000);
    assert!(runner.event_trigger());
    assert!(runner.event_trigger());
    assert!(!runner.event_trigger());

    runner.set_time(3_000);
    assert!(runner.event_trigger());
    assert!(!runner.event_trigger());
}
