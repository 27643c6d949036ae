// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// PCIe message framing: host-to-device MMIO requests and completions,
// device-to-host DMA requests, completions, and interrupts.
//
// Head structs are wire-exact: explicit pad arrays keep every field naturally
// aligned, so plain #[repr(C)] reproduces the packed layout. The trailing
// timestamp/own_type framing fields are private; they are written by the
// channel, never by protocol code.

use crate::channel::{ChannelParams, InMsg, TxQueue};
use crate::proto::base::{MsgHead, MSG_HEADER_LEN, MSG_TYPE_TERMINATE, PROTO_ID_PCIE};

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

pub const H2D_MSG_READ: u8 = 0x60;
pub const H2D_MSG_WRITE: u8 = 0x61;
pub const H2D_MSG_READCOMP: u8 = 0x62;
pub const H2D_MSG_WRITECOMP: u8 = 0x63;
pub const H2D_MSG_DEVCTRL: u8 = 0x64;

pub const D2H_MSG_READ: u8 = 0x40;
pub const D2H_MSG_WRITE: u8 = 0x41;
pub const D2H_MSG_INTERRUPT: u8 = 0x42;
pub const D2H_MSG_READCOMP: u8 = 0x43;
pub const D2H_MSG_WRITECOMP: u8 = 0x44;

/// Interrupt kinds carried in [`PcieD2HInterrupt::inttype`].
pub const INT_LEGACY_HI: u8 = 0;
pub const INT_LEGACY_LO: u8 = 1;
pub const INT_MSI: u8 = 2;
pub const INT_MSIX: u8 = 3;

/// Devctrl flag bits.
pub const CTRL_INTX_EN: u64 = 1 << 0;
pub const CTRL_MSI_EN: u64 = 1 << 1;
pub const CTRL_MSIX_EN: u64 = 1 << 2;

/// Number of PCI BARs described in the device intro.
pub const NBARS: usize = 6;

/// BAR flag bits in [`PcieBar::flags`].
pub const BAR_IO: u64 = 1 << 0;
pub const BAR_64: u64 = 1 << 1;
pub const BAR_PF: u64 = 1 << 2;
/// MMIO for this BAR is handled by the host, not forwarded (used for MSI-X).
pub const BAR_DUMMY: u64 = 1 << 3;

/// Default channel parameters for a PCIe interface.
pub fn default_params(sock_path: &str) -> ChannelParams {
    let mut params = ChannelParams::new(sock_path, PROTO_ID_PCIE);
    params.out_entry_len = 4096 + MSG_HEADER_LEN;
    params.out_nentries = 1024;
    params.in_entry_len = 4096 + MSG_HEADER_LEN;
    params.in_nentries = 1024;
    params
}

// ---------------------------------------------------------------------------
// Intros
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PcieBar {
    /// Length in bytes; 0 marks the BAR unused.
    pub len: u64,
    pub flags: u64,
}

/// Device description appended to the listener intro by the device side.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PcieDevIntro {
    pub flags: u64,
    pub bars: [PcieBar; NBARS],
    pub pci_vendor_id: u16,
    pub pci_device_id: u16,
    pub pci_class: u8,
    pub pci_subclass: u8,
    pub pci_revision: u8,
    pub pci_progif: u8,
    pub pci_msi_nvecs: u8,
    pub pci_msix_table_bar: u8,
    pub pci_msix_pba_bar: u8,
    _pad: u8,
    pub pci_msix_nvecs: u16,
    pub pci_msix_cap_offset: u16,
    pub pci_msix_table_offset: u32,
    pub pci_msix_pba_offset: u32,
}

const _: () = assert!(std::mem::size_of::<PcieDevIntro>() == 128);

/// Host acknowledgment appended to the connecter intro.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PcieHostIntro {
    pub flags: u64,
}

// ---------------------------------------------------------------------------
// Host-to-device heads
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct PcieH2DRead {
    pub req_id: u64,
    pub offset: u64,
    pub len: u16,
    pub bar: u8,
    _pad: [u8; 29],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieH2DWrite {
    pub req_id: u64,
    pub offset: u64,
    pub len: u16,
    pub bar: u8,
    _pad: [u8; 29],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieH2DReadcomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieH2DWritecomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieH2DDevctrl {
    pub flags: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

const _: () = assert!(std::mem::size_of::<PcieH2DRead>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieH2DWrite>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieH2DReadcomp>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieH2DWritecomp>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieH2DDevctrl>() == MSG_HEADER_LEN);

unsafe impl MsgHead for PcieH2DRead {}
unsafe impl MsgHead for PcieH2DWrite {}
unsafe impl MsgHead for PcieH2DReadcomp {}
unsafe impl MsgHead for PcieH2DWritecomp {}
unsafe impl MsgHead for PcieH2DDevctrl {}

// ---------------------------------------------------------------------------
// Device-to-host heads
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct PcieD2HRead {
    pub req_id: u64,
    pub offset: u64,
    pub len: u16,
    _pad: [u8; 30],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieD2HWrite {
    pub req_id: u64,
    pub offset: u64,
    pub len: u16,
    _pad: [u8; 30],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieD2HInterrupt {
    pub vector: u16,
    pub inttype: u8,
    _pad: [u8; 45],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieD2HReadcomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct PcieD2HWritecomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

const _: () = assert!(std::mem::size_of::<PcieD2HRead>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieD2HWrite>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieD2HInterrupt>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieD2HReadcomp>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<PcieD2HWritecomp>() == MSG_HEADER_LEN);

unsafe impl MsgHead for PcieD2HRead {}
unsafe impl MsgHead for PcieD2HWrite {}
unsafe impl MsgHead for PcieD2HInterrupt {}
unsafe impl MsgHead for PcieD2HReadcomp {}
unsafe impl MsgHead for PcieD2HWritecomp {}

// ---------------------------------------------------------------------------
// Incoming message views
// ---------------------------------------------------------------------------

/// A decoded host-to-device message (as seen by the device side).
pub enum PcieH2D<'a> {
    Read(&'a PcieH2DRead),
    Write(&'a PcieH2DWrite, &'a [u8]),
    Readcomp(&'a PcieH2DReadcomp, &'a [u8]),
    Writecomp(&'a PcieH2DWritecomp),
    Devctrl(&'a PcieH2DDevctrl),
    Terminate,
}

impl<'a> PcieH2D<'a> {
    /// Decode a polled entry. `None` for unknown tags or garbled lengths.
    pub fn decode(msg: &'a InMsg<'_>) -> Option<Self> {
        match msg.ty() {
            H2D_MSG_READ => Some(Self::Read(msg.head())),
            H2D_MSG_WRITE => {
                let head: &PcieH2DWrite = msg.head();
                let data = msg.payload().get(..head.len as usize)?;
                Some(Self::Write(head, data))
            }
            H2D_MSG_READCOMP => Some(Self::Readcomp(msg.head(), msg.payload())),
            H2D_MSG_WRITECOMP => Some(Self::Writecomp(msg.head())),
            H2D_MSG_DEVCTRL => Some(Self::Devctrl(msg.head())),
            MSG_TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// A decoded device-to-host message (as seen by the host side).
pub enum PcieD2H<'a> {
    Read(&'a PcieD2HRead),
    Write(&'a PcieD2HWrite, &'a [u8]),
    Interrupt(&'a PcieD2HInterrupt),
    Readcomp(&'a PcieD2HReadcomp, &'a [u8]),
    Writecomp(&'a PcieD2HWritecomp),
    Terminate,
}

impl<'a> PcieD2H<'a> {
    pub fn decode(msg: &'a InMsg<'_>) -> Option<Self> {
        match msg.ty() {
            D2H_MSG_READ => Some(Self::Read(msg.head())),
            D2H_MSG_WRITE => {
                let head: &PcieD2HWrite = msg.head();
                let data = msg.payload().get(..head.len as usize)?;
                Some(Self::Write(head, data))
            }
            D2H_MSG_INTERRUPT => Some(Self::Interrupt(msg.head())),
            D2H_MSG_READCOMP => Some(Self::Readcomp(msg.head(), msg.payload())),
            D2H_MSG_WRITECOMP => Some(Self::Writecomp(msg.head())),
            MSG_TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing helpers
//
// Each returns false when the ring is full; the caller decides whether to
// spin or drop. Payloads must fit the ring's entry stride.
// ---------------------------------------------------------------------------

pub fn h2d_read(tx: &mut TxQueue, ts: u64, req_id: u64, bar: u8, offset: u64, len: u16) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<PcieH2DRead>();
    head.req_id = req_id;
    head.offset = offset;
    head.len = len;
    head.bar = bar;
    msg.send(H2D_MSG_READ);
    true
}

pub fn h2d_write(
    tx: &mut TxQueue,
    ts: u64,
    req_id: u64,
    bar: u8,
    offset: u64,
    data: &[u8],
) -> bool {
    assert!(
        data.len() <= tx.payload_capacity(),
        "h2d write too big ({}), can only fit up to {}",
        data.len(),
        tx.payload_capacity()
    );
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<PcieH2DWrite>();
    head.req_id = req_id;
    head.offset = offset;
    head.len = data.len() as u16;
    head.bar = bar;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(H2D_MSG_WRITE);
    true
}

pub fn h2d_readcomp(tx: &mut TxQueue, ts: u64, req_id: u64, data: &[u8]) -> bool {
    assert!(data.len() <= tx.payload_capacity());
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<PcieH2DReadcomp>().req_id = req_id;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(H2D_MSG_READCOMP);
    true
}

pub fn h2d_writecomp(tx: &mut TxQueue, ts: u64, req_id: u64) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<PcieH2DWritecomp>().req_id = req_id;
    msg.send(H2D_MSG_WRITECOMP);
    true
}

pub fn h2d_devctrl(tx: &mut TxQueue, ts: u64, flags: u64) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<PcieH2DDevctrl>().flags = flags;
    msg.send(H2D_MSG_DEVCTRL);
    true
}

pub fn d2h_read(tx: &mut TxQueue, ts: u64, req_id: u64, offset: u64, len: u16) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<PcieD2HRead>();
    head.req_id = req_id;
    head.offset = offset;
    head.len = len;
    msg.send(D2H_MSG_READ);
    true
}

pub fn d2h_write(tx: &mut TxQueue, ts: u64, req_id: u64, offset: u64, data: &[u8]) -> bool {
    assert!(
        data.len() <= tx.payload_capacity(),
        "dma write too big ({}), can only fit up to {}",
        data.len(),
        tx.payload_capacity()
    );
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<PcieD2HWrite>();
    head.req_id = req_id;
    head.offset = offset;
    head.len = data.len() as u16;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(D2H_MSG_WRITE);
    true
}

pub fn d2h_interrupt(tx: &mut TxQueue, ts: u64, vector: u16, inttype: u8) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<PcieD2HInterrupt>();
    head.vector = vector;
    head.inttype = inttype;
    msg.send(D2H_MSG_INTERRUPT);
    true
}

pub fn d2h_readcomp(tx: &mut TxQueue, ts: u64, req_id: u64, data: &[u8]) -> bool {
    assert!(data.len() <= tx.payload_capacity());
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<PcieD2HReadcomp>().req_id = req_id;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(D2H_MSG_READCOMP);
    true
}

pub fn d2h_writecomp(tx: &mut TxQueue, ts: u64, req_id: u64) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<PcieD2HWritecomp>().req_id = req_id;
    msg.send(D2H_MSG_WRITECOMP);
    true
}
