// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory message framing: host-to-memory reads and writes (optionally
// posted), memory-to-host completions.

use crate::channel::{ChannelParams, InMsg, TxQueue};
use crate::proto::base::{MsgHead, MSG_HEADER_LEN, MSG_TYPE_TERMINATE, PROTO_ID_MEM};

pub const H2M_MSG_READ: u8 = 0x60;
pub const H2M_MSG_WRITE: u8 = 0x61;
/// Posted write: no completion is generated.
pub const H2M_MSG_WRITE_POSTED: u8 = 0x62;

pub const M2H_MSG_READCOMP: u8 = 0x40;
pub const M2H_MSG_WRITECOMP: u8 = 0x41;

/// Default channel parameters for a memory interface.
pub fn default_params(sock_path: &str) -> ChannelParams {
    let mut params = ChannelParams::new(sock_path, PROTO_ID_MEM);
    params.out_entry_len = 4096 + MSG_HEADER_LEN;
    params.out_nentries = 1024;
    params.in_entry_len = 4096 + MSG_HEADER_LEN;
    params.in_nentries = 1024;
    params
}

/// Intro blob exchanged by memory peers. Carries nothing yet.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MemIntro {
    pub dummy: u32,
}

// ---------------------------------------------------------------------------
// Heads
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct MemH2MRead {
    pub req_id: u64,
    /// Address space identifier.
    pub as_id: u64,
    pub addr: u64,
    pub len: u16,
    _pad: [u8; 22],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct MemH2MWrite {
    pub req_id: u64,
    pub as_id: u64,
    pub addr: u64,
    pub len: u16,
    _pad: [u8; 22],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct MemM2HReadcomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

#[repr(C)]
pub struct MemM2HWritecomp {
    pub req_id: u64,
    _pad: [u8; 40],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

const _: () = assert!(std::mem::size_of::<MemH2MRead>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<MemH2MWrite>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<MemM2HReadcomp>() == MSG_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<MemM2HWritecomp>() == MSG_HEADER_LEN);

unsafe impl MsgHead for MemH2MRead {}
unsafe impl MsgHead for MemH2MWrite {}
unsafe impl MsgHead for MemM2HReadcomp {}
unsafe impl MsgHead for MemM2HWritecomp {}

// ---------------------------------------------------------------------------
// Incoming message views
// ---------------------------------------------------------------------------

/// A decoded host-to-memory message (as seen by the memory side).
pub enum MemH2M<'a> {
    Read(&'a MemH2MRead),
    Write(&'a MemH2MWrite, &'a [u8]),
    WritePosted(&'a MemH2MWrite, &'a [u8]),
    Terminate,
}

impl<'a> MemH2M<'a> {
    pub fn decode(msg: &'a InMsg<'_>) -> Option<Self> {
        match msg.ty() {
            H2M_MSG_READ => Some(Self::Read(msg.head())),
            H2M_MSG_WRITE | H2M_MSG_WRITE_POSTED => {
                let head: &MemH2MWrite = msg.head();
                let data = msg.payload().get(..head.len as usize)?;
                if msg.ty() == H2M_MSG_WRITE {
                    Some(Self::Write(head, data))
                } else {
                    Some(Self::WritePosted(head, data))
                }
            }
            MSG_TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// A decoded memory-to-host message (as seen by the host side).
pub enum MemM2H<'a> {
    Readcomp(&'a MemM2HReadcomp, &'a [u8]),
    Writecomp(&'a MemM2HWritecomp),
    Terminate,
}

impl<'a> MemM2H<'a> {
    pub fn decode(msg: &'a InMsg<'_>) -> Option<Self> {
        match msg.ty() {
            M2H_MSG_READCOMP => Some(Self::Readcomp(msg.head(), msg.payload())),
            M2H_MSG_WRITECOMP => Some(Self::Writecomp(msg.head())),
            MSG_TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing helpers
// ---------------------------------------------------------------------------

pub fn h2m_read(tx: &mut TxQueue, ts: u64, req_id: u64, as_id: u64, addr: u64, len: u16) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<MemH2MRead>();
    head.req_id = req_id;
    head.as_id = as_id;
    head.addr = addr;
    head.len = len;
    msg.send(H2M_MSG_READ);
    true
}

pub fn h2m_write(
    tx: &mut TxQueue,
    ts: u64,
    req_id: u64,
    as_id: u64,
    addr: u64,
    data: &[u8],
    posted: bool,
) -> bool {
    assert!(data.len() <= tx.payload_capacity());
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<MemH2MWrite>();
    head.req_id = req_id;
    head.as_id = as_id;
    head.addr = addr;
    head.len = data.len() as u16;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(if posted {
        H2M_MSG_WRITE_POSTED
    } else {
        H2M_MSG_WRITE
    });
    true
}

pub fn m2h_readcomp(tx: &mut TxQueue, ts: u64, req_id: u64, data: &[u8]) -> bool {
    assert!(data.len() <= tx.payload_capacity());
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<MemM2HReadcomp>().req_id = req_id;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(M2H_MSG_READCOMP);
    true
}

pub fn m2h_writecomp(tx: &mut TxQueue, ts: u64, req_id: u64) -> bool {
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    msg.head_mut::<MemM2HWritecomp>().req_id = req_id;
    msg.send(M2H_MSG_WRITECOMP);
    true
}
