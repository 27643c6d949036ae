// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Network message framing: symmetric Ethernet frame transfer. Both directions
// carry the same single packet message.

use crate::channel::{ChannelParams, InMsg, TxQueue};
use crate::proto::base::{MsgHead, MSG_HEADER_LEN, MSG_TYPE_TERMINATE, PROTO_ID_NET};

/// An Ethernet frame (either direction).
pub const NET_MSG_PACKET: u8 = 0x40;

/// Default channel parameters for a network interface: entries sized for a
/// full Ethernet frame, deep rings for packet bursts.
pub fn default_params(sock_path: &str) -> ChannelParams {
    let mut params = ChannelParams::new(sock_path, PROTO_ID_NET);
    params.out_entry_len = 1536 + MSG_HEADER_LEN;
    params.out_nentries = 8192;
    params.in_entry_len = 1536 + MSG_HEADER_LEN;
    params.in_nentries = 8192;
    params
}

/// Intro blob exchanged by network peers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetIntro {
    pub flags: u64,
}

#[repr(C)]
pub struct NetPacket {
    pub len: u16,
    pub port: u8,
    _pad: [u8; 45],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

const _: () = assert!(std::mem::size_of::<NetPacket>() == MSG_HEADER_LEN);

unsafe impl MsgHead for NetPacket {}

/// A decoded network message.
pub enum NetMsg<'a> {
    Packet(&'a NetPacket, &'a [u8]),
    Terminate,
}

impl<'a> NetMsg<'a> {
    /// Decode a polled entry. `None` for unknown tags or garbled lengths.
    pub fn decode(msg: &'a InMsg<'_>) -> Option<Self> {
        match msg.ty() {
            NET_MSG_PACKET => {
                let head: &NetPacket = msg.head();
                let data = msg.payload().get(..head.len as usize)?;
                Some(Self::Packet(head, data))
            }
            MSG_TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// Send one Ethernet frame. Returns false when the ring is full (the caller
/// drops or retries; packet loss is the usual policy).
pub fn send_packet(tx: &mut TxQueue, ts: u64, port: u8, data: &[u8]) -> bool {
    assert!(
        data.len() <= tx.payload_capacity(),
        "packet too big ({}), can only fit up to {}",
        data.len(),
        tx.payload_capacity()
    );
    let Some(mut msg) = tx.alloc(ts) else {
        return false;
    };
    let head = msg.head_mut::<NetPacket>();
    head.len = data.len() as u16;
    head.port = port;
    msg.payload_mut()[..data.len()].copy_from_slice(data);
    msg.send(NET_MSG_PACKET);
    true
}
