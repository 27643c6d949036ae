// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Base message framing shared by every upper-layer protocol.
//
// Every ring entry is a 64-byte header followed by payload. The header's
// last byte is `own_type`: bit 7 is the ownership bit (0 = producer-owned /
// empty, 1 = consumer-owned / filled), bits 0..6 are the message type tag.
// Bytes [48..56) carry the producer's virtual timestamp, little-endian.

/// Protocol version spoken in the handshake intros.
pub const PROTO_VERSION: u64 = 1;

/// Upper-layer protocol identifiers.
pub const PROTO_ID_BASE: u64 = 0x00;
pub const PROTO_ID_NET: u64 = 0x01;
pub const PROTO_ID_PCIE: u64 = 0x02;
pub const PROTO_ID_MEM: u64 = 0x03;

/// Fixed header length; payload starts at this offset within an entry.
pub const MSG_HEADER_LEN: usize = 64;
/// Offset of the 64-bit little-endian timestamp within the header.
pub const MSG_TIMESTAMP_OFF: usize = 48;
/// Offset of the `own_type` byte within the header.
pub const MSG_OWN_TYPE_OFF: usize = 63;

/// Mask for the ownership bit in `own_type`.
pub const MSG_OWN_MASK: u8 = 0x80;
/// Entry is owned by the producer (empty).
pub const MSG_OWN_PRODUCER: u8 = 0x00;
/// Entry is owned by the consumer (filled).
pub const MSG_OWN_CONSUMER: u8 = 0x80;

/// Mask for the message type tag in `own_type`.
pub const MSG_TYPE_MASK: u8 = 0x7f;

/// Pure sync heartbeat; carries nothing but its timestamp.
pub const MSG_TYPE_SYNC: u8 = 0x00;
/// Peer termination notice; receipt is optional.
pub const MSG_TYPE_TERMINATE: u8 = 0x01;
/// First tag available to upper-layer protocols.
pub const MSG_TYPE_UPPER_START: u8 = 0x40;

/// Marker for wire-exact message head structs.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, exactly [`MSG_HEADER_LEN`] bytes with
/// every field naturally aligned, and valid for any bit pattern.
pub unsafe trait MsgHead: Sized {}

/// Raw bytes of an intro struct, for appending to a handshake message.
pub fn intro_bytes<T: Copy>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// Read an intro struct back out of a received blob. `None` if too short.
pub fn intro_from_bytes<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// The bare base header: padding, timestamp, `own_type`.
#[repr(C)]
pub struct BaseMsgHeader {
    _pad: [u8; 48],
    _timestamp: u64,
    _pad2: [u8; 7],
    _own_type: u8,
}

const _: () = assert!(std::mem::size_of::<BaseMsgHeader>() == MSG_HEADER_LEN);

unsafe impl MsgHead for BaseMsgHeader {}
