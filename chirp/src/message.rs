//! The `Message` type and its addressing helpers: a small typed wire record, self-contained and
//! self-addressed, kept in the plain-struct-plus-bitset idiom used throughout this crate (see
//! `MessageFlags` below, modeled on the bit constants in `wire.rs`).

use crate::pool::BufferPool;
use crate::wire::{ACK, NOOP, REQ_ACK};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Internal state flags. `FREE_HEADER`/`FREE_DATA` track the stash-vs-heap distinction, but
/// since `Vec<u8>` always owns its storage in Rust there is nothing extra to free; they are set
/// purely so call sites and tests can observe "did this message's buffers come from the slot's
/// small-message optimization or not" without re-deriving it from length checks everywhere.
pub mod flags {
    pub const USED: u16 = 1 << 0;
    pub const FREE_HEADER: u16 = 1 << 1;
    pub const FREE_DATA: u16 = 1 << 2;
    pub const ACK_RECEIVED: u16 = 1 << 3;
    pub const WRITE_DONE: u16 = 1 << 4;
    pub const SEND_ACK: u16 = 1 << 5;
    pub const HAS_SLOT: u16 = 1 << 6;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Proto {
    V4,
    V6,
}

/// Addressing fields carried on every message: protocol, a 16-byte address (IPv4 is
/// left-packed the way `wire::encode_addr` does it), and a 32-bit port (the peer's *listening*
/// port, learned from the handshake record, not the ephemeral source port of an inbound TCP
/// connection).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Address {
    pub proto: Proto,
    pub addr: [u8; 16],
    pub port: u32,
}

impl Address {
    pub fn new(ip: IpAddr, port: u32) -> Address {
        let proto = match ip {
            IpAddr::V4(_) => Proto::V4,
            IpAddr::V6(_) => Proto::V6,
        };
        let mut addr = [0u8; 16];
        crate::wire::encode_addr(ip, &mut addr);
        Address { proto, addr, port }
    }

    pub fn from_text(proto: Proto, textual_ip: &str, port: u32) -> Option<Address> {
        let ip: IpAddr = textual_ip.parse().ok()?;
        match (proto, ip) {
            (Proto::V4, IpAddr::V4(_)) | (Proto::V6, IpAddr::V6(_)) => Some(Address::new(ip, port)),
            _ => None,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self.proto {
            Proto::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.addr[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            Proto::V6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port as u16)
    }
}

/// A key that identifies a `Remote`: protocol, address, and port, hashable/orderable so
/// it can key the engine's `IndexMap` of remotes.
pub type RemoteKey = (Proto, [u8; 16], u32);

pub fn remote_key(address: &Address) -> RemoteKey {
    (address.proto, address.addr, address.port)
}

/// A single message, as carried through the engine's queues and handed to the user's
/// callbacks. Identity is fixed at construction; `serial` is filled in by the writer at send
/// time; `header`/`data` own their buffers directly as `Vec<u8>` — ownership returns to
/// the caller via `release_slot`/`free_data`, without a manual free() since `Vec`'s `Drop`
/// already does that.
pub struct Message {
    pub identity: [u8; 16],
    pub serial: u32,
    pub kind: u8,
    pub header: Vec<u8>,
    pub data: Vec<u8>,
    pub address: Option<Address>,
    pub remote_identity: Option<[u8; 16]>,
    flags: u16,
    pub(crate) slot_id: Option<u8>,
    pub(crate) pool: Option<BufferPool>,
    send_callback: Option<SendCallback>,
}

impl Message {
    pub fn new() -> Message {
        Message {
            identity: chirp_support::random_identity(),
            serial: 0,
            kind: 0,
            header: Vec::new(),
            data: Vec::new(),
            address: None,
            remote_identity: None,
            flags: 0,
            slot_id: None,
            pool: None,
            send_callback: None,
        }
    }

    /// Attaches the callback `Handle::send_ts` was given, for the engine to invoke once this
    /// message finishes. Engine-internal; not part of the public send API.
    pub(crate) fn set_send_callback(&mut self, cb: Option<SendCallback>) {
        self.send_callback = cb;
    }

    pub(crate) fn take_send_callback(&mut self) -> Option<SendCallback> {
        self.send_callback.take()
    }

    pub fn set_address(&mut self, proto: Proto, textual_ip: &str, port: u32) -> bool {
        match Address::from_text(proto, textual_ip, port) {
            Some(addr) => {
                self.address = Some(addr);
                true
            }
            None => false,
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn set_data(&mut self, header: Vec<u8>, data: Vec<u8>) {
        self.header = header;
        self.data = data;
    }

    /// Drops `header`/`data` and clears the ownership flags; idempotent.
    pub fn free_data(&mut self) {
        self.header = Vec::new();
        self.data = Vec::new();
        self.flags &= !(flags::FREE_HEADER | flags::FREE_DATA);
    }

    pub fn identity(&self) -> [u8; 16] {
        self.identity
    }

    pub fn remote_identity(&self) -> Option<[u8; 16]> {
        self.remote_identity
    }

    pub fn has_slot(&self) -> bool {
        self.flags & flags::HAS_SLOT != 0
    }

    pub fn request_ack(&mut self, want: bool) {
        if want {
            self.kind |= REQ_ACK;
        } else {
            self.kind &= !REQ_ACK;
        }
    }

    pub fn is_req_ack(&self) -> bool {
        self.kind & REQ_ACK != 0
    }

    pub fn is_ack(&self) -> bool {
        self.kind & ACK != 0
    }

    pub fn is_noop(&self) -> bool {
        self.kind & NOOP != 0
    }

    pub(crate) fn flags(&self) -> u16 {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, bit: u16) {
        self.flags |= bit;
    }

    pub(crate) fn clear_flag(&mut self, bit: u16) {
        self.flags &= !bit;
    }

    pub(crate) fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }

    /// A sent message is finished once both halves of the handshake it participates in have
    /// completed: the bytes are on the wire (`WRITE_DONE`) and, for `REQ_ACK` messages,
    /// the peer's ack arrived (`ACK_RECEIVED`). Non-acked messages assert `ACK_RECEIVED`
    /// synchronously alongside `WRITE_DONE`, so this check covers both.
    pub(crate) fn is_finished(&self) -> bool {
        self.has_flag(flags::WRITE_DONE) && self.has_flag(flags::ACK_RECEIVED)
    }

    /// A NOOP template message, used by the Remote's connection-age probe.
    pub(crate) fn noop() -> Message {
        let mut msg = Message::new();
        msg.kind = NOOP;
        msg
    }

    pub(crate) fn ack_for(identity: [u8; 16], serial: u32) -> Message {
        let mut msg = Message::new();
        msg.identity = identity;
        msg.serial = serial;
        msg.kind = ACK;
        msg
    }
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

/// Outcome returned by `Engine::send`/`Handle::send_ts` immediately, before the write
/// completes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Success,
    Queued,
    Used,
    Shutdown,
    EnoMem,
}

pub type SendCallback = Arc<dyn Fn(&Message, crate::error::ChirpResult<()>) + Send + Sync>;
pub type ReceiveCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type ReleaseCallback = Arc<dyn Fn(&crate::error::ChirpResult<()>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_v4() {
        let addr = Address::from_text(Proto::V4, "127.0.0.1", 2998).unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 2998);
    }

    #[test]
    fn address_rejects_proto_mismatch() {
        assert!(Address::from_text(Proto::V6, "127.0.0.1", 2998).is_none());
    }

    #[test]
    fn finished_requires_both_flags() {
        let mut msg = Message::new();
        msg.set_flag(flags::WRITE_DONE);
        assert!(!msg.is_finished());
        msg.set_flag(flags::ACK_RECEIVED);
        assert!(msg.is_finished());
    }

    #[test]
    fn noop_template_carries_no_payload() {
        let noop = Message::noop();
        assert!(noop.is_noop());
        assert!(noop.header.is_empty());
        assert!(noop.data.is_empty());
    }
}
