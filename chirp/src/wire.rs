//! Fixed-width wire records, both big-endian: a category/type byte read first, remaining fixed
//! fields read with `byteorder`, variable-length bodies handled by the caller.

use crate::config::{ENVELOPE_LEN, HANDSHAKE_LEN};
use crate::error::{ChirpError, ChirpResult, ErrorKind};
use byteorder::{BigEndian, ByteOrder};
use std::net::IpAddr;

/// Message type bits. Plain `u8` constants rather than the `bitflags` crate: these three bits
/// are the entire type space, so a full bitflags-style type would be overkill.
pub const REQ_ACK: u8 = 0b0000_0001;
pub const ACK: u8 = 0b0000_0010;
pub const NOOP: u8 = 0b0000_0100;

/// The 18-byte record exchanged once, immediately after connect/accept, before any other bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Handshake {
    pub port: u16,
    pub identity: [u8; 16],
}

impl Handshake {
    pub fn encode(&self, out: &mut [u8; HANDSHAKE_LEN]) {
        BigEndian::write_u16(&mut out[0..2], self.port);
        out[2..18].copy_from_slice(&self.identity);
    }

    pub fn decode(buf: &[u8]) -> ChirpResult<Handshake> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(ChirpError::new(ErrorKind::More));
        }
        let port = BigEndian::read_u16(&buf[0..2]);
        let mut identity = [0u8; 16];
        identity.copy_from_slice(&buf[2..18]);
        Ok(Handshake { port, identity })
    }
}

/// The 27-byte envelope that precedes every message body on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Envelope {
    pub identity: [u8; 16],
    pub serial: u32,
    pub kind: u8,
    pub header_len: u16,
    pub data_len: u32,
}

impl Envelope {
    pub fn encode(&self, out: &mut [u8; ENVELOPE_LEN]) {
        out[0..16].copy_from_slice(&self.identity);
        BigEndian::write_u32(&mut out[16..20], self.serial);
        out[20] = self.kind;
        BigEndian::write_u16(&mut out[21..23], self.header_len);
        BigEndian::write_u32(&mut out[23..27], self.data_len);
    }

    pub fn decode(buf: &[u8]) -> ChirpResult<Envelope> {
        if buf.len() < ENVELOPE_LEN {
            return Err(ChirpError::new(ErrorKind::More));
        }
        let mut identity = [0u8; 16];
        identity.copy_from_slice(&buf[0..16]);
        let serial = BigEndian::read_u32(&buf[16..20]);
        let kind = buf[20];
        let header_len = BigEndian::read_u16(&buf[21..23]);
        let data_len = BigEndian::read_u32(&buf[23..27]);
        Ok(Envelope { identity, serial, kind, header_len, data_len })
    }

    pub fn is_ack(&self) -> bool {
        self.kind & ACK != 0
    }

    pub fn is_noop(&self) -> bool {
        self.kind & NOOP != 0
    }

    pub fn is_req_ack(&self) -> bool {
        self.kind & REQ_ACK != 0
    }

    /// An ACK/NOOP MUST carry no body and MUST NOT request an ack of itself.
    pub fn validate(&self) -> ChirpResult<()> {
        if self.is_ack() || self.is_noop() {
            if self.header_len != 0 || self.data_len != 0 || self.is_req_ack() {
                return Err(ChirpError::new(ErrorKind::ProtocolError));
            }
        }
        Ok(())
    }
}

/// 4/16 for IPv4/IPv6 respectively, left-padded into the fixed 16-byte address field used by
/// `Message` addressing.
pub fn encode_addr(addr: IpAddr, out: &mut [u8; 16]) {
    match addr {
        IpAddr::V4(v4) => {
            out[..4].copy_from_slice(&v4.octets());
            out[4..].fill(0);
        }
        IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()),
    }
}
