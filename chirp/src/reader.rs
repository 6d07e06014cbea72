//! The per-connection reader state machine: `Handshake -> Wait -> Slot -> Header -> Data
//! -> Wait`. Accumulate into a fixed-size header, decide what comes next, remember a resume
//! cursor across partial reads, then walk through a variable-length body one state at a time.

use crate::buffer::Buffer;
use crate::config::{ENVELOPE_LEN, HANDSHAKE_LEN};
use crate::error::{ChirpError, ChirpResult, ErrorKind};
use crate::message::{Address, Message};
use crate::pool::{BufferPool, Slot};
use crate::wire::{Envelope, Handshake};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Handshake,
    Wait,
    Slot,
    Header,
    Data,
}

/// Addressing context the reader stamps onto every message it delivers: the
/// connection's peer address and the peer's identity, both only known once the handshake (or,
/// for `address`, the socket's peer address) has been resolved.
#[derive(Clone)]
pub struct DeliveryContext {
    pub address: Option<Address>,
    pub remote_identity: Option<[u8; 16]>,
}

/// Events the reader surfaces to its driving `Connection` as it consumes bytes. Delivery and
/// pause are mutually exclusive outcomes of the same `Slot` step.
pub enum ReaderEvent {
    Handshake(Handshake),
    Ack { identity: [u8; 16], serial: u32 },
    Noop,
    Deliver(Message),
}

pub struct Reader {
    state: State,
    pending: Vec<u8>,
    envelope: Option<Envelope>,
    slot_id: Option<u8>,
    slot: Slot,
    paused: bool,
}

impl Reader {
    pub fn new() -> Reader {
        Reader {
            state: State::Handshake,
            pending: Vec::with_capacity(ENVELOPE_LEN),
            envelope: None,
            slot_id: None,
            slot: Slot::new(),
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Consumes bytes from `buf` (the connection's plaintext inbound buffer) until either the
    /// buffer runs dry or the pool is exhausted mid-`Slot` step. Returns `true` if the reader
    /// paused on pool exhaustion (the connection should stop reading until a slot frees up),
    /// `false` if it simply ran out of bytes for now.
    pub fn feed(
        &mut self,
        buf: &mut Buffer,
        pool: &BufferPool,
        max_msg_size: u64,
        ctx: &DeliveryContext,
        on_event: &mut dyn FnMut(ReaderEvent),
    ) -> ChirpResult<bool> {
        loop {
            if self.state == State::Slot {
                match self.try_acquire(pool, ctx, on_event)? {
                    true => continue,
                    false => {
                        self.paused = true;
                        return Ok(true);
                    }
                }
            }

            match self.state {
                State::Handshake => {
                    if !self.fill_pending(buf, HANDSHAKE_LEN) {
                        return Ok(false);
                    }
                    let hs = Handshake::decode(&self.pending)?;
                    self.pending.clear();
                    self.state = State::Wait;
                    on_event(ReaderEvent::Handshake(hs));
                }
                State::Wait => {
                    if !self.fill_pending(buf, ENVELOPE_LEN) {
                        return Ok(false);
                    }
                    let env = Envelope::decode(&self.pending)?;
                    self.pending.clear();
                    env.validate()?;

                    let total = env.header_len as u64 + env.data_len as u64;
                    if total > max_msg_size {
                        return Err(ChirpError::new(ErrorKind::EnoMem));
                    }

                    if env.is_ack() {
                        on_event(ReaderEvent::Ack { identity: env.identity, serial: env.serial });
                        continue;
                    }
                    if env.is_noop() {
                        on_event(ReaderEvent::Noop);
                        continue;
                    }

                    self.envelope = Some(env);
                    self.slot.reset();
                    self.state = State::Slot;
                }
                State::Slot => unreachable!("handled above"),
                State::Header => {
                    let env = self.envelope.expect("envelope set before Header state");
                    if !self.fill_slot_buf(buf, true, env.header_len as usize) {
                        return Ok(false);
                    }
                    if env.data_len > 0 {
                        self.state = State::Data;
                    } else {
                        self.deliver(ctx, pool, on_event);
                        self.state = State::Wait;
                    }
                }
                State::Data => {
                    let env = self.envelope.expect("envelope set before Data state");
                    if !self.fill_slot_buf(buf, false, env.data_len as usize) {
                        return Ok(false);
                    }
                    self.deliver(ctx, pool, on_event);
                    self.state = State::Wait;
                }
            }
        }
    }

    /// Called once the connection has freed a slot and the reader was paused: gives the
    /// pool another chance and, if bytes are already buffered, lets the caller re-drive `feed`.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    fn try_acquire(
        &mut self,
        pool: &BufferPool,
        ctx: &DeliveryContext,
        on_event: &mut dyn FnMut(ReaderEvent),
    ) -> ChirpResult<bool> {
        let env = self.envelope.expect("envelope set before Slot state");
        let slot_id = match pool.acquire() {
            Some(id) => id,
            None => return Ok(false),
        };
        self.slot_id = Some(slot_id);

        if env.header_len == 0 && env.data_len == 0 {
            self.deliver(ctx, pool, on_event);
            self.state = State::Wait;
        } else if env.header_len > 0 {
            self.state = State::Header;
        } else {
            self.state = State::Data;
        }
        Ok(true)
    }

    fn fill_pending(&mut self, buf: &mut Buffer, total: usize) -> bool {
        if self.pending.len() >= total {
            return true;
        }
        let available = buf.read_slice();
        let take = (total - self.pending.len()).min(available.len());
        if take == 0 {
            return false;
        }
        self.pending.extend_from_slice(&available[..take]);
        buf.move_head(take);
        self.pending.len() >= total
    }

    fn fill_slot_buf(&mut self, buf: &mut Buffer, is_header: bool, total: usize) -> bool {
        let dest = if is_header { &mut self.slot.header } else { &mut self.slot.data };
        if dest.len() >= total {
            return true;
        }
        let available = buf.read_slice();
        let take = (total - dest.len()).min(available.len());
        if take == 0 {
            return dest.len() >= total;
        }
        dest.extend_from_slice(&available[..take]);
        buf.move_head(take);
        dest.len() >= total
    }

    fn deliver(&mut self, ctx: &DeliveryContext, pool: &BufferPool, on_event: &mut dyn FnMut(ReaderEvent)) {
        let env = self.envelope.take().expect("envelope set before delivery");
        let slot_id = self.slot_id.take().expect("slot acquired before delivery");
        let mut msg = Message::new();
        msg.identity = env.identity;
        msg.serial = env.serial;
        msg.kind = env.kind;
        msg.header = std::mem::take(&mut self.slot.header);
        msg.data = std::mem::take(&mut self.slot.data);
        msg.address = ctx.address;
        msg.remote_identity = ctx.remote_identity;
        if env.is_req_ack() {
            msg.set_flag(crate::message::flags::SEND_ACK);
        }
        msg.set_flag(crate::message::flags::HAS_SLOT);
        msg.slot_id = Some(slot_id);
        msg.pool = Some(pool.clone());
        on_event(ReaderEvent::Deliver(msg));
    }
}

impl Default for Reader {
    fn default() -> Reader {
        Reader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::REQ_ACK;
    use std::io::Cursor;

    fn push(buf: &mut Buffer, bytes: &[u8]) {
        buf.ingress(&mut Cursor::new(bytes.to_vec())).unwrap();
    }

    #[test]
    fn handshake_then_empty_message_roundtrip() {
        let mut reader = Reader::new();
        let mut buf = Buffer::new(4096);
        let pool = BufferPool::new(4);
        let ctx = DeliveryContext { address: None, remote_identity: Some([9u8; 16]) };

        let hs = Handshake { port: 2998, identity: [1u8; 16] };
        let mut hs_bytes = [0u8; HANDSHAKE_LEN];
        hs.encode(&mut hs_bytes);
        push(&mut buf, &hs_bytes);

        let env = Envelope { identity: [2u8; 16], serial: 7, kind: REQ_ACK, header_len: 0, data_len: 0 };
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        push(&mut buf, &env_bytes);

        let mut events = Vec::new();
        let mut on_event = |e: ReaderEvent| events.push(e);
        let paused = reader.feed(&mut buf, &pool, 1024 * 1024, &ctx, &mut on_event).unwrap();
        assert!(!paused);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ReaderEvent::Handshake(got) => assert_eq!(*got, hs),
            _ => panic!("expected handshake"),
        }
        match &events[1] {
            ReaderEvent::Deliver(msg) => {
                assert_eq!(msg.serial, 7);
                assert!(msg.has_slot());
                assert_eq!(msg.remote_identity, Some([9u8; 16]));
            }
            _ => panic!("expected deliver"),
        }
    }

    #[test]
    fn header_and_data_are_assembled_across_partial_reads() {
        let mut reader = Reader::new();
        reader.state = State::Wait; // skip handshake for this test
        let mut buf = Buffer::new(4096);
        let pool = BufferPool::new(4);
        let ctx = DeliveryContext { address: None, remote_identity: None };

        let env = Envelope { identity: [3u8; 16], serial: 1, kind: 0, header_len: 3, data_len: 4 };
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        push(&mut buf, &env_bytes);
        push(&mut buf, b"abc");

        let mut events = Vec::new();
        let mut on_event = |e: ReaderEvent| events.push(e);
        let paused = reader.feed(&mut buf, &pool, 1024 * 1024, &ctx, &mut on_event).unwrap();
        assert!(!paused);
        assert!(events.is_empty(), "data not fully received yet");

        push(&mut buf, b"wxyz");
        reader.feed(&mut buf, &pool, 1024 * 1024, &ctx, &mut on_event).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReaderEvent::Deliver(msg) => {
                assert_eq!(msg.header, b"abc");
                assert_eq!(msg.data, b"wxyz");
            }
            _ => panic!("expected deliver"),
        }
    }

    #[test]
    fn pool_exhaustion_pauses_reader() {
        let mut reader = Reader::new();
        reader.state = State::Wait;
        let mut buf = Buffer::new(4096);
        let pool = BufferPool::new(1);
        pool.acquire(); // exhaust it up front
        let ctx = DeliveryContext { address: None, remote_identity: None };

        let env = Envelope { identity: [4u8; 16], serial: 1, kind: 0, header_len: 0, data_len: 0 };
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        push(&mut buf, &env_bytes);

        let mut events = Vec::new();
        let mut on_event = |e: ReaderEvent| events.push(e);
        let paused = reader.feed(&mut buf, &pool, 1024 * 1024, &ctx, &mut on_event).unwrap();
        assert!(paused);
        assert!(reader.is_paused());
        assert!(events.is_empty());
    }

    #[test]
    fn oversize_message_is_enomem() {
        let mut reader = Reader::new();
        reader.state = State::Wait;
        let mut buf = Buffer::new(4096);
        let pool = BufferPool::new(4);
        let ctx = DeliveryContext { address: None, remote_identity: None };

        let env = Envelope { identity: [5u8; 16], serial: 1, kind: 0, header_len: 0, data_len: 100 };
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        push(&mut buf, &env_bytes);

        let mut on_event = |_: ReaderEvent| {};
        let err = reader.feed(&mut buf, &pool, 50, &ctx, &mut on_event).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnoMem);
    }

    #[test]
    fn malformed_ack_is_protocol_error() {
        let mut reader = Reader::new();
        reader.state = State::Wait;
        let mut buf = Buffer::new(4096);
        let pool = BufferPool::new(4);
        let ctx = DeliveryContext { address: None, remote_identity: None };

        let env = Envelope { identity: [6u8; 16], serial: 1, kind: crate::wire::ACK, header_len: 0, data_len: 10 };
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        push(&mut buf, &env_bytes);

        let mut on_event = |_: ReaderEvent| {};
        let err = reader.feed(&mut buf, &pool, 1024 * 1024, &ctx, &mut on_event).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
