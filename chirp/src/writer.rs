//! Per-connection writer: one outstanding message at a time, a send-timeout, and the
//! "finished only once both `WRITE_DONE` and `ACK_RECEIVED` are set" rule. Higher-level
//! queueing (which message goes next) lives in `remote.rs`; this module only knows how to
//! encode one message into a scratch buffer, copy it into the egress buffer, bail out with
//! `Wait` if it doesn't fit yet, and track the message's completion against a per-send timeout.

use crate::config::ENVELOPE_LEN;
use crate::error::{ChirpError, ChirpResult, ErrorKind};
use crate::message::{flags, Message};
use crate::wire::Envelope;
use std::time::{Duration, Instant};

struct Outstanding {
    message: Message,
    deadline: Instant,
}

pub struct Writer {
    outstanding: Option<Outstanding>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { outstanding: None }
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Encodes `message` (envelope + header + data) for transmission, assigns its `serial`
    /// (the caller — the owning `Remote` — has already incremented its counter), and starts the
    /// per-send timeout. Returns the bytes to append to the connection's plaintext-out buffer.
    pub fn begin(&mut self, mut message: Message, serial: u32, timeout: Duration, now: Instant) -> ChirpResult<Vec<u8>> {
        if self.outstanding.is_some() {
            return Err(ChirpError::new(ErrorKind::Busy));
        }

        message.serial = serial;
        message.set_flag(flags::USED);

        // `header.len()` fitting in a u16 is enforced by `Engine::dispatch_send` before a
        // message ever reaches a queue a `Writer` drains; an overflow here would desync the
        // envelope's advertised `header_len` from the bytes actually written below.
        debug_assert!(message.header.len() <= u16::MAX as usize, "oversize header reached the writer");
        let env = Envelope {
            identity: message.identity,
            serial,
            kind: message.kind,
            header_len: message.header.len() as u16,
            data_len: message.data.len() as u32,
        };

        let mut out = Vec::with_capacity(ENVELOPE_LEN + message.header.len() + message.data.len());
        let mut env_bytes = [0u8; ENVELOPE_LEN];
        env.encode(&mut env_bytes);
        out.extend_from_slice(&env_bytes);
        out.extend_from_slice(&message.header);
        out.extend_from_slice(&message.data);

        // Non-acked messages are considered acked the instant the bytes are handed off, so
        // `try_finish` only has to wait on `WRITE_DONE` for them.
        if !message.is_req_ack() {
            message.set_flag(flags::ACK_RECEIVED);
        }

        self.outstanding = Some(Outstanding { message, deadline: now + timeout });
        Ok(out)
    }

    /// The connection calls this once the encoded bytes have actually left the plaintext
    /// buffer (for plaintext connections, that means "handed to the socket"; for TLS
    /// connections, "handed to the TLS engine", since from the writer's point of view bytes are
    /// gone once a downstream layer owns them). Returns the message if it is now finished.
    pub fn on_write_complete(&mut self) -> Option<Message> {
        if let Some(outstanding) = &mut self.outstanding {
            outstanding.message.set_flag(flags::WRITE_DONE);
        }
        self.try_finish()
    }

    /// Matches an inbound ack (by identity) against the outstanding
    /// message. Returns the message if this ack is what finishes it.
    pub fn on_ack_received(&mut self, identity: [u8; 16]) -> Option<Message> {
        if let Some(outstanding) = &self.outstanding {
            if outstanding.message.identity != identity {
                return None;
            }
        } else {
            return None;
        }
        self.outstanding.as_mut().unwrap().message.set_flag(flags::ACK_RECEIVED);
        self.try_finish()
    }

    /// Connect/write failure or timeout: force both completion flags so the message is
    /// reported exactly once, with the given failure kind.
    pub fn fail(&mut self, kind: ErrorKind) -> Option<(Message, ChirpError)> {
        let mut outstanding = self.outstanding.take()?;
        outstanding.message.set_flag(flags::WRITE_DONE);
        outstanding.message.set_flag(flags::ACK_RECEIVED);
        outstanding.message.clear_flag(flags::USED);
        Some((outstanding.message, ChirpError::new(kind)))
    }

    pub fn check_timeout(&self, now: Instant) -> bool {
        match &self.outstanding {
            Some(outstanding) => now >= outstanding.deadline,
            None => false,
        }
    }

    /// The outstanding message's send-timeout deadline, if any; used by the engine to size its
    /// poll timeout so a timeout fires promptly rather than waiting for the next unrelated event.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.deadline)
    }

    fn try_finish(&mut self) -> Option<Message> {
        let finished = matches!(&self.outstanding, Some(o) if o.message.is_finished());
        if !finished {
            return None;
        }
        let mut outstanding = self.outstanding.take().unwrap();
        outstanding.message.clear_flag(flags::USED);
        Some(outstanding.message)
    }
}

impl Default for Writer {
    fn default() -> Writer {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_acked_message_finishes_on_write_complete() {
        let mut writer = Writer::new();
        let msg = Message::new();
        writer.begin(msg, 1, Duration::from_secs(5), Instant::now()).unwrap();
        assert!(writer.is_busy());
        let finished = writer.on_write_complete();
        assert!(finished.is_some());
        assert!(!writer.is_busy());
    }

    #[test]
    fn acked_message_waits_for_ack() {
        let mut writer = Writer::new();
        let mut msg = Message::new();
        msg.request_ack(true);
        let identity = msg.identity();
        writer.begin(msg, 1, Duration::from_secs(5), Instant::now()).unwrap();

        assert!(writer.on_write_complete().is_none());
        assert!(writer.is_busy(), "still awaiting ack");

        let finished = writer.on_ack_received(identity);
        assert!(finished.is_some());
        assert!(!writer.is_busy());
    }

    #[test]
    fn ack_for_wrong_identity_is_ignored() {
        let mut writer = Writer::new();
        let mut msg = Message::new();
        msg.request_ack(true);
        writer.begin(msg, 1, Duration::from_secs(5), Instant::now()).unwrap();
        writer.on_write_complete();

        assert!(writer.on_ack_received([0xffu8; 16]).is_none());
        assert!(writer.is_busy());
    }

    #[test]
    fn second_begin_while_busy_is_rejected() {
        let mut writer = Writer::new();
        writer.begin(Message::new(), 1, Duration::from_secs(5), Instant::now()).unwrap();
        let err = writer.begin(Message::new(), 2, Duration::from_secs(5), Instant::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn timeout_fails_outstanding_message() {
        let mut writer = Writer::new();
        let mut msg = Message::new();
        msg.request_ack(true);
        let now = Instant::now();
        writer.begin(msg, 1, Duration::from_millis(10), now).unwrap();
        assert!(!writer.check_timeout(now));
        assert!(writer.check_timeout(now + Duration::from_millis(20)));

        let (failed, err) = writer.fail(ErrorKind::Timeout).unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!failed.has_flag(flags::USED));
        assert!(!writer.is_busy());
    }
}
