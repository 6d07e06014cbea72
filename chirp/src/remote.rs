//! The `Remote`: a peer's identity plus its queues, independent of whichever
//! `Connection` currently serves it. `process_queues` is the single function the engine re-runs
//! on every event that might unblock sending: a per-peer queue, drained opportunistically as
//! connections allow, split into a control/main two-queue priority with a synchronous-mode
//! single-outstanding-ack discipline.

use crate::error::ErrorKind;
use crate::message::{Message, Proto, RemoteKey};
use crate::writer::Writer;
use mio::Token;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct Remote {
    key: RemoteKey,
    control_queue: VecDeque<Message>,
    main_queue: VecDeque<Message>,
    /// Tracks which in-flight message (by identity) synchronous mode is waiting on, for parity
    /// with the data model. The writer is what actually matches the ack and finishes the
    /// message; this field exists so `process_queues` can refuse to start a second synchronous
    /// send while one is outstanding without reaching into the writer's internals.
    wait_ack_identity: Option<[u8; 16]>,
    serial: u32,
    last_use: Instant,
    conn_blocked: bool,
    connection: Option<Token>,
}

/// Work `process_queues` decided to do: bytes to hand the connection for its plaintext-out
/// buffer, or nothing because nothing is runnable right now.
pub struct Dispatch {
    pub bytes: Vec<u8>,
    pub is_control: bool,
}

impl Remote {
    pub fn new(key: RemoteKey, now: Instant) -> Remote {
        Remote {
            key,
            control_queue: VecDeque::new(),
            main_queue: VecDeque::new(),
            wait_ack_identity: None,
            serial: chirp_support::random_serial(),
            last_use: now,
            conn_blocked: false,
            connection: None,
        }
    }

    pub fn key(&self) -> RemoteKey {
        self.key
    }

    pub fn proto(&self) -> Proto {
        self.key.0
    }

    pub fn connection_token(&self) -> Option<Token> {
        self.connection
    }

    pub fn set_connection(&mut self, token: Option<Token>) {
        self.connection = token;
    }

    pub fn block(&mut self) {
        self.conn_blocked = true;
    }

    pub fn unblock(&mut self) {
        self.conn_blocked = false;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_use = now;
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn is_empty(&self) -> bool {
        self.control_queue.is_empty() && self.main_queue.is_empty()
    }

    /// A connect should be initiated when there is no connection, the remote isn't debounced,
    /// and there is work waiting for it.
    pub fn needs_connect(&self) -> bool {
        self.connection.is_none() && !self.conn_blocked && !self.is_empty()
    }

    /// Idle beyond the reuse window, with no connection and nothing queued: eligible for the
    /// garbage collector to remove.
    pub fn is_collectible(&self, now: Instant, reuse_time: Duration) -> bool {
        self.connection.is_none() && !self.conn_blocked && now.duration_since(self.last_use) > reuse_time
    }

    pub fn enqueue_control(&mut self, msg: Message) {
        self.control_queue.push_back(msg);
    }

    /// Connection-age probe: a user message headed to a Remote that hasn't been used in a
    /// while gets a NOOP queued ahead of it, so a silently-dead peer connection is discovered by
    /// the probe rather than by losing the user's own message.
    pub fn enqueue_main(&mut self, msg: Message, now: Instant, reuse_time: Duration) {
        if now.duration_since(self.last_use) > reuse_time.mul_f64(0.75) {
            self.control_queue.push_back(Message::noop());
        }
        self.main_queue.push_back(msg);
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    /// Drains every queued message (control and main) with `reason`, for engine shutdown or GC
    /// collection.
    pub fn abort_queued(&mut self, reason: ErrorKind) -> Vec<(Message, ErrorKind)> {
        self.control_queue
            .drain(..)
            .chain(self.main_queue.drain(..))
            .map(|m| (m, reason))
            .collect()
    }

    /// Aborts exactly one queued message per shutdown call; the rest survive for the next
    /// connection attempt.
    pub fn abort_one_queued(&mut self, reason: ErrorKind) -> Option<(Message, ErrorKind)> {
        self.control_queue
            .pop_front()
            .or_else(|| self.main_queue.pop_front())
            .map(|m| (m, reason))
    }

    pub fn clear_wait_ack(&mut self, identity: [u8; 16]) {
        if self.wait_ack_identity == Some(identity) {
            self.wait_ack_identity = None;
        }
    }

    /// Drains the control/main queues onto `writer` in priority order. Deciding whether to
    /// connect and whether the connection is ready is the engine's job, since it needs the
    /// connection table; this only handles "the connection is ready, what goes next".
    /// Returns the bytes to hand the connection's plaintext-out buffer, if anything was
    /// runnable.
    pub fn process_queues(&mut self, writer: &mut Writer, synchronous: bool, timeout: Duration, now: Instant) -> Option<Dispatch> {
        if writer.is_busy() {
            return None;
        }

        if let Some(msg) = self.control_queue.pop_front() {
            let serial = self.next_serial();
            let bytes = writer.begin(msg, serial, timeout, now).ok()?;
            self.touch(now);
            return Some(Dispatch { bytes, is_control: true });
        }

        if self.main_queue.is_empty() {
            return None;
        }

        if synchronous {
            if self.wait_ack_identity.is_some() {
                return None;
            }
            let mut msg = self.main_queue.pop_front().unwrap();
            msg.request_ack(true);
            let identity = msg.identity();
            let serial = self.next_serial();
            let bytes = writer.begin(msg, serial, timeout, now).ok()?;
            self.wait_ack_identity = Some(identity);
            self.touch(now);
            Some(Dispatch { bytes, is_control: false })
        } else {
            let msg = self.main_queue.pop_front().unwrap();
            let serial = self.next_serial();
            let bytes = writer.begin(msg, serial, timeout, now).ok()?;
            self.touch(now);
            Some(Dispatch { bytes, is_control: false })
        }
    }
}
