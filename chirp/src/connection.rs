//! A single TCP (optionally TLS) session: owns the socket plus in/out buffers, drives them
//! through a state machine, and exposes `readable()`/`writable()` hooks for the poll loop. Also
//! owns the handshake sub-states, the TLS buffer-pair pump, and an init-flag shutdown bitset
//! that makes teardown idempotent.

use crate::buffer::Buffer;
use crate::config::{ENVELOPE_LEN, HANDSHAKE_LEN};
use crate::error::{ChirpError, ChirpResult, ErrorKind};
use crate::message::{Address, Message, RemoteKey};
use crate::pool::BufferPool;
use crate::reader::{DeliveryContext, Reader, ReaderEvent};
use crate::wire::Handshake;
use crate::writer::Writer;
use chirp_support::TlsEngine;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Cursor, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    /// TLS record layer still negotiating; reads are pumped but never handed to the reader.
    TlsHandshake,
    /// Past the TLS handshake (or TLS disabled); waiting for the peer's Chirp handshake record.
    Handshake,
    Established,
    ShuttingDown,
}

mod init_flags {
    pub const HANDSHAKE_SENT: u8 = 1 << 0;
    pub const ESTABLISHED: u8 = 1 << 1;
    pub const SHUTTING_DOWN: u8 = 1 << 2;
    pub const CLOSED: u8 = 1 << 3;
}

/// Events a poll tick on this connection can surface to the engine.
pub enum ConnEvent {
    HandshakeComplete { peer_identity: [u8; 16], peer_port: u16 },
    Ack { identity: [u8; 16], serial: u32 },
    Noop,
    Deliver(Message),
}

pub struct Connection {
    pub token: Token,
    stream: TcpStream,
    tls: Option<Box<dyn TlsEngine>>,
    plaintext_in: Buffer,
    plaintext_out: Buffer,
    ciphertext_in: Buffer,
    ciphertext_out: Buffer,
    reader: Reader,
    writer: Writer,
    pool: BufferPool,
    state: State,
    init_flags: u8,
    closing_tasks: u8,
    pub remote_key: Option<RemoteKey>,
    pub peer_addr: SocketAddr,
    local_identity: [u8; 16],
    local_port: u16,
    peer_identity: Option<[u8; 16]>,
    last_use: Instant,
    connect_deadline: Option<Instant>,
    max_msg_size: u64,
    pub outbound: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        outbound: bool,
        local_identity: [u8; 16],
        local_port: u16,
        max_slots: u8,
        max_msg_size: u64,
        buffer_size: usize,
        tls: Option<Box<dyn TlsEngine>>,
        now: Instant,
        connect_timeout: Option<Duration>,
    ) -> Connection {
        let state = if tls.is_some() { State::TlsHandshake } else { State::Handshake };

        let mut conn = Connection {
            token,
            stream,
            tls,
            plaintext_in: Buffer::new(buffer_size),
            plaintext_out: Buffer::new(buffer_size),
            ciphertext_in: Buffer::new(buffer_size),
            ciphertext_out: Buffer::new(buffer_size),
            reader: Reader::new(),
            writer: Writer::new(),
            pool: BufferPool::new(max_slots),
            state,
            init_flags: 0,
            closing_tasks: 1,
            remote_key: None,
            peer_addr,
            local_identity,
            local_port,
            peer_identity: None,
            last_use: now,
            connect_deadline: connect_timeout.map(|d| now + d),
            max_msg_size,
            outbound,
        };

        conn.pool.set_conn_token(token);
        conn.send_handshake();
        conn
    }

    /// The deadline the engine's poll loop should wake up for, if this connection's writer has
    /// an outstanding send-timeout running. `None` means this connection has nothing
    /// time-sensitive in flight right now.
    pub fn next_send_deadline(&self) -> Option<Instant> {
        self.writer.deadline()
    }

    fn send_handshake(&mut self) {
        let hs = Handshake { port: self.local_port, identity: self.local_identity };
        let mut bytes = [0u8; HANDSHAKE_LEN];
        hs.encode(&mut bytes);
        self.queue_plaintext(&bytes);
        self.init_flags |= init_flags::HANDSHAKE_SENT;
    }

    fn delivery_ctx(&self) -> DeliveryContext {
        let address = self.remote_key.and_then(|(proto, addr, port)| {
            Some(Address { proto, addr, port })
        });
        DeliveryContext { address, remote_identity: self.peer_identity }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Established)
    }

    pub fn wants_read(&self) -> bool {
        !self.reader.is_paused()
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn writer_mut(&mut self) -> &mut Writer {
        &mut self.writer
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Called once the connection's own TCP `connect()` has completed (outbound only); clears
    /// the connect-timeout deadline so the garbage collector stops watching it.
    pub fn connect_established(&mut self) {
        self.connect_deadline = None;
    }

    pub fn check_connect_timeout(&self, now: Instant) -> bool {
        matches!(self.connect_deadline, Some(deadline) if now >= deadline)
    }

    pub fn check_send_timeout(&self, now: Instant) -> bool {
        self.writer.check_timeout(now)
    }

    /// Queues plaintext bytes for transmission, routing through TLS first when enabled. Used
    /// both for the outgoing handshake and for writer-produced message bytes.
    fn queue_plaintext(&mut self, bytes: &[u8]) {
        match &mut self.tls {
            Some(tls) => {
                let _ = tls.feed_plaintext(bytes);
                self.pump_tls_egress();
            }
            None => {
                self.plaintext_out.ingress(&mut Cursor::new(bytes.to_vec())).ok();
            }
        }
    }

    fn pump_tls_egress(&mut self) {
        if let Some(tls) = &mut self.tls {
            let mut out = Vec::new();
            if tls.drain_ciphertext(&mut out).is_ok() && !out.is_empty() {
                self.ciphertext_out.ingress(&mut Cursor::new(out)).ok();
            }
        }
    }

    /// Hands bytes the engine already produced via `Remote::process_queues` (the writer's
    /// `begin()` already ran against this connection's own `Writer`) to the egress path.
    pub fn flush_dispatch(&mut self, bytes: Vec<u8>) {
        self.queue_plaintext(&bytes);
    }

    /// Socket became readable: pull bytes in, run them through TLS if enabled, then feed the
    /// plaintext reader. Returns the events produced, in order.
    pub fn readable(&mut self, now: Instant) -> ChirpResult<Vec<ConnEvent>> {
        let mut events = Vec::new();

        match &mut self.tls {
            Some(_) => {
                self.ciphertext_in.ingress(&mut self.stream)?;
                let cipher = self.ciphertext_in.read_slice().to_vec();
                let consumed = self.ciphertext_in.len();
                if !cipher.is_empty() {
                    let tls = self.tls.as_mut().unwrap();
                    tls.feed_ciphertext(&cipher).map_err(ChirpError::from)?;
                    self.ciphertext_in.move_head(consumed);

                    let mut plain = Vec::new();
                    tls.drain_plaintext(&mut plain).map_err(ChirpError::from)?;
                    if !plain.is_empty() {
                        self.plaintext_in.ingress(&mut Cursor::new(plain)).ok();
                    }
                    self.pump_tls_egress();
                }

                if self.state == State::TlsHandshake {
                    if self.tls.as_ref().unwrap().handshake_complete() {
                        self.state = State::Handshake;
                    } else {
                        return Ok(events);
                    }
                }
            }
            None => {
                self.plaintext_in.ingress(&mut self.stream)?;
            }
        }

        self.last_use = now;
        self.drain_reader(&mut events)?;
        Ok(events)
    }

    fn drain_reader(&mut self, events: &mut Vec<ConnEvent>) -> ChirpResult<()> {
        let ctx = self.delivery_ctx();
        let pool = self.pool.clone();
        let max_msg_size = self.max_msg_size;

        let mut local_events = Vec::new();
        {
            let mut sink = |e: ReaderEvent| local_events.push(e);
            self.reader.feed(&mut self.plaintext_in, &pool, max_msg_size, &ctx, &mut sink)?;
        }

        for e in local_events {
            match e {
                ReaderEvent::Handshake(hs) => {
                    self.peer_identity = Some(hs.identity);
                    self.init_flags |= init_flags::ESTABLISHED;
                    self.state = State::Established;
                    events.push(ConnEvent::HandshakeComplete { peer_identity: hs.identity, peer_port: hs.port });
                }
                ReaderEvent::Ack { identity, serial } => events.push(ConnEvent::Ack { identity, serial }),
                ReaderEvent::Noop => events.push(ConnEvent::Noop),
                ReaderEvent::Deliver(msg) => events.push(ConnEvent::Deliver(msg)),
            }
        }
        Ok(())
    }

    /// The slot pool transitioned from exhausted to free (a `release_slot` call): resume the
    /// paused reader and try to make progress immediately, since bytes may already be buffered.
    pub fn resume_read(&mut self, now: Instant) -> ChirpResult<Vec<ConnEvent>> {
        self.reader.resume();
        let mut events = Vec::new();
        self.drain_reader(&mut events)?;
        let _ = now;
        Ok(events)
    }

    /// Socket became writable, or a write was just queued: flush whatever is buffered. Returns
    /// `true` once the writer's outstanding message has been fully handed to the socket (i.e.
    /// `WRITE_DONE` applies), at which point the caller should call `writer_mut().on_write_complete()`.
    pub fn writable(&mut self) -> ChirpResult<bool> {
        if self.tls.is_some() {
            self.ciphertext_out.egress(&mut self.stream)?;
            Ok(self.ciphertext_out.is_empty() && self.plaintext_out_is_logically_empty())
        } else {
            self.plaintext_out.egress(&mut self.stream)?;
            Ok(self.plaintext_out.is_empty())
        }
    }

    fn plaintext_out_is_logically_empty(&self) -> bool {
        // With TLS, application bytes are handed straight to the TLS engine in `queue_plaintext`
        // rather than sitting in `plaintext_out`, so "fully sent" is solely a ciphertext-buffer
        // question.
        true
    }

    /// Shutdown sequencing, restricted to what this module owns: idempotent (checked via
    /// the init-flag bitset), cancels the writer's outstanding message with `reason`, closes the
    /// socket, and decrements the closing-tasks semaphore. Returns the failed outstanding
    /// message (if any) for the engine to report through the send-callback.
    pub fn shutdown(&mut self, reason: ErrorKind) -> Option<(Message, ChirpError)> {
        if self.init_flags & init_flags::SHUTTING_DOWN != 0 {
            return None;
        }
        self.init_flags |= init_flags::SHUTTING_DOWN;
        self.state = State::ShuttingDown;

        let failed = self.writer.fail(reason);
        self.pool.clear_conn_token();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);

        self.closing_tasks = self.closing_tasks.saturating_sub(1);
        if self.closing_tasks == 0 {
            self.init_flags |= init_flags::CLOSED;
        }

        failed
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
