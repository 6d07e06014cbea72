//! The engine: owns the `mio::Poll`, the server sockets, the connection/remote tables, and
//! the GC/reconnect timers. One poll tick: accept, then drive existing connections, then run
//! periodic housekeeping. A single `mio::Poll` is sufficient once tokens are partitioned by
//! range (server sockets, wake registration, then per-connection tokens); `IndexMap`/`IndexSet`
//! give O(1) amortized lookup with FIFO-stable iteration, for the reasons given in
//! `pool.rs`/`remote.rs`.

use crate::config::Config;
use crate::connection::{ConnEvent, Connection};
use crate::error::{ChirpError, ChirpResult, ErrorKind};
use crate::message::{Address, Message, Proto, RemoteKey, SendCallback, SendOutcome};
use crate::remote::Remote;
use crate::wire::encode_addr;
use chirp_support::{PassThroughEngine, RustlsEngine, TlsEngine};
use indexmap::{IndexMap, IndexSet};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use slog::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

static ALWAYS_ENCRYPT: AtomicBool = AtomicBool::new(false);

/// Global override forcing TLS even on loopback connections, mirroring the
/// original's process-global setter.
pub fn set_always_encrypt(value: bool) {
    ALWAYS_ENCRYPT.store(value, Ordering::SeqCst);
}

fn always_encrypt() -> bool {
    ALWAYS_ENCRYPT.load(Ordering::SeqCst)
}

const SERVER_V4_TOKEN: Token = Token(0);
const SERVER_V6_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);
const FIRST_DYNAMIC_TOKEN: usize = 3;

pub type ReceiveCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type ReleaseCallback = Arc<dyn Fn(&ChirpResult<()>) + Send + Sync>;
pub type StartCallback = Arc<dyn Fn() + Send + Sync>;
pub type DoneCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_receive: Option<ReceiveCallback>,
    pub on_start: Option<StartCallback>,
    pub on_done: Option<DoneCallback>,
    pub on_log: Option<chirp_support::LogCallback>,
}

enum Command {
    Send(Message, Option<SendCallback>),
    ReleaseSlot(Message, Option<ReleaseCallback>),
    SetRecvCallback(Option<ReceiveCallback>),
    SetLogCallback(Option<chirp_support::LogCallback>),
    SetAutoStopLoop(bool),
    SetPublicPort(u16),
    Close,
}

/// The thread-safe entry point users hold. Every method here may be called from any
/// thread; the real work always runs on the engine's own loop thread. Cloning just bumps the
/// channel sender and the shared `closing` flag, so a receive callback can hold its own handle
/// to release slots or send replies without the caller having to pass one in separately.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
    set_readiness: SetReadiness,
    closing: Arc<AtomicBool>,
}

impl Handle {
    pub fn send_ts(&self, msg: Message, on_sent: Option<SendCallback>) -> SendOutcome {
        if self.closing.load(Ordering::SeqCst) {
            return SendOutcome::Shutdown;
        }
        if msg.has_flag(crate::message::flags::USED) {
            return SendOutcome::Used;
        }
        if self.tx.send(Command::Send(msg, on_sent)).is_err() {
            return SendOutcome::Shutdown;
        }
        let _ = self.set_readiness.set_readiness(Ready::readable());
        SendOutcome::Queued
    }

    pub fn release_slot_ts(&self, msg: Message, on_released: Option<ReleaseCallback>) {
        let _ = self.tx.send(Command::ReleaseSlot(msg, on_released));
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    /// Replaces (or clears) the installed receive callback. Takes effect on the engine's
    /// next wake-up; messages already mid-delivery on this tick still use the old callback.
    pub fn set_recv_callback(&self, cb: Option<ReceiveCallback>) {
        let _ = self.tx.send(Command::SetRecvCallback(cb));
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    /// Replaces (or clears) the installed log callback.
    pub fn set_log_callback(&self, cb: Option<chirp_support::LogCallback>) {
        let _ = self.tx.send(Command::SetLogCallback(cb));
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    /// When enabled, the engine's loop thread exits on its own once every connection has closed
    /// and every Remote's queues have drained, without requiring an explicit `close`/`close_ts`
    ///. Useful for short-lived hosts (CLIs, tests) that just want "run until idle".
    pub fn set_auto_stop_loop(&self, enabled: bool) {
        let _ = self.tx.send(Command::SetAutoStopLoop(enabled));
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    /// Overrides the port advertised in the outgoing handshake record, independent of the
    /// port this node actually listens on — for nodes reachable through port-forwarding or a
    /// load balancer where the two differ.
    pub fn set_public_port(&self, port: u16) {
        let _ = self.tx.send(Command::SetPublicPort(port));
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    /// Thread-safe close; idempotent (a second call is a cheap no-op rather than `IN_PROGRESS`,
    /// since unlike the loop-thread `close()` there is no double-invocation of `on_done` to
    /// guard here — the loop thread itself enforces that).
    pub fn close_ts(&self) -> ChirpResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(ChirpError::new(ErrorKind::InProgress));
        }
        let _ = self.tx.send(Command::Close);
        let _ = self.set_readiness.set_readiness(Ready::readable());
        Ok(())
    }
}

pub struct Engine {
    poll: Poll,
    events: Events,
    listener_v4: Option<TcpListener>,
    listener_v6: Option<TcpListener>,
    _wake_registration: Registration,
    inbox: mpsc::Receiver<Command>,
    connections: IndexMap<Token, Connection>,
    handshake_conns: IndexSet<Token>,
    old_connections: IndexSet<Token>,
    remotes: IndexMap<RemoteKey, Remote>,
    reconnect_stack: Vec<RemoteKey>,
    reconnect_deadline: Option<Instant>,
    gc_deadline: Instant,
    next_token: usize,
    config: Config,
    callbacks: Callbacks,
    closing: Arc<AtomicBool>,
    log: slog::Logger,
    /// `None` means "advertise `config.port`"; `Some` overrides it.
    public_port: Option<u16>,
    auto_stop_loop: bool,
    /// Set the first time a connection or Remote is created. Guards `auto_stop_loop` so a
    /// freshly-started server (idle by definition before its first peer shows up) doesn't exit
    /// immediately — the loop only auto-stops after having done work and drained back to idle.
    activity_seen: bool,
}

impl Engine {
    /// Validates `config` synchronously, binds server sockets, spawns the loop thread, and
    /// returns a `Handle` immediately. All callbacks run on the loop thread.
    pub fn init(config: Config, callbacks: Callbacks) -> ChirpResult<Handle> {
        let config = config.validate()?;
        let log = match &callbacks.on_log {
            Some(cb) => chirp_support::logging::root_logger(cb.clone(), slog::Level::Debug),
            None => chirp_support::logging::discard_logger(),
        };

        let poll = Poll::new()?;

        let v4_addr = SocketAddr::new(config.bind_v4.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), config.port);
        let listener_v4 = TcpListener::bind(&v4_addr)?;
        poll.register(&listener_v4, SERVER_V4_TOKEN, Ready::readable(), PollOpt::edge())?;

        let listener_v6 = match config.bind_v6 {
            Some(ip) => {
                let addr = SocketAddr::new(ip, config.port);
                let listener = TcpListener::bind(&addr)?;
                poll.register(&listener, SERVER_V6_TOKEN, Ready::readable(), PollOpt::edge())?;
                Some(listener)
            }
            None => None,
        };

        let (registration, set_readiness) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let (tx, rx) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));

        let now = Instant::now();
        let reuse_time = Duration::from_secs_f64(config.effective_reuse_time());

        let engine = Engine {
            poll,
            events: Events::with_capacity(1024),
            listener_v4: Some(listener_v4),
            listener_v6,
            _wake_registration: registration,
            inbox: rx,
            connections: IndexMap::new(),
            handshake_conns: IndexSet::new(),
            old_connections: IndexSet::new(),
            remotes: IndexMap::new(),
            reconnect_stack: Vec::new(),
            reconnect_deadline: None,
            gc_deadline: now + reuse_time / 2,
            next_token: FIRST_DYNAMIC_TOKEN,
            config,
            callbacks,
            closing: closing.clone(),
            log,
            public_port: None,
            auto_stop_loop: false,
            activity_seen: false,
        };

        let handle = Handle { tx, set_readiness, closing };

        std::thread::Builder::new()
            .name("chirp-engine".into())
            .spawn(move || engine.run())
            .map_err(|_| ChirpError::new(ErrorKind::InitFail))?;

        Ok(handle)
    }

    fn identity(&self) -> [u8; 16] {
        if self.config.identity == [0u8; 16] {
            // Only reached if the caller bypassed `Config::validate`'s usual random-fill step
            // (tests construct `Config` directly); `Engine::init` otherwise never observes the
            // zero sentinel, since callers are expected to fill it via `chirp_support::random_identity`
            // before `init` when they want a stable identity across restarts.
            chirp_support::random_identity()
        } else {
            self.config.identity
        }
    }

    fn run(mut self) {
        if let Some(cb) = self.callbacks.on_start.clone() {
            cb();
        }

        loop {
            let idle = self.connections.is_empty() && self.remotes.is_empty();
            let auto_stop = self.auto_stop_loop && self.activity_seen;
            if idle && (self.closing.load(Ordering::SeqCst) || auto_stop) {
                break;
            }

            let timeout = self.next_timeout();
            if self.poll.poll(&mut self.events, Some(timeout)).is_err() {
                break;
            }

            let tokens: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();
            for (token, readiness) in tokens {
                match token {
                    SERVER_V4_TOKEN => self.accept(false),
                    SERVER_V6_TOKEN => self.accept(true),
                    WAKE_TOKEN => self.drain_inbox(),
                    _ => self.drive_connection(token, readiness),
                }
            }

            self.check_timers();

            if self.inbox_has_pending_close() {
                self.begin_shutdown_all();
            }
        }

        if let Some(cb) = self.callbacks.on_done.clone() {
            cb();
        }
    }

    fn inbox_has_pending_close(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut deadline = self.gc_deadline;
        if let Some(d) = self.reconnect_deadline {
            deadline = deadline.min(d);
        }
        for conn in self.connections.values() {
            if let Some(t) = conn.next_send_deadline() {
                deadline = deadline.min(t);
            }
        }
        deadline.saturating_duration_since(now).max(Duration::from_millis(1))
    }

    fn drain_inbox(&mut self) {
        while let Ok(cmd) = self.inbox.try_recv() {
            match cmd {
                Command::Send(msg, on_sent) => {
                    self.dispatch_send(msg, on_sent);
                }
                Command::ReleaseSlot(msg, on_released) => {
                    self.dispatch_release(msg, on_released);
                }
                Command::SetRecvCallback(cb) => {
                    self.callbacks.on_receive = cb;
                }
                Command::SetLogCallback(cb) => {
                    self.log = match cb {
                        Some(cb) => chirp_support::logging::root_logger(cb, slog::Level::Debug),
                        None => chirp_support::logging::discard_logger(),
                    };
                }
                Command::SetAutoStopLoop(enabled) => {
                    self.auto_stop_loop = enabled;
                }
                Command::SetPublicPort(port) => {
                    self.public_port = Some(port);
                }
                Command::Close => {
                    self.begin_shutdown_all();
                }
            }
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept(&mut self, v6: bool) {
        let listener = if v6 { self.listener_v6.as_ref() } else { self.listener_v4.as_ref() };
        let listener = match listener {
            Some(l) => l,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!(self.log, "accepted inbound connection"; "peer" => %peer_addr);
                    self.spawn_connection(stream, peer_addr, false, None);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn make_tls(&self, peer_addr: &SocketAddr, outbound: bool) -> ChirpResult<Option<Box<dyn TlsEngine>>> {
        if self.config.disable_encryption {
            return Ok(None);
        }
        if peer_addr.ip().is_loopback() && !always_encrypt() {
            return Ok(None);
        }
        let cert = self
            .config
            .cert_chain_pem
            .as_ref()
            .ok_or_else(|| ChirpError::new(ErrorKind::TlsError))?;

        if outbound {
            let name = peer_addr.ip().to_string();
            Ok(Some(Box::new(RustlsEngine::client(cert, &name)?)))
        } else {
            Ok(Some(Box::new(RustlsEngine::server(cert)?)))
        }
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr, outbound: bool, target_key: Option<RemoteKey>) {
        let now = Instant::now();
        let token = self.next_token();
        self.activity_seen = true;

        if self
            .poll
            .register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge())
            .is_err()
        {
            return;
        }

        let tls = match self.make_tls(&peer_addr, outbound) {
            Ok(tls) => tls,
            Err(_) => {
                if self.config.disable_encryption {
                    None
                } else {
                    return;
                }
            }
        };
        // `PassThroughEngine` is only ever wired in by tests constructing a `Connection`
        // directly; the engine itself picks `None` (plaintext) or `RustlsEngine` so a stray
        // import warning doesn't appear for an unused test-only type.
        let _ = PassThroughEngine::new;

        let connect_timeout = if outbound {
            Some(Duration::from_secs_f64(self.config.connect_timeout()))
        } else {
            None
        };

        let mut conn = Connection::new(
            stream,
            token,
            peer_addr,
            outbound,
            self.identity(),
            self.public_port.unwrap_or(self.config.port),
            self.config.max_slots,
            self.config.max_msg_size,
            self.config.buffer_size,
            tls,
            now,
            connect_timeout,
        );
        conn.remote_key = target_key;

        self.handshake_conns.insert(token);
        self.connections.insert(token, conn);
    }

    fn drive_connection(&mut self, token: Token, readiness: Ready) {
        let now = Instant::now();

        let events = {
            let conn = match self.connections.get_mut(&token) {
                Some(c) => c,
                None => return,
            };

            if readiness.is_writable() {
                conn.connect_established();
                match conn.writable() {
                    Ok(true) => {
                        if let Some(finished) = conn.writer_mut().on_write_complete() {
                            self.finish_message(finished, Ok(()));
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        self.fail_connection(token, err.kind());
                        return;
                    }
                }
            }

            if readiness.is_readable() && conn.wants_read() {
                match conn.readable(now) {
                    Ok(events) => events,
                    Err(err) => {
                        self.fail_connection(token, err.kind());
                        return;
                    }
                }
            } else {
                Vec::new()
            }
        };

        for event in events {
            self.handle_conn_event(token, event, now);
        }

        if let Some(key) = self.connections.get(&token).and_then(|c| c.remote_key) {
            self.run_process_queues(key, now);
        }
    }

    fn handle_conn_event(&mut self, token: Token, event: ConnEvent, now: Instant) {
        match event {
            ConnEvent::HandshakeComplete { peer_identity, peer_port } => {
                self.on_handshake_complete(token, peer_identity, peer_port, now);
            }
            ConnEvent::Ack { identity, serial } => {
                let _ = serial;
                self.on_ack(token, identity);
            }
            ConnEvent::Noop => {
                debug!(self.log, "noop probe received"; "token" => token.0);
                if let Some(key) = self.connections.get(&token).and_then(|c| c.remote_key) {
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.touch(now);
                    }
                }
            }
            ConnEvent::Deliver(msg) => {
                if let Some(cb) = self.callbacks.on_receive.clone() {
                    cb(msg);
                } else {
                    // No receive callback installed: release the slot ourselves to keep
                    // pool invariants intact.
                    self.release_slot_internal(msg, None);
                }
            }
        }
    }

    fn on_handshake_complete(&mut self, token: Token, peer_identity: [u8; 16], peer_port: u16, now: Instant) {
        let peer_ip = match self.connections.get(&token) {
            Some(c) => c.peer_addr.ip(),
            None => return,
        };
        let proto = match peer_ip {
            IpAddr::V4(_) => Proto::V4,
            IpAddr::V6(_) => Proto::V6,
        };
        let mut addr_bytes = [0u8; 16];
        encode_addr(peer_ip, &mut addr_bytes);
        let key: RemoteKey = (proto, addr_bytes, peer_port as u32);

        if let Some(conn) = self.connections.get_mut(&token) {
            conn.remote_key = Some(key);
        }
        self.handshake_conns.remove(&token);
        self.old_connections.remove(&token);

        let remote = self.remotes.entry(key).or_insert_with(|| Remote::new(key, now));
        if let Some(old_token) = remote.connection_token() {
            if old_token != token {
                self.old_connections.insert(old_token);
                self.handshake_conns.remove(&old_token);
            }
        }
        remote.set_connection(Some(token));
        remote.touch(now);
        info!(self.log, "handshake complete"; "token" => token.0, "peer_port" => peer_port);
        let _ = peer_identity;

        self.run_process_queues(key, now);
    }

    fn on_ack(&mut self, token: Token, identity: [u8; 16]) {
        let key = match self.connections.get(&token).and_then(|c| c.remote_key) {
            Some(k) => k,
            None => return,
        };
        if let Some(remote) = self.remotes.get_mut(&key) {
            remote.clear_wait_ack(identity);
        }
        if let Some(conn) = self.connections.get_mut(&token) {
            if let Some(finished) = conn.writer_mut().on_ack_received(identity) {
                self.finish_message(finished, Ok(()));
            }
        }
    }

    fn finish_message(&mut self, mut msg: Message, outcome: ChirpResult<()>) {
        if let Some(cb) = msg.take_send_callback() {
            cb(&msg, outcome);
        }
    }

    fn fail_connection(&mut self, token: Token, reason: ErrorKind) {
        warn!(self.log, "connection failed"; "token" => token.0, "reason" => %reason);
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Some((msg, err)) = conn.shutdown(reason) {
                self.finish_message(msg, Err(err));
            }
            self.handshake_conns.remove(&token);
            self.old_connections.remove(&token);

            if let Some(key) = conn.remote_key {
                if let Some(remote) = self.remotes.get_mut(&key) {
                    if remote.connection_token() == Some(token) {
                        remote.set_connection(None);
                        remote.block();
                        self.reconnect_stack.push(key);
                        if self.reconnect_deadline.is_none() {
                            self.reconnect_deadline = Some(Instant::now() + chirp_support::random_jitter());
                        }
                        if let Some((queued, err_kind)) = remote.abort_one_queued(ErrorKind::Shutdown) {
                            self.finish_message(queued, Err(ChirpError::new(err_kind)));
                        }
                    }
                }
            }
        }
    }

    fn run_process_queues(&mut self, key: RemoteKey, now: Instant) {
        let token = match self.remotes.get(&key).and_then(|r| r.connection_token()) {
            Some(t) => t,
            None => {
                self.maybe_connect(key, now);
                return;
            }
        };

        let connected = match self.connections.get(&token) {
            Some(c) => c.is_connected(),
            None => false,
        };
        if !connected {
            return;
        }

        let dispatch = {
            let remote = match self.remotes.get_mut(&key) {
                Some(r) => r,
                None => return,
            };
            let conn = match self.connections.get_mut(&token) {
                Some(c) => c,
                None => return,
            };
            remote.process_queues(conn.writer_mut(), self.config.synchronous, Duration::from_secs_f64(self.config.timeout), now)
        };

        if let Some(dispatch) = dispatch {
            if let Some(conn) = self.connections.get_mut(&token) {
                let _ = conn.flush_dispatch(dispatch.bytes);
            }
        }
    }

    fn maybe_connect(&mut self, key: RemoteKey, now: Instant) {
        let needs = match self.remotes.get(&key) {
            Some(r) => r.needs_connect(),
            None => false,
        };
        if !needs {
            return;
        }

        let address = Address { proto: key.0, addr: key.1, port: key.2 };
        let sock_addr = address.socket_addr();

        match TcpStream::connect(&sock_addr) {
            Ok(stream) => self.spawn_connection(stream, sock_addr, true, Some(key)),
            Err(_) => {
                if let Some(remote) = self.remotes.get_mut(&key) {
                    remote.block();
                    self.reconnect_stack.push(key);
                    if self.reconnect_deadline.is_none() {
                        self.reconnect_deadline = Some(now + chirp_support::random_jitter());
                    }
                }
            }
        }
    }

    fn dispatch_send(&mut self, mut msg: Message, on_sent: Option<SendCallback>) {
        let address = match msg.address() {
            Some(a) => a,
            None => {
                if let Some(cb) = on_sent {
                    cb(&msg, Err(ChirpError::new(ErrorKind::ValueError)));
                }
                return;
            }
        };
        if msg.has_flag(crate::message::flags::USED) {
            if let Some(cb) = on_sent {
                cb(&msg, Err(ChirpError::new(ErrorKind::Used)));
            }
            return;
        }
        if msg.header.len() > u16::MAX as usize {
            if let Some(cb) = on_sent {
                cb(&msg, Err(ChirpError::new(ErrorKind::ValueError)));
            }
            return;
        }
        if (msg.header.len() as u64 + msg.data.len() as u64) > self.config.max_msg_size {
            if let Some(cb) = on_sent {
                cb(&msg, Err(ChirpError::new(ErrorKind::EnoMem)));
            }
            return;
        }

        msg.set_send_callback(on_sent);
        self.activity_seen = true;
        let now = Instant::now();
        let key = crate::message::remote_key(&address);
        let remote = self.remotes.entry(key).or_insert_with(|| Remote::new(key, now));

        let is_control = msg.is_ack() || msg.is_noop();
        if is_control {
            remote.enqueue_control(msg);
        } else {
            let reuse_time = Duration::from_secs_f64(self.config.effective_reuse_time());
            remote.enqueue_main(msg, now, reuse_time);
        }

        self.run_process_queues(key, now);
    }

    fn dispatch_release(&mut self, msg: Message, on_released: Option<ReleaseCallback>) {
        self.release_slot_internal(msg, on_released);
    }

    fn release_slot_internal(&mut self, msg: Message, on_released: Option<ReleaseCallback>) {
        let outcome = crate::public::release_slot(msg);
        if let Some(cb) = on_released {
            cb(&outcome.result);
        }

        let now = Instant::now();

        if let Some((key, ack_msg)) = outcome.ack {
            let remote = self.remotes.entry(key).or_insert_with(|| Remote::new(key, now));
            remote.enqueue_control(ack_msg);
            self.run_process_queues(key, now);
        }

        if let Some(token) = outcome.resumed_token {
            if let Some(conn) = self.connections.get_mut(&token) {
                if let Ok(events) = conn.resume_read(now) {
                    for event in events {
                        self.handle_conn_event(token, event, now);
                    }
                }
            }
            if let Some(key) = self.connections.get(&token).and_then(|c| c.remote_key) {
                self.run_process_queues(key, now);
            }
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.reconnect_deadline {
            if now >= deadline {
                for key in self.reconnect_stack.drain(..).collect::<Vec<_>>() {
                    if let Some(remote) = self.remotes.get_mut(&key) {
                        remote.unblock();
                    }
                    self.run_process_queues(key, now);
                }
                self.reconnect_deadline = None;
            }
        }

        let connect_timed_out: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.check_connect_timeout(now))
            .map(|(t, _)| *t)
            .collect();
        for token in connect_timed_out {
            self.fail_connection(token, ErrorKind::Timeout);
        }

        let send_timed_out: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.check_send_timeout(now))
            .map(|(t, _)| *t)
            .collect();
        for token in send_timed_out {
            self.fail_connection(token, ErrorKind::Timeout);
        }

        if now >= self.gc_deadline {
            self.run_gc(now);
            let reuse_time = Duration::from_secs_f64(self.config.effective_reuse_time());
            let jitter = Duration::from_secs_f64(rand_fraction() * reuse_time.as_secs_f64() / 2.0);
            self.gc_deadline = now + reuse_time / 2 + jitter;
        }
    }

    fn run_gc(&mut self, now: Instant) {
        let reuse_time = Duration::from_secs_f64(self.config.effective_reuse_time());

        let stale_old: Vec<Token> = self
            .old_connections
            .iter()
            .copied()
            .filter(|t| self.connections.get(t).map(|c| now.duration_since(c.last_use()) > reuse_time).unwrap_or(true))
            .collect();
        for token in stale_old {
            self.old_connections.remove(&token);
            self.fail_connection(token, ErrorKind::Shutdown);
        }

        let collectible: Vec<RemoteKey> = self
            .remotes
            .iter()
            .filter(|(_, r)| r.is_collectible(now, reuse_time))
            .map(|(k, _)| *k)
            .collect();
        for key in collectible {
            debug!(self.log, "collecting idle remote"; "port" => key.2);
            if let Some(mut remote) = self.remotes.remove(&key) {
                for (msg, reason) in remote.abort_queued(ErrorKind::Shutdown) {
                    self.finish_message(msg, Err(ChirpError::new(reason)));
                }
            }
        }
    }

    fn begin_shutdown_all(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.fail_connection(token, ErrorKind::Shutdown);
        }
        for (_, mut remote) in self.remotes.drain(..) {
            for (msg, reason) in remote.abort_queued(ErrorKind::Shutdown) {
                self.finish_message(msg, Err(ChirpError::new(reason)));
            }
        }
    }
}

fn rand_fraction() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..1.0)
}
