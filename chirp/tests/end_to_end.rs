//! Whole-engine scenarios driven over real loopback TCP sockets: two engines talking to each
//! other, and a couple of raw-socket clients poking at a single engine to exercise its
//! protocol-error paths directly.

use chirp::{Address, Callbacks, Config, Engine, Handle, Message, Proto, SendOutcome};
use chirp_support::LogLevel;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("reserve an ephemeral port");
    listener.local_addr().unwrap().port()
}

fn unencrypted_config(port: u16, identity: [u8; 16]) -> Config {
    let mut cfg = Config::default();
    cfg.port = port;
    cfg.disable_encryption = true;
    cfg.identity = identity;
    cfg
}

fn address_of(port: u16) -> Address {
    Address::from_text(Proto::V4, "127.0.0.1", port as u32).expect("loopback address parses")
}

/// Starts an engine whose receive callback reports every delivered message's payload and
/// remote identity on `tx`, then immediately releases the slot through a handle captured after
/// the fact (the callback closure is built before the handle it needs exists).
fn spawn_auto_release_engine(
    cfg: Config,
    tx: mpsc::Sender<(Vec<u8>, Option<[u8; 16]>)>,
) -> Handle {
    let handle_cell: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let handle_cell_for_cb = handle_cell.clone();
    let callbacks = Callbacks {
        on_receive: Some(Arc::new(move |msg: Message| {
            let _ = tx.send((msg.data.clone(), msg.remote_identity()));
            if let Some(handle) = handle_cell_for_cb.lock().unwrap().as_ref() {
                handle.release_slot_ts(msg, None);
            }
        })),
        ..Default::default()
    };
    let handle = Engine::init(cfg, callbacks).expect("engine should initialize");
    *handle_cell.lock().unwrap() = Some(handle.clone());
    handle
}

#[test]
fn s1_loopback_echo_synchronous_unencrypted() {
    let port_a = free_port();
    let port_b = free_port();

    let (recv_tx, recv_rx) = mpsc::channel();
    let handle_a = spawn_auto_release_engine(unencrypted_config(port_a, [1u8; 16]), recv_tx);
    let handle_b = Engine::init(unencrypted_config(port_b, [2u8; 16]), Callbacks::default()).unwrap();

    let mut msg = Message::new();
    msg.set_data(Vec::new(), b"ping".to_vec());
    msg.address = Some(address_of(port_a));
    msg.request_ack(true);

    let (sent_tx, sent_rx) = mpsc::channel();
    let outcome = handle_b.send_ts(
        msg,
        Some(Arc::new(move |m: &Message, result| {
            let _ = sent_tx.send((m.serial, result));
        })),
    );
    assert_eq!(outcome, SendOutcome::Queued);

    let (data, remote_identity) = recv_rx.recv_timeout(Duration::from_secs(3)).expect("A should receive B's message");
    assert_eq!(data, b"ping");
    assert_eq!(remote_identity, Some([2u8; 16]));

    let (serial, result) = sent_rx.recv_timeout(Duration::from_secs(3)).expect("B's send callback should fire");
    assert!(result.is_ok(), "send should succeed: {:?}", result);
    assert_eq!(serial, 1);

    let _ = handle_a.close_ts();
    let _ = handle_b.close_ts();
}

#[test]
fn s2_noop_probe_refreshes_stale_remote() {
    let port_a = free_port();
    let port_b = free_port();

    let log_lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_lines_for_cb = log_lines.clone();
    let callbacks_a = Callbacks {
        on_log: Some(Arc::new(move |_level: LogLevel, line: &str| {
            log_lines_for_cb.lock().unwrap().push(line.to_string());
        })),
        ..Default::default()
    };
    let (recv_tx, recv_rx) = mpsc::channel();
    let recv_tx_clone = recv_tx.clone();
    let callbacks_a = Callbacks { on_receive: Some(Arc::new(move |msg: Message| { let _ = recv_tx_clone.send((msg.data.clone(), msg.remote_identity())); })), ..callbacks_a };
    let handle_a = Engine::init(unencrypted_config(port_a, [3u8; 16]), callbacks_a).unwrap();

    let mut cfg_b = unencrypted_config(port_b, [4u8; 16]);
    cfg_b.reuse_time = 2.0;
    cfg_b.timeout = 0.5;
    let handle_b = Engine::init(cfg_b, Callbacks::default()).unwrap();

    let first = Message::new();
    let mut first = first;
    first.set_data(Vec::new(), b"one".to_vec());
    first.address = Some(address_of(port_a));
    handle_b.send_ts(first, None);

    recv_rx.recv_timeout(Duration::from_secs(2)).expect("first message should arrive");

    // Past the 75%-of-reuse_time staleness threshold (1.5s of a 2s reuse window): the next send
    // should carry a probing NOOP ahead of it.
    std::thread::sleep(Duration::from_millis(1800));

    let mut second = Message::new();
    second.set_data(Vec::new(), b"two".to_vec());
    second.address = Some(address_of(port_a));
    handle_b.send_ts(second, None);

    recv_rx.recv_timeout(Duration::from_secs(2)).expect("second message should arrive");
    std::thread::sleep(Duration::from_millis(200));

    let saw_noop = log_lines.lock().unwrap().iter().any(|line| line.contains("noop probe received"));
    assert!(saw_noop, "expected a NOOP probe between the two sends, got: {:?}", log_lines.lock().unwrap());

    let _ = handle_a.close_ts();
    let _ = handle_b.close_ts();
}

#[test]
fn s3_slot_exhaustion_backpressure() {
    let port_a = free_port();
    let port_b = free_port();

    let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let received_for_cb = received.clone();
    let callbacks_a = Callbacks {
        on_receive: Some(Arc::new(move |msg: Message| {
            received_for_cb.lock().unwrap().push(msg);
        })),
        ..Default::default()
    };
    let mut cfg_a = unencrypted_config(port_a, [5u8; 16]);
    cfg_a.synchronous = false;
    cfg_a.max_slots = 2;
    let handle_a = Engine::init(cfg_a, callbacks_a).unwrap();

    let mut cfg_b = unencrypted_config(port_b, [6u8; 16]);
    cfg_b.synchronous = false;
    let handle_b = Engine::init(cfg_b, Callbacks::default()).unwrap();

    for i in 0..5u8 {
        let mut msg = Message::new();
        msg.set_data(Vec::new(), vec![i]);
        msg.address = Some(address_of(port_a));
        handle_b.send_ts(msg, None);
    }

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(received.lock().unwrap().len(), 2, "a pool of 2 slots should admit exactly 2 messages");

    let released = received.lock().unwrap().remove(0);
    handle_a.release_slot_ts(released, None);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(received.lock().unwrap().len(), 3, "releasing a slot should admit exactly one more message");

    let _ = handle_a.close_ts();
    let _ = handle_b.close_ts();
}

#[test]
fn s4_simultaneous_dial_resolves_to_one_delivery_each_side() {
    let port_a = free_port();
    let port_b = free_port();

    let (recv_tx_a, recv_rx_a) = mpsc::channel();
    let (recv_tx_b, recv_rx_b) = mpsc::channel();
    let handle_a = spawn_auto_release_engine(unencrypted_config(port_a, [7u8; 16]), recv_tx_a);
    let handle_b = spawn_auto_release_engine(unencrypted_config(port_b, [8u8; 16]), recv_tx_b);

    let (sent_tx_a, sent_rx_a) = mpsc::channel();
    let (sent_tx_b, sent_rx_b) = mpsc::channel();

    let mut to_b = Message::new();
    to_b.set_data(Vec::new(), b"from-a".to_vec());
    to_b.address = Some(address_of(port_b));
    handle_a.send_ts(to_b, Some(Arc::new(move |_m: &Message, result| { let _ = sent_tx_a.send(result); })));

    let mut to_a = Message::new();
    to_a.set_data(Vec::new(), b"from-b".to_vec());
    to_a.address = Some(address_of(port_a));
    handle_b.send_ts(to_a, Some(Arc::new(move |_m: &Message, result| { let _ = sent_tx_b.send(result); })));

    let (data_at_a, _) = recv_rx_a.recv_timeout(Duration::from_secs(3)).expect("A should receive B's message");
    assert_eq!(data_at_a, b"from-b");
    let (data_at_b, _) = recv_rx_b.recv_timeout(Duration::from_secs(3)).expect("B should receive A's message");
    assert_eq!(data_at_b, b"from-a");

    assert!(sent_rx_a.recv_timeout(Duration::from_secs(3)).unwrap().is_ok());
    assert!(sent_rx_b.recv_timeout(Duration::from_secs(3)).unwrap().is_ok());

    // Neither side should see a duplicate delivery once the dial race settles.
    assert!(recv_rx_a.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(recv_rx_b.recv_timeout(Duration::from_millis(300)).is_err());

    let _ = handle_a.close_ts();
    let _ = handle_b.close_ts();
}

#[test]
fn s5_oversize_message_closes_connection_with_enomem() {
    let port_a = free_port();
    let max_msg_size = 1024u64;

    let received = Arc::new(Mutex::new(0usize));
    let received_for_cb = received.clone();
    let callbacks_a = Callbacks {
        on_receive: Some(Arc::new(move |_msg: Message| {
            *received_for_cb.lock().unwrap() += 1;
        })),
        ..Default::default()
    };
    let mut cfg_a = unencrypted_config(port_a, [9u8; 16]);
    cfg_a.max_msg_size = max_msg_size;
    cfg_a.synchronous = false;
    let handle_a = Engine::init(cfg_a, callbacks_a).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port_a)).expect("connect to A");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut hs_buf = [0u8; chirp::config::HANDSHAKE_LEN];
    stream.read_exact(&mut hs_buf).expect("A should send its handshake first");

    let hs = chirp::wire::Handshake { port: free_port(), identity: [10u8; 16] };
    let mut hs_bytes = [0u8; chirp::config::HANDSHAKE_LEN];
    hs.encode(&mut hs_bytes);
    stream.write_all(&hs_bytes).unwrap();

    let env = chirp::wire::Envelope {
        identity: [10u8; 16],
        serial: 1,
        kind: 0,
        header_len: 0,
        data_len: (max_msg_size + 1) as u32,
    };
    let mut env_bytes = [0u8; chirp::config::ENVELOPE_LEN];
    env.encode(&mut env_bytes);
    stream.write_all(&env_bytes).unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "A should close the connection rather than admit an oversize envelope");

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(*received.lock().unwrap(), 0, "an oversize message must never reach the receive callback");

    let _ = handle_a.close_ts();
}

#[test]
fn s5_oversize_message_rejected_before_it_leaves_the_sender() {
    let port_a = free_port();
    let port_b = free_port();

    let received = Arc::new(Mutex::new(0usize));
    let received_for_cb = received.clone();
    let callbacks_a = Callbacks {
        on_receive: Some(Arc::new(move |_msg: Message| {
            *received_for_cb.lock().unwrap() += 1;
        })),
        ..Default::default()
    };
    let handle_a = Engine::init(unencrypted_config(port_a, [13u8; 16]), callbacks_a).unwrap();

    let mut cfg_b = unencrypted_config(port_b, [14u8; 16]);
    cfg_b.max_msg_size = 16;
    let handle_b = Engine::init(cfg_b, Callbacks::default()).unwrap();

    let mut msg = Message::new();
    msg.set_data(Vec::new(), vec![0u8; 17]);
    msg.address = Some(address_of(port_a));

    let (sent_tx, sent_rx) = mpsc::channel();
    let outcome = handle_b.send_ts(
        msg,
        Some(Arc::new(move |_m: &Message, result| {
            let _ = sent_tx.send(result);
        })),
    );
    assert_eq!(outcome, SendOutcome::Queued, "send_ts only reports a synchronous rejection for USED/no-address");

    let result = sent_rx.recv_timeout(Duration::from_secs(2)).expect("send callback should fire");
    assert!(result.is_err(), "oversize send should not report success");

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(*received.lock().unwrap(), 0, "oversize message must never reach the peer");

    let _ = handle_a.close_ts();
    let _ = handle_b.close_ts();
}

#[test]
fn s6_malformed_ack_closes_connection_with_protocol_error() {
    let port_a = free_port();

    let received = Arc::new(Mutex::new(0usize));
    let received_for_cb = received.clone();
    let callbacks_a = Callbacks {
        on_receive: Some(Arc::new(move |_msg: Message| {
            *received_for_cb.lock().unwrap() += 1;
        })),
        ..Default::default()
    };
    let handle_a = Engine::init(unencrypted_config(port_a, [11u8; 16]), callbacks_a).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port_a)).expect("connect to A");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut hs_buf = [0u8; chirp::config::HANDSHAKE_LEN];
    stream.read_exact(&mut hs_buf).expect("A should send its handshake first");

    let hs = chirp::wire::Handshake { port: free_port(), identity: [12u8; 16] };
    let mut hs_bytes = [0u8; chirp::config::HANDSHAKE_LEN];
    hs.encode(&mut hs_bytes);
    stream.write_all(&hs_bytes).unwrap();

    // An ACK must carry no body; this one claims a 10-byte data section.
    let env = chirp::wire::Envelope {
        identity: [12u8; 16],
        serial: 1,
        kind: chirp::wire::ACK,
        header_len: 0,
        data_len: 10,
    };
    let mut env_bytes = [0u8; chirp::config::ENVELOPE_LEN];
    env.encode(&mut env_bytes);
    stream.write_all(&env_bytes).unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "A should close the connection on a malformed ACK");

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(*received.lock().unwrap(), 0);

    let _ = handle_a.close_ts();
}
