//! End-to-end scenarios over the loopback rig.
//!
//! Every test drives the full path: mwsocket surface -> ring -> INS
//! dispatcher -> worker -> host socket against a real 127.0.0.1 peer,
//! and back.

use mwmux_bootstrap::keys;
use mwmux_bootstrap::KeyStore;
use mwmux_loopback::{LoopbackRig, RigConfig, INS_DOMID};
use mwmux_proto::attrib::AttribName;
use mwmux_proto::message::{flags, Message, Opcode};
use mwmux_proto::sockaddr::MW_AF_INET;
use mwmux_proto::{errno, handle, payload};
use mwmux_pvm::{Mwsocket, PvmConfig, PvmError};

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLLIN: u16 = libc::POLLIN as u16;

fn create_stream(rig: &LoopbackRig) -> Mwsocket {
    rig.pvm
        .create_socket(MW_AF_INET, payload::MW_ST_STREAM, 0)
        .expect("create")
}

/// Host-side echo server: accepts one connection, echoes until EOF.
fn echo_server() -> (SocketAddrV4, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    (addr, handle)
}

// ── S1: echo ──

#[test]
fn s1_echo_round_trip() {
    let rig = LoopbackRig::start();
    let (addr, server) = echo_server();

    let c = create_stream(&rig);
    let remote = c.remote_fd();
    assert!(handle::is_mwsocket(remote));

    c.connect(&addr).expect("connect");
    assert_eq!(c.send(b"hello").expect("send"), 5);

    let got = c.recv(5).expect("recv");
    assert_eq!(got, b"hello");

    c.close().expect("close");
    server.join().unwrap();

    // The worker bound to the socket was released and the buffer pool is
    // back at full capacity.
    let shared = rig.ins_shared();
    let idx = handle::worker_index(remote) as usize;
    assert!(!shared.workers[idx]
        .in_use
        .load(std::sync::atomic::Ordering::Acquire));
    assert_eq!(shared.buffers.free_count(), shared.buffers.capacity());
    assert_eq!(rig.pvm.state().instance_count(), 0);

    rig.shutdown();
}

// ── S2: listener ──

#[test]
fn s2_listener_accept() {
    let rig = LoopbackRig::start();

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let bound = s.getsockname().unwrap();
    assert_ne!(bound.port(), 0);
    s.listen(16).unwrap();

    let mut client = TcpStream::connect(bound).unwrap();
    let a = s.accept().expect("accept");
    // The accept response carries a new local handle distinct from the
    // listener's.
    assert_ne!(a.local_id(), s.local_id());
    assert_ne!(a.remote_fd(), s.remote_fd());

    client.write_all(b"inbound").unwrap();
    let got = a.recv(64).unwrap();
    assert_eq!(got, b"inbound");

    // The INS publishes the listening port, in hex.
    std::thread::sleep(Duration::from_millis(500));
    let listeners = rig.store.read(&keys::listeners(INS_DOMID)).unwrap();
    assert!(
        listeners
            .split_whitespace()
            .any(|tok| tok == format!("{:x}", bound.port())),
        "listeners {:?} missing port {:x}",
        listeners,
        bound.port()
    );

    a.close().unwrap();
    s.close().unwrap();
    rig.shutdown();
}

// ── S3: remote close during recv, SIGPIPE once ──

#[test]
fn s3_remote_close_latches_sigpipe_once() {
    let sigpipes = Arc::new(AtomicU32::new(0));
    let hook_count = Arc::clone(&sigpipes);
    let mut config = RigConfig::default();
    config.pvm = PvmConfig {
        sigpipe_hook: Some(Box::new(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let rig = LoopbackRig::start_with(config);

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let bound = s.getsockname().unwrap();
    s.listen(4).unwrap();

    let client = TcpStream::connect(bound).unwrap();
    let a = s.accept().unwrap();

    // Peer closes; the outstanding recv comes back empty.
    drop(client);
    std::thread::sleep(Duration::from_millis(100));
    let got = a.recv(64).unwrap();
    assert!(got.is_empty());
    assert!(a
        .instance()
        .remote_close_requested
        .load(Ordering::Acquire));

    // Sends against the closed remote eventually fail with EPIPE and the
    // process receives SIGPIPE exactly once.
    let mut failed = false;
    for _ in 0..5 {
        match a.send(b"x") {
            Err(PvmError::RemoteError(e)) => {
                assert!(e == -errno::MW_EPIPE || e == -errno::MW_ECONNRESET, "{}", e);
                failed = true;
                break;
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(30)),
            Err(e) => panic!("unexpected {:?}", e),
        }
    }
    assert!(failed, "send never observed the close");

    // Try again: no second delivery.
    let _ = a.send(b"x");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sigpipes.load(Ordering::SeqCst), 1);

    a.close().unwrap();
    s.close().unwrap();
    rig.shutdown();
}

// ── S4: nonblocking accept with no pending connection ──

#[test]
fn s4_nonblocking_accept_eagain_no_leak() {
    let rig = LoopbackRig::start();

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    s.listen(4).unwrap();
    s.set_nonblocking(true).unwrap();

    let before = rig.pvm.state().instance_count();
    match s.accept() {
        Err(PvmError::RemoteError(e)) => assert_eq!(e, -errno::MW_EAGAIN),
        other => panic!("expected EAGAIN, got {:?}", other.map(|s| s.local_id())),
    }
    // The preallocated child did not leak.
    assert_eq!(rig.pvm.state().instance_count(), before);

    s.close().unwrap();
    rig.shutdown();
}

// ── S5: poll fan-out ──

#[test]
fn s5_poll_monitor_fan_out() {
    let rig = LoopbackRig::start();
    let (addr_a, server_a) = echo_server();
    let (addr_b, server_b) = echo_server();

    let a = create_stream(&rig);
    let b = create_stream(&rig);
    a.connect(&addr_a).unwrap();
    b.connect(&addr_b).unwrap();

    // Only a gets data.
    assert_eq!(a.send(b"ping").unwrap(), 4);

    // Within a few monitor ticks, a is readable and b is not.
    let events = a.poll_wait(Duration::from_secs(2));
    assert_ne!(events & POLLIN, 0, "events {:#x}", events);
    assert_eq!(b.poll() & POLLIN, 0);

    assert_eq!(a.recv(4).unwrap(), b"ping");

    a.close().unwrap();
    b.close().unwrap();
    rig.shutdown();
    server_a.join().unwrap();
    server_b.join().unwrap();
}

// ── S6: ring wrap ──

#[test]
fn s6_ring_wrap() {
    let rig = LoopbackRig::start();
    let (addr, server) = echo_server();

    let c = create_stream(&rig);
    c.connect(&addr).unwrap();

    let rounds = rig.pvm.state().ring_capacity() as usize + 16;
    for i in 0..rounds {
        let body = format!("m{:04}", i);
        loop {
            match c.send(body.as_bytes()) {
                Ok(n) => {
                    assert_eq!(n, body.len());
                    break;
                }
                Err(PvmError::WouldBlock) => std::thread::yield_now(),
                Err(e) => panic!("send {}: {:?}", i, e),
            }
        }
        let got = c.recv(body.len() as u32).unwrap();
        assert_eq!(got, body.as_bytes());
    }

    c.close().unwrap();
    rig.shutdown();
    server.join().unwrap();
}

// ── Boundary: fire-and-forget burst, EAGAIN never fatal ──

#[test]
fn fire_and_forget_burst_survives_ring_full() {
    let rig = LoopbackRig::start();
    let (addr, server) = echo_server();

    let c = create_stream(&rig);
    c.connect(&addr).unwrap();

    let mut eagain = 0;
    let mut sent = 0;
    let total = rig.pvm.state().ring_capacity() as usize * 3;
    for _ in 0..total {
        let mut msg = Message::request(Opcode::Send, b"f".to_vec()).unwrap();
        msg.header.flags |= flags::FIRE_AND_FORGET;
        match c.write(&msg.encode()) {
            Ok(()) => sent += 1,
            Err(PvmError::WouldBlock) => {
                eagain += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("write: {:?}", e),
        }
    }
    assert!(sent > 0);
    // Whether or not the burst ever filled the ring, a subsequent
    // round trip must work: the state rolled back cleanly.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(c.send(b"after").unwrap(), 5);
    let _ = eagain;

    c.close().unwrap();
    rig.shutdown();
    server.join().unwrap();
}

// ── Boundary: interrupted read drops the late response ──

#[test]
fn interrupted_recv_reports_eintr_and_drops_late_response() {
    let rig = LoopbackRig::start();

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let bound = s.getsockname().unwrap();
    s.listen(4).unwrap();
    let mut client = TcpStream::connect(bound).unwrap();
    let a = Arc::new(s.accept().unwrap());

    let a2 = Arc::clone(&a);
    let reader = std::thread::spawn(move || a2.recv(64));

    // Let the recv reach the INS and block there.
    std::thread::sleep(Duration::from_millis(100));
    a.interrupt_pending();
    assert_eq!(reader.join().unwrap(), Err(PvmError::Interrupted));

    // The peer now sends; the late response arrives and is dropped
    // without harming the instance.
    client.write_all(b"late").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.send(b"ok").unwrap(), 2);

    a.close().unwrap();
    s.close().unwrap();
    rig.shutdown();
}

// ── Boundary: abandoned accept must not orphan the accepted socket ──

#[test]
fn abandoned_accept_reclaims_child_and_worker() {
    let rig = LoopbackRig::start();

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let bound = s.getsockname().unwrap();
    s.listen(4).unwrap();

    let s = Arc::new(s);
    let s2 = Arc::clone(&s);
    let acceptor = std::thread::spawn(move || match s2.accept() {
        Err(e) => e,
        Ok(_) => panic!("accept was supposed to be interrupted"),
    });

    // Let the accept reach the INS and block, then abandon it.
    std::thread::sleep(Duration::from_millis(100));
    s.interrupt_pending();
    assert_eq!(acceptor.join().unwrap(), PvmError::Interrupted);

    // The connection lands after the waiter gave up: the late success is
    // reclaimed (remote closed, preallocated child destroyed), never
    // adopted.
    let _client = TcpStream::connect(bound).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(rig.pvm.state().instance_count(), 1);
    let shared = rig.ins_shared();
    let busy = shared
        .workers
        .iter()
        .filter(|w| w.in_use.load(Ordering::Acquire))
        .count();
    assert_eq!(busy, 1, "only the listener's worker may remain");

    s.close().unwrap();
    rig.shutdown();
}

// ── Boundary: rundown with many open sockets ──

#[test]
fn rundown_closes_everything() {
    let rig = LoopbackRig::start();

    let mut servers = Vec::new();
    let mut socks = Vec::new();
    for _ in 0..8 {
        let (addr, server) = echo_server();
        let c = create_stream(&rig);
        c.connect(&addr).unwrap();
        servers.push(server);
        socks.push(c);
    }
    assert_eq!(rig.pvm.state().instance_count(), 8);

    rig.pvm.rundown();
    assert_eq!(rig.pvm.state().instance_count(), 0);

    // Every worker slot was returned.
    std::thread::sleep(Duration::from_millis(100));
    let shared = rig.ins_shared();
    let busy = shared
        .workers
        .iter()
        .filter(|w| w.in_use.load(Ordering::Acquire))
        .count();
    assert_eq!(busy, 0);

    drop(socks);
    rig.shutdown();
    for server in servers {
        server.join().unwrap();
    }
}

// ── Invariant: handle <-> worker mapping ──

#[test]
fn live_handle_maps_to_exactly_one_worker() {
    let rig = LoopbackRig::start();
    let c = create_stream(&rig);

    let remote = c.remote_fd();
    let (insid, idx) = handle::decode(remote);
    assert_eq!(insid as u16, INS_DOMID);

    let shared = rig.ins_shared();
    let live: Vec<u16> = shared
        .workers
        .iter()
        .filter(|w| w.in_use.load(Ordering::Acquire))
        .map(|w| w.idx)
        .collect();
    assert_eq!(live, vec![idx]);

    c.close().unwrap();
    rig.shutdown();
}

// ── Idempotence: pollset with zero sockets, double close ──

#[test]
fn close_twice_and_empty_pollset() {
    let rig = LoopbackRig::start();

    let c = create_stream(&rig);
    c.close().unwrap();
    // Second close on the same handle is a quiet no-op.
    c.close().unwrap();

    // With zero sockets the monitor keeps running on an empty pollset;
    // nothing to assert beyond "does not wedge".
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(rig.pvm.state().instance_count(), 0);

    rig.shutdown();
}

// ── Attributes end to end ──

#[test]
fn attrib_round_trip_and_globals() {
    let rig = LoopbackRig::start();
    let c = create_stream(&rig);

    c.attrib(true, AttribName::SndBuf, 65536).unwrap();
    let got = c.attrib(false, AttribName::SndBuf, 0).unwrap();
    // Kernels round buffer sizes; it must at least be positive.
    assert!(got > 0, "sndbuf {}", got);

    c.attrib(true, AttribName::GlobalRcvBuf, 32768).unwrap();
    assert_eq!(
        rig.ins_shared().defaults.lock().unwrap().rcvbuf,
        Some(32768)
    );

    c.close().unwrap();
    rig.shutdown();
}

// ── Socket params propagate from the keystore ──

#[test]
fn socket_params_applied_from_store() {
    let rig = LoopbackRig::start();

    rig.store
        .write(&keys::socket_params(INS_DOMID), "sndbuf:131072 rcvbuf:65536")
        .unwrap();
    std::thread::sleep(Duration::from_millis(600));

    let defaults = *rig.ins_shared().defaults.lock().unwrap();
    assert_eq!(defaults.sndbuf, Some(131072));
    assert_eq!(defaults.rcvbuf, Some(65536));

    rig.shutdown();
}

// ── Netflow backchannel boundary ──

#[test]
fn backchannel_feature_request() {
    use mwmux_pvm::backchannel::{
        Backchannel, FeatureRequest, FeatureResponse, FEATURE_RESPONSE_LEN,
    };

    let rig = LoopbackRig::start();
    let mut backchannel = Backchannel::start(
        rig.pvm.state(),
        Arc::clone(&rig.store) as Arc<dyn mwmux_bootstrap::KeyStore>,
        "127.0.0.1:0",
    )
    .unwrap();

    // The ip:port was published.
    let published = rig.store.read(&keys::netflow_port()).unwrap();
    assert!(published.ends_with(&format!(":{}", backchannel.port())));

    let mut consumer =
        TcpStream::connect(("127.0.0.1", backchannel.port())).unwrap();
    consumer
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    // Set an INS-global through the side channel.
    let req = FeatureRequest {
        id: 42,
        modify: true,
        name: AttribName::GlobalSndBuf as u32 as u16,
        sockfd: 0,
        value: 99999,
    };
    consumer.write_all(&req.encode()).unwrap();

    let mut buf = [0u8; FEATURE_RESPONSE_LEN];
    consumer.read_exact(&mut buf).unwrap();
    let resp = FeatureResponse::decode(&buf).unwrap();
    assert_eq!(resp.id, 42);
    assert_eq!(resp.status, 0);
    assert_eq!(
        rig.ins_shared().defaults.lock().unwrap().sndbuf,
        Some(99999)
    );

    backchannel.stop();
    rig.shutdown();
}

// ── Defer accept: returned connection already has data ──

#[test]
fn defer_accept_returns_warm_connection() {
    let rig = LoopbackRig::start();

    let s = create_stream(&rig);
    s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let bound = s.getsockname().unwrap();
    s.listen(8).unwrap();
    s.attrib(true, AttribName::DeferAccept, 1).unwrap();

    // A connection that never sends is not handed out; one with data is.
    let _idle = TcpStream::connect(bound).unwrap();
    let mut talker = TcpStream::connect(bound).unwrap();
    talker.write_all(b"warm").unwrap();

    let a = s.accept().expect("accept");
    let got = a.recv(16).unwrap();
    assert_eq!(got, b"warm");

    a.close().unwrap();
    s.close().unwrap();
    rig.shutdown();
}
