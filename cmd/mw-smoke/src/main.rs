//! mwmux End-to-End Smoke Test
//!
//! Brings both VM sides up in one process over the loopback rig and runs
//! real traffic through the whole stack:
//!   Part A — Bootstrap: keystore handshake, grants, event channel
//!   Part B — Echo: Create/Connect/Send/Recv/Close against a host peer
//!   Part C — Listener: Bind/Listen/Accept plus the published port list
//!   Part D — Edges: nonblocking accept, double close, pollset
//!
//! Run: ./target/release/mw-smoke
//! (No privileges needed; the hypervisor seams are in-process.)

use mwmux_bootstrap::keys;
use mwmux_bootstrap::KeyStore;
use mwmux_loopback::{LoopbackRig, INS_DOMID};
use mwmux_proto::attrib::AttribName;
use mwmux_proto::sockaddr::MW_AF_INET;
use mwmux_proto::{errno, handle, payload};
use mwmux_pvm::PvmError;

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
        }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok {
            self.pass(name);
        } else {
            self.fail(name, reason);
        }
    }

    fn summary(&self) -> i32 {
        println!("\n{}", LINE);
        println!(
            "  {} tests: {} passed, {} failed",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

fn main() {
    let mut t = TestRunner::new();

    // ── Part A: bootstrap ──
    t.section("Part A — Bootstrap handshake");
    let rig = LoopbackRig::start();
    t.check(
        "server id published",
        rig.store.read(&keys::server_id()).is_some(),
        "missing key",
    );
    t.check(
        "event channel bound",
        rig.store.read(&keys::vm_evt_chn_bound(INS_DOMID)).as_deref() == Some("1"),
        "bound marker missing",
    );
    t.check(
        "grant refs published",
        rig.store
            .read(&keys::gnt_ref(INS_DOMID))
            .map_or(0, |v| v.split_whitespace().count())
            == mwmux_proto::config::GRANT_REF_COUNT,
        "wrong grant count",
    );

    // ── Part B: echo ──
    t.section("Part B — Echo round trip");
    let listener = TcpListener::bind("127.0.0.1:0").expect("host listener");
    let addr = match listener.local_addr().expect("addr") {
        std::net::SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let server = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });

    match rig.pvm.create_socket(MW_AF_INET, payload::MW_ST_STREAM, 0) {
        Ok(c) => {
            t.check(
                "create yields an mwsocket handle",
                handle::is_mwsocket(c.remote_fd()),
                "bad handle",
            );
            t.check("connect", c.connect(&addr).is_ok(), "connect failed");
            t.check("send 5 bytes", c.send(b"hello") == Ok(5), "short send");
            t.check(
                "recv echoes",
                c.recv(5).as_deref() == Ok(b"hello".as_slice()),
                "wrong bytes",
            );
            t.check("close", c.close().is_ok(), "close failed");
            let shared = rig.ins_shared();
            t.check(
                "buffer pool back to capacity",
                shared.buffers.free_count() == shared.buffers.capacity(),
                "buffers leaked",
            );
        }
        Err(e) => t.fail("create socket", &e.to_string()),
    }
    server.join().ok();

    // ── Part C: listener ──
    t.section("Part C — Listener and accept");
    match rig.pvm.create_socket(MW_AF_INET, payload::MW_ST_STREAM, 0) {
        Ok(s) => {
            let bind_ok = s
                .bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
                .and_then(|_| s.listen(16));
            t.check("bind + listen", bind_ok.is_ok(), "failed");
            if let Ok(bound) = s.getsockname() {
                let mut client = TcpStream::connect(bound).expect("host connect");
                match s.accept() {
                    Ok(a) => {
                        t.check(
                            "accept yields a distinct handle",
                            a.local_id() != s.local_id(),
                            "same handle",
                        );
                        client.write_all(b"inbound").ok();
                        t.check(
                            "recv on accepted socket",
                            a.recv(64).as_deref() == Ok(b"inbound".as_slice()),
                            "wrong bytes",
                        );
                        std::thread::sleep(Duration::from_millis(500));
                        let published = rig
                            .store
                            .read(&keys::listeners(INS_DOMID))
                            .unwrap_or_default();
                        t.check(
                            "listener port published in hex",
                            published
                                .split_whitespace()
                                .any(|tok| tok == format!("{:x}", bound.port())),
                            &format!("{:?} missing {:x}", published, bound.port()),
                        );
                        a.close().ok();
                    }
                    Err(e) => t.fail("accept", &e.to_string()),
                }
            }
            s.close().ok();
        }
        Err(e) => t.fail("create listener", &e.to_string()),
    }

    // ── Part D: edges ──
    t.section("Part D — Edge behaviors");
    if let Ok(s) = rig.pvm.create_socket(MW_AF_INET, payload::MW_ST_STREAM, 0) {
        s.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).ok();
        s.listen(4).ok();
        s.set_nonblocking(true).ok();
        t.check(
            "nonblocking accept returns EAGAIN",
            matches!(s.accept(), Err(PvmError::RemoteError(e)) if e == -errno::MW_EAGAIN),
            "expected EAGAIN",
        );
        t.check("close", s.close().is_ok(), "close failed");
        t.check("double close is a no-op", s.close().is_ok(), "second close failed");
    }
    if let Ok(c) = rig.pvm.create_socket(MW_AF_INET, payload::MW_ST_STREAM, 0) {
        t.check(
            "attrib get sndbuf",
            c.attrib(false, AttribName::SndBuf, 0).map_or(false, |v| v > 0),
            "no value",
        );
        c.close().ok();
    }

    rig.shutdown();
    std::process::exit(t.summary());
}
