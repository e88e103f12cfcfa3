//! Per-opcode handlers over the host socket API.
//!
//! Thin wrappers: translate the wire payload to host calls, translate host
//! errnos to the canonical table exactly once, and never panic across the
//! ring. Blocking waits (Accept, Recv on a blocking socket) are gated on
//! short host polls so a worker parked in one still notices shutdown and a
//! concurrently closed socket.
//!
//! The dispatcher may close a socket inline while its worker is blocked
//! here; every loop iteration therefore re-resolves the fd under the state
//! lock and turns a vanished fd into EBADF.

use mwmux_core::{mw_debug, mw_warn};
use mwmux_proto::attrib::{self, AttribName, AttribRequest};
use mwmux_proto::config::MAX_PAYLOAD;
use mwmux_proto::errno;
use mwmux_proto::handle;
use mwmux_proto::message::{flags, Message, MsgHeader, Opcode, STATUS_INTERNAL_ERROR};
use mwmux_proto::payload::{self, CreatePayload, RecvPayload};
use mwmux_proto::sockaddr::{WireSockAddrIn, MW_AF_INET, MW_AF_INET6, WIRE_SOCKADDR_LEN};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept4, bind, connect, getpeername, getsockname, getsockopt, listen, recv, recvfrom, send,
    setsockopt, shutdown, socket, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown as ShutHow,
    SockFlag, SockType, SockaddrIn,
};
use nix::sys::time::{TimeVal, TimeValLike};

use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::pollset;
use crate::pool::WorkerSlot;
use crate::state::InsShared;

/// Tick used to gate blocking host waits so shutdown and inline close are
/// noticed promptly.
const BLOCK_POLL_MS: u16 = 100;

pub fn respond(req: &MsgHeader, status: i32, payload: Vec<u8>) -> Message {
    match Message::response_to(req, status, payload) {
        Ok(msg) => msg,
        // Oversized payload is an engine bug; degrade to an internal error
        // rather than corrupting the ring.
        Err(_) => Message::response_to(req, STATUS_INTERNAL_ERROR, vec![])
            .expect("empty response fits a slot"),
    }
}

fn err_status(e: Errno) -> i32 {
    errno::neg_from_host(e as i32)
}

fn retry_eintr<T, F>(mut f: F) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

pub(crate) fn poll_raw(raw: RawFd, events: PollFlags, timeout: PollTimeout) -> nix::Result<PollFlags> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut fds = [PollFd::new(borrowed, events)];
    let n = retry_eintr(|| poll(&mut fds, timeout))?;
    if n == 0 {
        return Ok(PollFlags::empty());
    }
    Ok(fds[0].revents().unwrap_or_else(PollFlags::empty))
}

fn current_fd(slot: &WorkerSlot) -> Option<RawFd> {
    slot.sock.lock().unwrap().fd.as_ref().map(|f| f.as_raw_fd())
}

// ============================================================================
// Socketless handlers (dispatcher inline)
// ============================================================================

/// Create: allocate a worker, open the host socket, hand back the public
/// handle in `status`. Worker-pool exhaustion is the reserved internal
/// error so the PVM can latch it against the originating request.
pub fn create(shared: &InsShared, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(p) = CreatePayload::decode(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };

    let family = match p.family as u16 {
        MW_AF_INET => AddressFamily::Inet,
        MW_AF_INET6 => AddressFamily::Inet6,
        _ => return respond(req, -errno::MW_EAFNOSUPPORT, vec![]),
    };
    let stype = match p.sock_type {
        payload::MW_ST_STREAM => SockType::Stream,
        payload::MW_ST_DGRAM => SockType::Datagram,
        _ => return respond(req, -errno::MW_ESOCKTNOSUPPORT, vec![]),
    };

    let Some(slot) = shared.reserve_worker() else {
        mw_warn!("create: worker pool exhausted");
        return respond(req, STATUS_INTERNAL_ERROR, vec![]);
    };

    match socket(family, stype, SockFlag::SOCK_CLOEXEC, None) {
        Ok(fd) => {
            apply_defaults(shared, &fd);
            let public = handle::encode(shared.domid as u8, slot.idx);
            {
                let mut sock = slot.sock.lock().unwrap();
                sock.fd = Some(fd);
                sock.family = p.family;
                sock.sock_type = p.sock_type;
                sock.protocol = p.protocol;
            }
            slot.public_fd.store(public, Ordering::Release);
            shared.stats.open_sockets.fetch_add(1, Ordering::Relaxed);
            mw_debug!("create: worker {} -> handle {:#010x}", slot.idx, public);

            let mut resp = respond(req, public as i32, vec![]);
            resp.header.sockfd = public;
            resp
        }
        Err(e) => {
            shared.release_worker(&slot);
            respond(req, err_status(e), vec![])
        }
    }
}

/// Best-effort application of the INS-global defaults to a new socket.
fn apply_defaults(shared: &InsShared, fd: &OwnedFd) {
    let defaults = *shared.defaults.lock().unwrap();
    if let Some(v) = defaults.sndbuf {
        let _ = setsockopt(fd, sockopt::SndBuf, &(v.max(0) as usize));
    }
    if let Some(v) = defaults.rcvbuf {
        let _ = setsockopt(fd, sockopt::RcvBuf, &(v.max(0) as usize));
    }
    if let Some(v) = defaults.sndtimeo_us {
        let _ = setsockopt(fd, sockopt::SendTimeout, &TimeVal::microseconds(v));
    }
    if let Some(v) = defaults.rcvtimeo_us {
        let _ = setsockopt(fd, sockopt::ReceiveTimeout, &TimeVal::microseconds(v));
    }
}

// ============================================================================
// Per-socket dispatch
// ============================================================================

/// Run one per-socket request to completion and build its response.
pub fn execute(shared: &InsShared, slot: &Arc<WorkerSlot>, msg: &Message) -> Message {
    match msg.opcode() {
        Some(Opcode::Connect) => connect_op(slot, msg),
        Some(Opcode::Bind) => bind_op(slot, msg),
        Some(Opcode::Listen) => listen_op(slot, msg),
        Some(Opcode::Accept) => accept_op(shared, slot, msg),
        Some(Opcode::Send) => send_op(shared, slot, msg),
        Some(Opcode::Recv) => recv_op(shared, slot, msg, false),
        Some(Opcode::RecvFrom) => recv_op(shared, slot, msg, true),
        Some(Opcode::GetSockName) => name_op(slot, msg, false),
        Some(Opcode::GetPeerName) => name_op(slot, msg, true),
        Some(Opcode::Shutdown) => shutdown_op(slot, msg),
        Some(Opcode::Close) => close_op(shared, slot, msg),
        Some(Opcode::Attrib) => attrib(shared, Some(slot), msg),
        _ => respond(&msg.header, -errno::MW_EINVAL, vec![]),
    }
}

fn decode_addr(payload: &[u8]) -> Option<SocketAddrV4> {
    let wire = WireSockAddrIn::decode(payload)?;
    if wire.family != MW_AF_INET {
        return None;
    }
    Some(wire.to_socketaddr())
}

fn connect_op(slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(sa) = decode_addr(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };
    let Some(raw) = current_fd(slot) else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let sin = SockaddrIn::from(sa);
    match retry_eintr(|| connect(raw, &sin)) {
        Ok(()) => respond(req, 0, vec![]),
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

fn bind_op(slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(sa) = decode_addr(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };
    let mut sock = slot.sock.lock().unwrap();
    let Some(fd) = sock.fd.as_ref() else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let raw = fd.as_raw_fd();
    let sin = SockaddrIn::from(sa);
    match bind(raw, &sin) {
        Ok(()) => {
            // Learn the real port for the listeners publication; the
            // requested one may have been 0.
            let port = getsockname::<SockaddrIn>(raw)
                .map(|s| s.port())
                .unwrap_or(sa.port());
            sock.bound_port = Some(port);
            respond(req, 0, vec![])
        }
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

fn listen_op(slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(backlog) = payload::decode_listen(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };
    let mut sock = slot.sock.lock().unwrap();
    let Some(fd) = sock.fd.as_ref() else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let backlog = match Backlog::new(backlog.min(i32::MAX as u32) as i32) {
        Ok(b) => b,
        Err(e) => return respond(req, err_status(e), vec![]),
    };
    match listen(fd, backlog) {
        Ok(()) => {
            sock.listening = true;
            respond(req, 0, vec![])
        }
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

fn accept_op(shared: &InsShared, slot: &Arc<WorkerSlot>, msg: &Message) -> Message {
    let req = &msg.header;
    let (nonblocking, defer) = {
        let sock = slot.sock.lock().unwrap();
        if sock.fd.is_none() {
            return respond(req, -errno::MW_EBADF, vec![]);
        }
        (sock.nonblocking, sock.defer_accept)
    };

    if defer {
        return pollset::defer_accept(shared, slot, msg);
    }

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return respond(req, -errno::MW_EINTR, vec![]);
        }
        let Some(raw) = current_fd(slot) else {
            return respond(req, -errno::MW_EBADF, vec![]);
        };

        let revents = match poll_raw(raw, PollFlags::POLLIN, PollTimeout::from(BLOCK_POLL_MS)) {
            Ok(ev) => ev,
            Err(e) => return respond(req, err_status(e), vec![]),
        };

        if revents.intersects(PollFlags::POLLNVAL | PollFlags::POLLERR) {
            return respond(req, -errno::MW_EBADF, vec![]);
        }
        if revents.contains(PollFlags::POLLIN) {
            match retry_eintr(|| accept4(raw, SockFlag::SOCK_CLOEXEC)) {
                Ok(child_raw) => {
                    let child = unsafe { OwnedFd::from_raw_fd(child_raw) };
                    return adopt_accepted(shared, slot, req, child);
                }
                // Another readiness consumer beat us; go around.
                Err(Errno::EAGAIN) => continue,
                Err(e) => return respond(req, err_status(e), vec![]),
            }
        }
        if nonblocking {
            return respond(req, -errno::MW_EAGAIN, vec![]);
        }
    }
}

/// Bind an accepted host socket to a fresh worker slot and report its new
/// public handle in `status`, with the peer address as payload.
pub(crate) fn adopt_accepted(
    shared: &InsShared,
    listener: &WorkerSlot,
    req: &MsgHeader,
    child: OwnedFd,
) -> Message {
    let peer = getpeername::<SockaddrIn>(child.as_raw_fd())
        .map(|sin| SocketAddrV4::new(sin.ip(), sin.port()))
        .ok();

    let Some(child_slot) = shared.reserve_worker() else {
        mw_warn!("accept: worker pool exhausted, dropping connection");
        return respond(req, STATUS_INTERNAL_ERROR, vec![]);
    };

    let (family, sock_type, protocol) = {
        let listener_sock = listener.sock.lock().unwrap();
        (
            listener_sock.family,
            listener_sock.sock_type,
            listener_sock.protocol,
        )
    };

    let public = handle::encode(shared.domid as u8, child_slot.idx);
    {
        let mut sock = child_slot.sock.lock().unwrap();
        sock.fd = Some(child);
        sock.family = family;
        sock.sock_type = sock_type;
        sock.protocol = protocol;
    }
    child_slot.public_fd.store(public, Ordering::Release);
    shared.stats.open_sockets.fetch_add(1, Ordering::Relaxed);
    mw_debug!("accept: worker {} -> handle {:#010x}", child_slot.idx, public);

    let payload = peer
        .map(|sa| WireSockAddrIn::from_socketaddr(&sa).encode().to_vec())
        .unwrap_or_default();
    respond(req, public as i32, payload)
}

fn send_op(shared: &InsShared, slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(raw) = current_fd(slot) else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };

    // MSG_NOSIGNAL: a dead peer must become an errno, never a signal in
    // this process.
    match retry_eintr(|| send(raw, &msg.payload, MsgFlags::MSG_NOSIGNAL)) {
        Ok(n) => {
            shared.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            respond(req, 0, (n as u32).to_le_bytes().to_vec())
        }
        Err(e) => {
            let mut resp = respond(req, err_status(e), vec![]);
            if matches!(e, Errno::EPIPE | Errno::ECONNRESET) {
                slot.sock.lock().unwrap().remote_closed = true;
                resp.header.flags |= flags::REMOTE_CLOSED;
            }
            resp
        }
    }
}

fn recv_op(shared: &InsShared, slot: &WorkerSlot, msg: &Message, from: bool) -> Message {
    let req = &msg.header;
    let Some(p) = RecvPayload::decode(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };

    let cap = if from {
        MAX_PAYLOAD - WIRE_SOCKADDR_LEN
    } else {
        MAX_PAYLOAD
    };
    let wanted = (p.requested as usize).min(cap);
    let nonblocking = slot.sock.lock().unwrap().nonblocking;

    // Gate the blocking wait on short polls; the recv itself then cannot
    // hang the worker past a shutdown or an inline close.
    if !nonblocking {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return respond(req, -errno::MW_EINTR, vec![]);
            }
            let Some(raw) = current_fd(slot) else {
                return respond(req, -errno::MW_EBADF, vec![]);
            };
            let revents = match poll_raw(
                raw,
                PollFlags::POLLIN | PollFlags::POLLHUP,
                PollTimeout::from(BLOCK_POLL_MS),
            ) {
                Ok(ev) => ev,
                Err(e) => return respond(req, err_status(e), vec![]),
            };
            if revents.contains(PollFlags::POLLNVAL) {
                return respond(req, -errno::MW_EBADF, vec![]);
            }
            if revents.intersects(
                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
            ) {
                if revents.contains(PollFlags::POLLIN) {
                    slot.sock.lock().unwrap().saw_readable = true;
                }
                break;
            }
        }
    }

    let Some(raw) = current_fd(slot) else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let mut buf = vec![0u8; wanted];
    let recv_flags = MsgFlags::from_bits_truncate(p.recv_flags as i32);

    let result = if from {
        retry_eintr(|| recvfrom::<SockaddrIn>(raw, &mut buf)).map(|(n, addr)| (n, addr))
    } else {
        retry_eintr(|| recv(raw, &mut buf, recv_flags)).map(|n| (n, None))
    };

    match result {
        Ok((n, addr)) => {
            let mut payload = Vec::with_capacity(if from { WIRE_SOCKADDR_LEN + n } else { n });
            if from {
                let wire = addr
                    .map(|sin| {
                        WireSockAddrIn::from_socketaddr(&SocketAddrV4::new(sin.ip(), sin.port()))
                    })
                    .unwrap_or(WireSockAddrIn {
                        family: mwmux_proto::sockaddr::MW_AF_UNSET,
                        port: 0,
                        addr: 0,
                    });
                payload.extend_from_slice(&wire.encode());
            }
            payload.extend_from_slice(&buf[..n]);

            let mut resp = respond(req, 0, payload);
            if n > 0 {
                let mut sock = slot.sock.lock().unwrap();
                sock.saw_readable = true;
                drop(sock);
                shared.stats.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
            } else if wanted > 0 && zero_read_means_closed(slot, raw) {
                slot.sock.lock().unwrap().remote_closed = true;
                resp.header.flags |= flags::REMOTE_CLOSED;
            }
            resp
        }
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

/// A zero-byte read on a stream socket: end-of-stream, or just nothing to
/// read right now? Prior observed readiness settles it; otherwise one
/// zero-timeout host poll does.
fn zero_read_means_closed(slot: &WorkerSlot, raw: RawFd) -> bool {
    if slot.sock.lock().unwrap().saw_readable {
        return true;
    }
    match poll_raw(
        raw,
        PollFlags::POLLIN | PollFlags::POLLOUT,
        PollTimeout::ZERO,
    ) {
        // Readable yet recv produced nothing: the peer is gone.
        Ok(ev) => ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
        Err(_) => false,
    }
}

fn name_op(slot: &WorkerSlot, msg: &Message, peer: bool) -> Message {
    let req = &msg.header;
    let Some(raw) = current_fd(slot) else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let result = if peer {
        getpeername::<SockaddrIn>(raw)
    } else {
        getsockname::<SockaddrIn>(raw)
    };
    match result {
        Ok(sin) => {
            let sa = SocketAddrV4::new(sin.ip(), sin.port());
            respond(req, 0, WireSockAddrIn::from_socketaddr(&sa).encode().to_vec())
        }
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

fn shutdown_op(slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(how) = payload::decode_shutdown(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };
    let how = match how {
        0 => ShutHow::Read,
        1 => ShutHow::Write,
        2 => ShutHow::Both,
        _ => return respond(req, -errno::MW_EINVAL, vec![]),
    };
    let Some(raw) = current_fd(slot) else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    match shutdown(raw, how) {
        Ok(()) => respond(req, 0, vec![]),
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

/// Close the host socket. Idempotent: a second Close is a success, not a
/// crash. The dispatcher releases the worker slot after the response.
fn close_op(shared: &InsShared, slot: &WorkerSlot, msg: &Message) -> Message {
    let req = &msg.header;
    let mut sock = slot.sock.lock().unwrap();
    sock.warm.clear();
    if sock.fd.take().is_some() {
        shared.stats.open_sockets.fetch_sub(1, Ordering::Relaxed);
    }
    respond(req, 0, vec![])
}

// ============================================================================
// Attributes
// ============================================================================

/// Set/get one attribute: a per-socket option when `slot` resolves, an
/// INS-global default otherwise.
pub fn attrib(shared: &InsShared, slot: Option<&Arc<WorkerSlot>>, msg: &Message) -> Message {
    let req = &msg.header;
    let Some(a) = AttribRequest::decode(&msg.payload) else {
        return respond(req, -errno::MW_EINVAL, vec![]);
    };

    if a.name.is_global() {
        return attrib_global(shared, req, &a);
    }

    let Some(slot) = slot else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };

    let mut sock = slot.sock.lock().unwrap();
    let Some(fd) = sock.fd.as_ref() else {
        return respond(req, -errno::MW_EBADF, vec![]);
    };
    let raw = fd.as_raw_fd();

    let result: nix::Result<i64> = match (a.name, a.modify) {
        (AttribName::Nonblock, true) => {
            set_nonblock(raw, a.value != 0).map(|()| {
                sock.nonblocking = a.value != 0;
                a.value
            })
        }
        (AttribName::Nonblock, false) => Ok(sock.nonblocking as i64),
        (AttribName::ReuseAddr, true) => {
            setsockopt(fd, sockopt::ReuseAddr, &(a.value != 0)).map(|()| a.value)
        }
        (AttribName::ReuseAddr, false) => getsockopt(fd, sockopt::ReuseAddr).map(|v| v as i64),
        (AttribName::KeepAlive, true) => {
            setsockopt(fd, sockopt::KeepAlive, &(a.value != 0)).map(|()| a.value)
        }
        (AttribName::KeepAlive, false) => getsockopt(fd, sockopt::KeepAlive).map(|v| v as i64),
        (AttribName::SndBuf, true) => {
            setsockopt(fd, sockopt::SndBuf, &(a.value.max(0) as usize)).map(|()| a.value)
        }
        (AttribName::SndBuf, false) => getsockopt(fd, sockopt::SndBuf).map(|v| v as i64),
        (AttribName::RcvBuf, true) => {
            setsockopt(fd, sockopt::RcvBuf, &(a.value.max(0) as usize)).map(|()| a.value)
        }
        (AttribName::RcvBuf, false) => getsockopt(fd, sockopt::RcvBuf).map(|v| v as i64),
        (AttribName::SndTimeo, true) => {
            setsockopt(fd, sockopt::SendTimeout, &TimeVal::microseconds(a.value)).map(|()| a.value)
        }
        (AttribName::SndTimeo, false) => {
            getsockopt(fd, sockopt::SendTimeout).map(|tv| tv.num_microseconds())
        }
        (AttribName::RcvTimeo, true) => {
            setsockopt(fd, sockopt::ReceiveTimeout, &TimeVal::microseconds(a.value))
                .map(|()| a.value)
        }
        (AttribName::RcvTimeo, false) => {
            getsockopt(fd, sockopt::ReceiveTimeout).map(|tv| tv.num_microseconds())
        }
        (AttribName::DeferAccept, true) => {
            sock.defer_accept = a.value != 0;
            Ok(a.value)
        }
        (AttribName::DeferAccept, false) => Ok(sock.defer_accept as i64),
        (AttribName::Error, _) => {
            getsockopt(fd, sockopt::SocketError).map(|e| errno::from_host(e) as i64)
        }
        _ => return respond(req, -errno::MW_ENOPROTOOPT, vec![]),
    };

    match result {
        Ok(value) => respond(req, 0, attrib::encode_value(value)),
        Err(e) => respond(req, err_status(e), vec![]),
    }
}

fn attrib_global(shared: &InsShared, req: &MsgHeader, a: &AttribRequest) -> Message {
    let mut defaults = shared.defaults.lock().unwrap();
    let cell = match a.name {
        AttribName::GlobalSndBuf => &mut defaults.sndbuf,
        AttribName::GlobalRcvBuf => &mut defaults.rcvbuf,
        AttribName::GlobalSndTimeo => &mut defaults.sndtimeo_us,
        AttribName::GlobalRcvTimeo => &mut defaults.rcvtimeo_us,
        _ => return respond(req, -errno::MW_ENOPROTOOPT, vec![]),
    };
    if a.modify {
        *cell = Some(a.value);
    }
    respond(req, 0, attrib::encode_value(cell.unwrap_or(0)))
}

fn set_nonblock(raw: RawFd, enable: bool) -> nix::Result<()> {
    let bits = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if bits < 0 {
        return Err(Errno::last());
    }
    let bits = if enable {
        bits | libc::O_NONBLOCK
    } else {
        bits & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(raw, libc::F_SETFL, bits) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
