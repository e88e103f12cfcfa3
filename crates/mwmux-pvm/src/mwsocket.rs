//! The mwsocket handle surface.
//!
//! The device discipline is strict write-then-read per handle: `write`
//! parses one wire request, runs pre-processing (accept-child
//! preallocation, oplock, latch delivery), registers the active request
//! and produces it; `read` refuses unless a write announced it, then waits
//! on that request's latch and hands the wire response back. The typed
//! wrappers below compose the two the way a libc shim would.

use mwmux_core::mw_debug;
use mwmux_proto::attrib::{self, AttribName, AttribRequest};
use mwmux_proto::message::{flags, Message, Opcode};
use mwmux_proto::payload::{self, RecvPayload};
use mwmux_proto::sockaddr::{WireSockAddrIn, MW_AF_UNSET, WIRE_SOCKADDR_LEN};

use std::net::SocketAddrV4;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PvmError, Result};
use crate::instance::SockInstance;
use crate::state::PvmState;

pub struct Mwsocket {
    state: Arc<PvmState>,
    inst: Arc<SockInstance>,
}

impl Mwsocket {
    pub(crate) fn new(state: Arc<PvmState>, inst: Arc<SockInstance>) -> Self {
        Self { state, inst }
    }

    pub fn local_id(&self) -> u32 {
        self.inst.local_id
    }

    pub fn remote_fd(&self) -> u32 {
        self.inst.remote_fd()
    }

    pub fn instance(&self) -> &Arc<SockInstance> {
        &self.inst
    }

    // ── Device surface ──

    /// Submit one wire-encoded request.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let msg = Message::decode(bytes, true).map_err(|_| PvmError::InvalidArgument)?;
        self.submit_msg(msg)
    }

    /// Collect the response announced by the last `write`. Returns the
    /// wire-encoded response length.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let resp = self.read_response(None)?;
        let bytes = resp.encode();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    /// Read-and-clear the monitor-reported readiness for this handle.
    pub fn poll(&self) -> u16 {
        self.inst.take_poll_events()
    }

    /// Park on the global wait queue until this handle reports events or
    /// `timeout` expires. What a blocking `poll()` on the fd does.
    pub fn poll_wait(&self, timeout: Duration) -> u16 {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let events = self.inst.take_poll_events();
            if events != 0 {
                return events;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return 0;
            }
            self.state.waitq.wait(deadline - now);
        }
    }

    /// Abandon the in-flight blocking request: the waiter unblocks with
    /// EINTR and the late response is dropped by the consumer. Models a
    /// signal landing in the blocked syscall.
    pub fn interrupt_pending(&self) {
        if let Some(actreq) = self.inst.blockreq.lock().unwrap().as_ref() {
            actreq.interrupt();
        }
    }

    // ── Internals shared by write() and the typed wrappers ──

    pub(crate) fn submit_msg(&self, mut msg: Message) -> Result<()> {
        let op = msg.opcode().ok_or(PvmError::InvalidArgument)?;

        if self.inst.release_started.load(Ordering::Acquire) {
            return Err(PvmError::BadHandle);
        }

        // Deferred state from earlier fire-and-forget failures is
        // delivered on the next data operation.
        if matches!(op, Opcode::Send | Opcode::Recv | Opcode::RecvFrom) {
            self.state.deliver_sigpipe(&self.inst);
            if let Some(e) = self.inst.take_pending_errno() {
                return Err(PvmError::RemoteError(e));
            }
        }

        // An Accept must own its child before the request is visible to
        // the INS: the file must exist in the caller's context, not the
        // consumer thread's.
        let mut prealloc_child = None;
        if op == Opcode::Accept {
            let child = self.state.new_instance();
            *self.inst.child.lock().unwrap() = Some(Arc::clone(&child));
            prealloc_child = Some(child);
        }

        let oplock_taken = if op.needs_oplock() {
            if self.inst.nonblocking.load(Ordering::Acquire) {
                if !self.inst.oplock.try_wait() {
                    self.rollback_prealloc(prealloc_child);
                    return Err(PvmError::WouldBlock);
                }
            } else {
                self.inst.oplock.wait();
            }
            true
        } else {
            false
        };

        let deliver = msg.header.flags & flags::FIRE_AND_FORGET == 0;

        match self.state.submit(Some(&self.inst), msg, deliver) {
            Ok(actreq) => {
                if deliver {
                    self.inst.blockid.store(actreq.id, Ordering::Release);
                    *self.inst.blockreq.lock().unwrap() = Some(actreq);
                    self.inst.read_expected.store(true, Ordering::Release);
                }
                Ok(())
            }
            Err(e) => {
                // Full ring (or dead ring): roll every pre-processing step
                // back so a later retry starts clean.
                if oplock_taken {
                    self.inst.oplock.post();
                }
                self.rollback_prealloc(prealloc_child);
                Err(e)
            }
        }
    }

    fn rollback_prealloc(&self, child: Option<Arc<SockInstance>>) {
        if let Some(child) = child {
            *self.inst.child.lock().unwrap() = None;
            self.state.remove_instance(child.local_id);
        }
    }

    pub(crate) fn read_response(&self, timeout: Option<Duration>) -> Result<Message> {
        if !self.inst.read_expected.swap(false, Ordering::AcqRel) {
            return Err(PvmError::InvalidArgument);
        }
        // Cloned, not taken: interrupt_pending() must still find the
        // entry while we are parked on it.
        let actreq = self
            .inst
            .blockreq
            .lock()
            .unwrap()
            .clone()
            .ok_or(PvmError::InvalidArgument)?;

        let result = actreq.wait(timeout);
        *self.inst.blockreq.lock().unwrap() = None;
        if matches!(result, Err(PvmError::Timeout)) {
            // Abandon: the consumer will drop the late arrival.
            actreq.interrupt();
        }
        let resp = result?;

        // A SIGPIPE latched by this very response is delivered now, on
        // the consuming syscall.
        self.state.deliver_sigpipe(&self.inst);
        Ok(resp)
    }

    pub(crate) fn submit_and_wait(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.submit_msg(msg)?;
        self.read_response(timeout)
    }

    fn roundtrip(&self, op: Opcode, payload: Vec<u8>) -> Result<Message> {
        let msg = Message::request(op, payload).map_err(|_| PvmError::InvalidArgument)?;
        let resp = self.submit_and_wait(msg, None)?;
        if resp.header.status < 0 {
            return Err(PvmError::RemoteError(resp.header.status));
        }
        Ok(resp)
    }

    // ── Typed wrappers (what a libc shim composes out of write/read) ──

    pub fn connect(&self, addr: &SocketAddrV4) -> Result<()> {
        let wire = WireSockAddrIn::from_socketaddr(addr);
        self.roundtrip(Opcode::Connect, wire.encode().to_vec())
            .map(|_| ())
    }

    pub fn bind(&self, addr: &SocketAddrV4) -> Result<()> {
        let wire = WireSockAddrIn::from_socketaddr(addr);
        self.roundtrip(Opcode::Bind, wire.encode().to_vec())
            .map(|_| ())
    }

    pub fn listen(&self, backlog: u32) -> Result<()> {
        self.roundtrip(Opcode::Listen, payload::encode_listen(backlog))
            .map(|_| ())
    }

    /// Accept one connection; the returned handle is the child
    /// preallocated at write time, already bound to its remote socket.
    pub fn accept(&self) -> Result<Mwsocket> {
        let resp = self.roundtrip(Opcode::Accept, vec![])?;
        let child_local = resp.header.status as u32;
        let inst = self
            .state
            .lookup(child_local)
            .ok_or(PvmError::BadHandle)?;
        mw_debug!(
            "accept: parent {:#x} produced child {:#x}",
            self.inst.local_id,
            child_local
        );
        Ok(Mwsocket::new(Arc::clone(&self.state), inst))
    }

    /// Send; returns bytes actually accepted by the INS.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let resp = self.roundtrip(Opcode::Send, data.to_vec())?;
        let sent = resp
            .payload
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        Ok(sent as usize)
    }

    /// Receive up to `n` bytes. An empty vec after the remote closed is
    /// end-of-stream.
    pub fn recv(&self, n: u32) -> Result<Vec<u8>> {
        let resp = self.roundtrip(
            Opcode::Recv,
            RecvPayload {
                requested: n,
                recv_flags: 0,
            }
            .encode(),
        )?;
        Ok(resp.payload)
    }

    pub fn recvfrom(&self, n: u32) -> Result<(Vec<u8>, Option<SocketAddrV4>)> {
        let resp = self.roundtrip(
            Opcode::RecvFrom,
            RecvPayload {
                requested: n,
                recv_flags: 0,
            }
            .encode(),
        )?;
        if resp.payload.len() < WIRE_SOCKADDR_LEN {
            return Err(PvmError::InvalidArgument);
        }
        let wire = WireSockAddrIn::decode(&resp.payload).ok_or(PvmError::InvalidArgument)?;
        let src = if wire.family == MW_AF_UNSET {
            None
        } else {
            Some(wire.to_socketaddr())
        };
        Ok((resp.payload[WIRE_SOCKADDR_LEN..].to_vec(), src))
    }

    pub fn getsockname(&self) -> Result<SocketAddrV4> {
        let resp = self.roundtrip(Opcode::GetSockName, vec![])?;
        WireSockAddrIn::decode(&resp.payload)
            .map(|w| w.to_socketaddr())
            .ok_or(PvmError::InvalidArgument)
    }

    pub fn getpeername(&self) -> Result<SocketAddrV4> {
        let resp = self.roundtrip(Opcode::GetPeerName, vec![])?;
        WireSockAddrIn::decode(&resp.payload)
            .map(|w| w.to_socketaddr())
            .ok_or(PvmError::InvalidArgument)
    }

    pub fn shutdown(&self, how: u32) -> Result<()> {
        self.roundtrip(Opcode::Shutdown, payload::encode_shutdown(how))
            .map(|_| ())
    }

    /// `SOCKET_ATTRIBUTES(modify, attrib, value)` ioctl.
    pub fn attrib(&self, modify: bool, name: AttribName, value: i64) -> Result<i64> {
        let resp = self.roundtrip(
            Opcode::Attrib,
            AttribRequest {
                modify,
                name,
                value,
            }
            .encode(),
        )?;
        attrib::decode_value(&resp.payload).ok_or(PvmError::InvalidArgument)
    }

    /// O_NONBLOCK: mirrored locally (oplock, EAGAIN policy) and pushed to
    /// the remote socket.
    pub fn set_nonblocking(&self, on: bool) -> Result<()> {
        self.attrib(true, AttribName::Nonblock, on as i64)?;
        self.inst.nonblocking.store(on, Ordering::Release);
        Ok(())
    }

    /// User-visible close: send Close, await its response for a bounded
    /// time, then free the instance. Safe to call on a handle whose
    /// remote was never created.
    pub fn close(&self) -> Result<()> {
        if self.inst.release_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());
        if self.inst.has_remote() && !self.state.is_ring_down() {
            let msg =
                Message::request(Opcode::Close, vec![]).map_err(|_| PvmError::InvalidArgument)?;

            // release_started is already set; submit_msg would refuse.
            self.inst.oplock.wait();
            let submitted = self.state.submit(Some(&self.inst), msg, true);
            match submitted {
                Ok(actreq) => {
                    match actreq.wait(Some(mwmux_proto::config::GENERAL_RESPONSE_TIMEOUT)) {
                        Ok(resp) if resp.header.status < 0 => {
                            result = Err(PvmError::RemoteError(resp.header.status));
                        }
                        Ok(_) => {}
                        Err(PvmError::Timeout) => {
                            actreq.interrupt();
                            result = Err(PvmError::Timeout);
                        }
                        Err(e) => result = Err(e),
                    }
                    // The response path posts the oplock.
                }
                Err(e) => {
                    self.inst.oplock.post();
                    result = Err(e);
                }
            }
        }

        // Drop anything a dangling Accept preallocated.
        if let Some(child) = self.inst.child.lock().unwrap().take() {
            if !child.has_remote() {
                self.state.remove_instance(child.local_id);
            }
        }

        self.state.remove_instance(self.inst.local_id);
        result
    }
}
