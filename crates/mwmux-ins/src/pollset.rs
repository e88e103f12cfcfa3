//! Readiness reporting and defer-accept.
//!
//! PollsetQuery is the INS half of the PVM's poll support: one inline scan
//! of every open socket, each polled with zero timeout, reported with the
//! host's poll bits unmodified. The PVM never computes readiness itself.
//!
//! Defer-accept keeps a per-listener warming pool of connections that are
//! TCP-established but not yet worth handing to the PVM: an accepted
//! socket is returned only once it has readable data, and reaped if it
//! stays idle past the window.

use mwmux_core::mw_trace;
use mwmux_proto::config::{DEFER_ACCEPT_MAX_IDLE, MAX_WORKER_COUNT};
use mwmux_proto::errno;
use mwmux_proto::message::Message;
use mwmux_proto::payload::{encode_pollset, PollsetEntry};

use nix::poll::{PollFlags, PollTimeout};
use nix::sys::socket::{accept4, SockFlag};

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{self, poll_raw, respond};
use crate::pool::WorkerSlot;
use crate::state::InsShared;

/// Events a pollset scan asks the host about.
fn scan_events() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLPRI
}

/// Report readiness of every open socket. Zero open sockets yields a
/// zero-length list.
pub fn query(shared: &InsShared, msg: &Message) -> Message {
    let mut entries = Vec::new();

    for slot in &shared.workers {
        if !slot.in_use.load(Ordering::Acquire) {
            continue;
        }
        let mut sock = slot.sock.lock().unwrap();
        let Some(fd) = sock.fd.as_ref() else {
            continue;
        };
        let raw = fd.as_raw_fd();
        let revents = poll_raw(raw, scan_events(), PollTimeout::ZERO)
            .unwrap_or_else(|_| PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            sock.saw_readable = true;
        }
        entries.push(PollsetEntry {
            sockfd: slot.public_fd.load(Ordering::Acquire),
            events: revents.bits() as u16,
        });
    }

    mw_trace!("pollset: {} sockets reported", entries.len());
    respond(&msg.header, 0, encode_pollset(&entries))
}

// ============================================================================
// Defer-accept warming pool
// ============================================================================

struct WarmEntry {
    fd: OwnedFd,
    arrived: Instant,
}

/// Accepted-but-idle connections held per listener. Bounded by the worker
/// count: more simultaneous warm connections than workers could never be
/// handed out anyway.
#[derive(Default)]
pub struct WarmPool {
    entries: Vec<WarmEntry>,
}

impl WarmPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Admit one freshly accepted connection; over capacity it is dropped
    /// (closed) on the floor.
    pub fn admit(&mut self, fd: OwnedFd) {
        if self.entries.len() >= MAX_WORKER_COUNT {
            return;
        }
        self.entries.push(WarmEntry {
            fd,
            arrived: Instant::now(),
        });
    }

    /// Take the first connection with readable data; reap entries that
    /// died or idled past `window`.
    pub fn take_ready(&mut self, window: Duration) -> Option<OwnedFd> {
        let mut i = 0;
        while i < self.entries.len() {
            let raw = self.entries[i].fd.as_raw_fd();
            let revents = poll_raw(raw, PollFlags::POLLIN | PollFlags::POLLHUP, PollTimeout::ZERO)
                .unwrap_or_else(|_| PollFlags::empty());

            if revents.contains(PollFlags::POLLIN) {
                return Some(self.entries.swap_remove(i).fd);
            }
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
                || self.entries[i].arrived.elapsed() > window
            {
                // Closed or idle past the window: reap.
                self.entries.swap_remove(i);
                continue;
            }
            i += 1;
        }
        None
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Accept with the defer-accept attribute set: harvest pending
/// connections non-blocking into the warming pool and hand back the first
/// one that turns readable within the idle window.
pub fn defer_accept(shared: &InsShared, slot: &Arc<WorkerSlot>, msg: &Message) -> Message {
    let req = &msg.header;

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return respond(req, -errno::MW_EINTR, vec![]);
        }

        let nonblocking;
        let ready = {
            let mut sock = slot.sock.lock().unwrap();
            let Some(fd) = sock.fd.as_ref() else {
                return respond(req, -errno::MW_EBADF, vec![]);
            };
            let raw = fd.as_raw_fd();
            nonblocking = sock.nonblocking;

            // Drain everything currently pending on the listener.
            loop {
                let revents = match poll_raw(raw, PollFlags::POLLIN, PollTimeout::ZERO) {
                    Ok(ev) => ev,
                    Err(e) => {
                        return respond(req, errno::neg_from_host(e as i32), vec![]);
                    }
                };
                if !revents.contains(PollFlags::POLLIN) {
                    break;
                }
                match accept4(raw, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                    Ok(child_raw) => {
                        let child = unsafe { OwnedFd::from_raw_fd(child_raw) };
                        sock.warm.admit(child);
                    }
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => break,
                    Err(e) => {
                        return respond(req, errno::neg_from_host(e as i32), vec![]);
                    }
                }
            }

            sock.warm.take_ready(DEFER_ACCEPT_MAX_IDLE)
        };

        if let Some(child) = ready {
            // Warm sockets were accepted non-blocking; hand them out in the
            // mode the listener runs in.
            if !nonblocking {
                let _ = clear_nonblock(&child);
            }
            return engine::adopt_accepted(shared, slot, req, child);
        }

        if nonblocking {
            return respond(req, -errno::MW_EAGAIN, vec![]);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn clear_nonblock(fd: &OwnedFd) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let bits = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if bits < 0 {
        return Err(nix::errno::Errno::last());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, bits & !libc::O_NONBLOCK) } < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    fn accepted_pair() -> (OwnedFd, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let fd = unsafe { OwnedFd::from_raw_fd(server.into_raw_fd()) };
        (fd, client)
    }

    #[test]
    fn test_warm_pool_returns_readable() {
        let (fd, mut client) = accepted_pair();
        let mut warm = WarmPool::default();
        warm.admit(fd);

        // Nothing readable yet.
        assert!(warm.take_ready(Duration::from_secs(10)).is_none());
        assert_eq!(warm.len(), 1);

        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
        // Give the loopback a moment.
        std::thread::sleep(Duration::from_millis(50));

        let ready = warm.take_ready(Duration::from_secs(10));
        assert!(ready.is_some());
        assert!(warm.is_empty());
    }

    #[test]
    fn test_warm_pool_reaps_idle() {
        let (fd, _client) = accepted_pair();
        let mut warm = WarmPool::default();
        warm.admit(fd);
        std::thread::sleep(Duration::from_millis(30));
        assert!(warm.take_ready(Duration::from_millis(10)).is_none());
        assert!(warm.is_empty());
    }

    #[test]
    fn test_warm_pool_reaps_closed() {
        let (fd, client) = accepted_pair();
        let mut warm = WarmPool::default();
        warm.admit(fd);
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        // A closed connection with no data is reaped, not returned.
        // (A close after data would surface as readable first.)
        let got = warm.take_ready(Duration::from_secs(10));
        assert!(got.is_none() || warm.is_empty());
    }
}
