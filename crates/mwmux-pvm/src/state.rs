//! Process-wide PVM state and lifecycle.
//!
//! One `PvmState` per process, built over an established bootstrap
//! session. It owns the ring front end, the producer lock, the active
//! request registry, the instance map (the one strong owner of socket
//! instances), and the global poll wait queue. `Pvm` wraps it with the
//! subsystem threads: the response consumer and the poll monitor.

use mwmux_core::{mw_debug, mw_error, mw_info, mw_warn, Semaphore};
use mwmux_proto::config::GENERAL_RESPONSE_TIMEOUT;
use mwmux_proto::errno;
use mwmux_proto::message::{
    self, flags, is_critical_status, Message, Opcode, STATUS_INTERNAL_ERROR,
};
use mwmux_proto::payload::CreatePayload;
use mwmux_proto::{handle, sockaddr};
use mwmux_ring::{EventChannel, FrontRing, RingError, SharedRegion};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::active::{ActiveRegistry, ActiveRequest};
use crate::error::{PvmError, Result};
use crate::instance::SockInstance;
use crate::monitor;
use crate::mwsocket::Mwsocket;

/// Invoked (from the consuming syscall's context) when a latched SIGPIPE
/// is delivered. The default only logs; embedders that own a process can
/// install `libc::raise(SIGPIPE)` here.
pub type SigpipeHook = Box<dyn Fn(u32) + Send + Sync>;

/// First local handle value. Far above any host fd range so a glance at a
/// handle dump tells the two apart.
const LOCAL_ID_BASE: u32 = 0x1000;

/// Global wait queue for poll(): waiters park here, the poll monitor does
/// one wake per tick.
pub struct PollWaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl PollWaitQueue {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Park until the next wake or `timeout`. True when woken.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock().unwrap();
        let start_gen = *generation;
        while *generation == start_gen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(generation, deadline - now).unwrap();
            generation = guard;
            if result.timed_out() && *generation == start_gen {
                return false;
            }
        }
        true
    }

    pub fn wake_all(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        drop(generation);
        self.cond.notify_all();
    }
}

pub struct PvmConfig {
    pub monitor_interval: Duration,
    pub enable_monitor: bool,
    pub sigpipe_hook: Option<SigpipeHook>,
}

impl Default for PvmConfig {
    fn default() -> Self {
        Self {
            monitor_interval: mwmux_proto::config::POLL_MONITOR_INTERVAL,
            enable_monitor: true,
            sigpipe_hook: None,
        }
    }
}

pub struct PvmState {
    ring: FrontRing,
    /// Serializes request producers; the ring is SPSC per direction.
    request_lock: Mutex<()>,
    /// Posted by the event-channel callback; the response consumer parks
    /// here.
    pub consumer_sem: Arc<Semaphore>,
    pub actives: ActiveRegistry,
    pub instances: Mutex<HashMap<u32, Arc<SockInstance>>>,
    next_local: AtomicU32,
    pub waitq: PollWaitQueue,
    pub shutdown: AtomicBool,
    sigpipe_hook: SigpipeHook,
}

impl PvmState {
    fn new(ring: FrontRing, consumer_sem: Arc<Semaphore>, hook: Option<SigpipeHook>) -> Arc<Self> {
        Arc::new(Self {
            ring,
            request_lock: Mutex::new(()),
            consumer_sem,
            actives: ActiveRegistry::new(),
            instances: Mutex::new(HashMap::new()),
            next_local: AtomicU32::new(LOCAL_ID_BASE),
            waitq: PollWaitQueue::new(),
            shutdown: AtomicBool::new(false),
            sigpipe_hook: hook.unwrap_or_else(|| {
                Box::new(|local_id| {
                    mw_warn!("SIGPIPE for mwsocket {:#x}", local_id);
                })
            }),
        })
    }

    pub fn is_ring_down(&self) -> bool {
        self.ring.is_pending_exit()
    }

    pub fn ring_capacity(&self) -> u32 {
        self.ring.capacity()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Allocate an instance and make the instance map its owner.
    pub fn new_instance(&self) -> Arc<SockInstance> {
        let local_id = self.next_local.fetch_add(1, Ordering::Relaxed);
        let inst = SockInstance::new(local_id);
        self.instances
            .lock()
            .unwrap()
            .insert(local_id, Arc::clone(&inst));
        inst
    }

    pub fn lookup(&self, local_id: u32) -> Option<Arc<SockInstance>> {
        self.instances.lock().unwrap().get(&local_id).cloned()
    }

    pub fn remove_instance(&self, local_id: u32) {
        self.instances.lock().unwrap().remove(&local_id);
    }

    pub fn find_by_remote(&self, remote_fd: u32) -> Option<Arc<SockInstance>> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .find(|i| i.remote_fd() == remote_fd)
            .cloned()
    }

    pub(crate) fn deliver_sigpipe(&self, inst: &SockInstance) {
        if inst.take_pending_sigpipe() {
            mw_debug!("delivering SIGPIPE for mwsocket {:#x}", inst.local_id);
            (self.sigpipe_hook)(inst.local_id);
        }
    }

    /// Register an active request and produce the message.
    ///
    /// Rewrites id and (for socket-bound ops other than Create) the sockfd
    /// with the instance's remote handle. Ring-full rolls everything back
    /// and surfaces `WouldBlock`; the caller sees EAGAIN with no state
    /// changed.
    pub(crate) fn submit(
        &self,
        inst: Option<&Arc<SockInstance>>,
        mut msg: Message,
        deliver: bool,
    ) -> Result<Arc<ActiveRequest>> {
        if self.is_ring_down() {
            return Err(PvmError::RingDown);
        }

        let weak = inst.map(Arc::downgrade).unwrap_or_else(Weak::new);
        let actreq = self.actives.register(deliver, weak);

        msg.header.sig = message::MSG_SIG_REQUEST;
        msg.header.id = actreq.id;
        if let Some(inst) = inst {
            if msg.opcode() != Some(Opcode::Create) {
                msg.header.sockfd = inst.remote_fd();
            }
            if !inst.nonblocking.load(Ordering::Acquire) {
                msg.header.flags |= flags::CALLER_BLOCKING;
            }
            inst.get_ref();
        }

        let produced = {
            let _guard = self.request_lock.lock().unwrap();
            self.ring.produce_request(&msg)
        };

        match produced {
            Ok(()) => Ok(actreq),
            Err(e) => {
                self.actives.unregister(actreq.id);
                if let Some(inst) = inst {
                    inst.put_ref();
                }
                match e {
                    RingError::Full => Err(PvmError::WouldBlock),
                    _ => Err(PvmError::RingDown),
                }
            }
        }
    }

    /// Response consumer: correlate by id, post-process against the owning
    /// instance, then deliver or drop.
    fn handle_response(&self, mut msg: Message) {
        let Some(actreq) = self.actives.take(msg.header.id) else {
            mw_warn!("response for unknown id {}", msg.header.id);
            return;
        };

        // One load decides both the post-processing (adopt vs. reclaim an
        // accept child) and the delivery, so the two cannot disagree.
        let deliver = actreq.deliver_response.load(Ordering::Acquire);
        self.postprocess(&actreq, &mut msg, deliver);

        let inst = actreq.sockinst.upgrade();
        if deliver {
            actreq.complete(msg);
        }
        // else: originator died or fired-and-forgot; the response is
        // dropped here and the entry frees with the last Arc.

        if let Some(inst) = inst {
            inst.put_ref();
        }
    }

    /// Best-effort Close for a remote socket no local instance owns (an
    /// accept that completed after its waiter was abandoned). Nothing
    /// waits on the result.
    fn close_remote(&self, remote_fd: u32) {
        let Ok(mut msg) = Message::request(Opcode::Close, vec![]) else {
            return;
        };
        msg.header.sockfd = remote_fd;
        msg.header.flags |= flags::FIRE_AND_FORGET;
        if self.submit(None, msg, false).is_err() {
            mw_warn!("orphan close for remote {:#010x} not sent", remote_fd);
        }
    }

    /// Mirror of the remote state onto the instance, before the waiter is
    /// woken.
    fn postprocess(&self, actreq: &ActiveRequest, msg: &mut Message, deliver: bool) {
        let op = msg.opcode();
        let Some(inst) = actreq.sockinst.upgrade() else {
            return;
        };

        if msg.header.flags & flags::REMOTE_CLOSED != 0 {
            inst.remote_close_requested.store(true, Ordering::Release);
            // A failing-or-empty Send against a closed remote is the
            // SIGPIPE case; a Recv observing the close is not.
            if op == Some(Opcode::Send) {
                inst.latch_sigpipe();
            }
        }

        let status = msg.header.status;
        if status < 0 {
            if op != Some(Opcode::Close) {
                if status == -errno::MW_EPIPE || is_critical_status(status) {
                    inst.latch_sigpipe();
                } else {
                    inst.pending_errno.store(status, Ordering::Release);
                }
            }

            if op == Some(Opcode::Accept) {
                // The child was preallocated at write time; the accept
                // failed, so destroy it.
                if let Some(child) = inst.child.lock().unwrap().take() {
                    self.remove_instance(child.local_id);
                }
            }
        } else {
            match op {
                Some(Opcode::Create) => {
                    mw_debug!(
                        "mwsocket {:#x} bound to remote {:#010x}",
                        inst.local_id,
                        msg.header.sockfd
                    );
                    inst.set_remote_fd(msg.header.sockfd);
                }
                Some(Opcode::Accept) => {
                    match inst.child.lock().unwrap().take() {
                        Some(child) if deliver => {
                            child.set_remote_fd(status as u32);
                            mw_debug!(
                                "accept child {:#x} bound to remote {:#010x}",
                                child.local_id,
                                status
                            );
                            // The caller sees its local handle, never the
                            // remote one.
                            msg.header.status = child.local_id as i32;
                        }
                        Some(child) => {
                            // The waiter was abandoned but the accept
                            // succeeded: adopting would orphan the worker
                            // and its ESTABLISHED peer. Close the remote
                            // and destroy the preallocated child.
                            self.remove_instance(child.local_id);
                            self.close_remote(status as u32);
                        }
                        None => {
                            // The parent was released while the accept was
                            // in flight; the remote socket still exists.
                            self.close_remote(status as u32);
                        }
                    }
                }
                _ => {}
            }
        }

        if op.map_or(false, Opcode::needs_oplock) {
            inst.oplock.post();
        }
    }

    fn consumer_loop(self: Arc<Self>) {
        mwmux_core::log::set_thread_tag("pvm:rsp");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.ring.consume_response() {
                Ok(Some(msg)) => self.handle_response(msg),
                Ok(None) => {
                    self.consumer_sem.wait_timeout(Duration::from_millis(100));
                }
                Err(e) => {
                    mw_error!("response ring fatal: {}", e);
                    self.actives.fail_all();
                    break;
                }
            }
        }
        // Whatever is still in flight will never complete.
        self.actives.fail_all();
        mw_debug!("response consumer down");
    }
}

/// A running PVM front end.
pub struct Pvm {
    state: Arc<PvmState>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Pvm {
    /// Initialize the ring over the granted region and start the response
    /// consumer and poll monitor.
    pub fn start(
        region: Arc<SharedRegion>,
        evtchn: Arc<dyn EventChannel>,
        consumer_sem: Arc<Semaphore>,
        config: PvmConfig,
    ) -> Result<Self> {
        let ring = FrontRing::init(region, evtchn).map_err(|_| PvmError::RingDown)?;
        let state = PvmState::new(ring, consumer_sem, config.sigpipe_hook);

        let mut threads = Vec::new();
        {
            let state = Arc::clone(&state);
            threads.push(
                thread::Builder::new()
                    .name("mw-pvm-response".to_string())
                    .spawn(move || state.consumer_loop())
                    .map_err(|_| PvmError::RingDown)?,
            );
        }
        if config.enable_monitor {
            let state = Arc::clone(&state);
            let interval = config.monitor_interval;
            threads.push(
                thread::Builder::new()
                    .name("mw-pvm-pollmon".to_string())
                    .spawn(move || monitor::monitor_loop(state, interval))
                    .map_err(|_| PvmError::RingDown)?,
            );
        }

        mw_info!("PVM front end up, ring capacity {}", state.ring_capacity());
        Ok(Self { state, threads })
    }

    pub fn state(&self) -> Arc<PvmState> {
        Arc::clone(&self.state)
    }

    // ── The ioctl surface ──

    /// `CREATE_SOCKET(domain, type, protocol) -> mwsocket`
    pub fn create_socket(&self, family: u16, sock_type: u32, protocol: u32) -> Result<Mwsocket> {
        if family != sockaddr::MW_AF_INET && family != sockaddr::MW_AF_INET6 {
            return Err(PvmError::InvalidArgument);
        }
        let inst = self.state.new_instance();
        let sock = Mwsocket::new(Arc::clone(&self.state), Arc::clone(&inst));

        let payload = CreatePayload {
            family: family as u32,
            sock_type,
            protocol,
        }
        .encode();
        let msg =
            Message::request(Opcode::Create, payload).map_err(|_| PvmError::InvalidArgument)?;

        let result = sock
            .submit_and_wait(msg, Some(GENERAL_RESPONSE_TIMEOUT))
            .and_then(|resp| {
                if resp.header.status == STATUS_INTERNAL_ERROR {
                    // Worker pool exhausted on the INS: EMFILE-equivalent.
                    Err(PvmError::RemoteError(-errno::MW_EMFILE))
                } else if resp.header.status < 0 {
                    Err(PvmError::RemoteError(resp.header.status))
                } else {
                    Ok(())
                }
            });

        match result {
            Ok(()) => Ok(sock),
            Err(e) => {
                self.state.remove_instance(inst.local_id);
                Err(e)
            }
        }
    }

    /// `IS_MWSOCKET(fd)`
    pub fn is_mwsocket(fd: u32) -> bool {
        handle::is_mwsocket(fd)
    }

    /// Best-effort Close for every still-open instance, each awaited with
    /// a bounded timeout. Process-exit rundown.
    pub fn rundown(&self) {
        let instances: Vec<Arc<SockInstance>> = self
            .state
            .instances
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        if !instances.is_empty() {
            mw_info!("rundown: closing {} mwsockets", instances.len());
        }
        for inst in instances {
            let sock = Mwsocket::new(Arc::clone(&self.state), inst);
            let _ = sock.close();
        }
    }

    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        // Rundown needs the response consumer alive to await the Closes;
        // only then stop the threads.
        self.rundown();
        self.state.shutdown.store(true, Ordering::Release);
        self.state.consumer_sem.post();
        self.state.waitq.wake_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        mw_info!("PVM front end down");
    }
}

impl Drop for Pvm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
