//! Process-wide INS state and lifecycle.
//!
//! One `InsShared` is built at startup and handed (by `Arc`) to the
//! dispatcher, every worker, and the heartbeat thread; there are no other
//! globals. `Ins` owns the thread handles and drives ordered teardown.

use mwmux_bootstrap::{DomId, KeyStore};
use mwmux_core::{env_get, mw_error, mw_info, Semaphore};
use mwmux_proto::config::MAX_WORKER_COUNT;
use mwmux_proto::handle;
use mwmux_proto::message::Message;
use mwmux_ring::{BackRing, EventChannel, RingError, SharedRegion};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bufferpool::BufferPool;
use crate::dispatcher;
use crate::error::{InsError, Result};
use crate::heartbeat;
use crate::pool::{self, WorkerSlot};

/// Byte counters published with the heartbeat.
#[derive(Default)]
pub struct NetStats {
    pub open_sockets: AtomicI64,
    pub bytes_recv: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Socket defaults applied to newly created sockets; fed from the
/// `socket_params` bootstrap key and from global Attrib requests.
#[derive(Default, Clone, Copy)]
pub struct SockDefaults {
    pub sndbuf: Option<i64>,
    pub rcvbuf: Option<i64>,
    /// Microseconds.
    pub sndtimeo_us: Option<i64>,
    pub rcvtimeo_us: Option<i64>,
}

pub struct InsConfig {
    /// Live worker threads (<= the protocol's MAX_WORKER_COUNT).
    pub worker_count: usize,
    pub buffer_count: usize,
    pub worker_queue_depth: usize,
    pub heartbeat_interval: Duration,
}

impl Default for InsConfig {
    fn default() -> Self {
        let worker_count = env_get("MW_INS_WORKERS", 64usize)
            .clamp(2, MAX_WORKER_COUNT);
        Self {
            worker_count,
            buffer_count: worker_count + 50,
            worker_queue_depth: worker_count + 50,
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

pub struct InsShared {
    pub domid: DomId,
    pub ring: BackRing,
    /// Posted by the event-channel callback; the dispatcher parks here.
    pub consumer_sem: Arc<Semaphore>,
    /// Serializes response producers (workers and the dispatcher).
    response_lock: Mutex<()>,
    pub buffers: BufferPool,
    pub workers: Vec<Arc<WorkerSlot>>,
    pub defaults: Mutex<SockDefaults>,
    pub stats: NetStats,
    pub shutdown: AtomicBool,
}

impl InsShared {
    pub(crate) fn new(
        domid: DomId,
        ring: BackRing,
        consumer_sem: Arc<Semaphore>,
        config: &InsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            domid,
            ring,
            consumer_sem,
            response_lock: Mutex::new(()),
            buffers: BufferPool::new(config.buffer_count),
            workers: pool::new_slots(config.worker_count, config.worker_queue_depth),
            defaults: Mutex::new(SockDefaults::default()),
            stats: NetStats::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Produce one response. The ring is SPSC, so all INS producers funnel
    /// through this lock.
    pub fn produce_response(&self, msg: &Message) {
        let _guard = self.response_lock.lock().unwrap();
        match self.ring.produce_response(msg) {
            Ok(()) => {}
            Err(RingError::PendingExit) => {}
            Err(e) => mw_error!("response produce failed: {}", e),
        }
    }

    pub fn reserve_worker(&self) -> Option<Arc<WorkerSlot>> {
        pool::reserve(&self.workers)
    }

    pub fn find_worker(&self, sockfd: u32) -> Option<Arc<WorkerSlot>> {
        pool::find(&self.workers, sockfd)
    }

    /// Return a slot to the free pool, closing its socket if still open.
    pub fn release_worker(&self, slot: &WorkerSlot) {
        {
            let mut sock = slot.sock.lock().unwrap();
            if sock.fd.take().is_some() {
                self.stats.open_sockets.fetch_sub(1, Ordering::Relaxed);
            }
            *sock = Default::default();
        }
        slot.public_fd.store(handle::INVALID, Ordering::Release);
        slot.in_use.store(false, Ordering::Release);
    }

    // ── Daemon-facing shims (the ioctl surface of the INS driver) ──

    pub fn domid(&self) -> DomId {
        self.domid
    }

    /// `hex_open_sockets:hex_bytes_recv:hex_bytes_sent`
    pub fn network_stats_string(&self) -> String {
        format!(
            "{:x}:{:x}:{:x}",
            self.stats.open_sockets.load(Ordering::Relaxed).max(0),
            self.stats.bytes_recv.load(Ordering::Relaxed),
            self.stats.bytes_sent.load(Ordering::Relaxed)
        )
    }

    /// Space-separated hex ports currently in LISTEN.
    pub fn listeners_string(&self) -> String {
        let mut ports = Vec::new();
        for slot in &self.workers {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let sock = slot.sock.lock().unwrap();
            if sock.listening {
                if let Some(port) = sock.bound_port {
                    ports.push(format!("{:x}", port));
                }
            }
        }
        ports.join(" ")
    }

    /// Current defaults rendered as `name:value` tokens, the same shape
    /// the `socket_params` key uses.
    pub fn sock_params_string(&self) -> String {
        let defaults = self.defaults.lock().unwrap();
        let mut parts = Vec::new();
        if let Some(v) = defaults.sndbuf {
            parts.push(format!("sndbuf:{}", v));
        }
        if let Some(v) = defaults.rcvbuf {
            parts.push(format!("rcvbuf:{}", v));
        }
        if let Some(v) = defaults.sndtimeo_us {
            parts.push(format!("sndtimeo:{}", v));
        }
        if let Some(v) = defaults.rcvtimeo_us {
            parts.push(format!("rcvtimeo:{}", v));
        }
        parts.join(" ")
    }

    /// Apply one `name:value` socket-params token.
    pub fn apply_sock_param(&self, name: &str, value: i64) {
        use mwmux_proto::attrib::AttribName;
        let mut defaults = self.defaults.lock().unwrap();
        match AttribName::from_param_token(name) {
            Some(AttribName::GlobalSndBuf) => defaults.sndbuf = Some(value),
            Some(AttribName::GlobalRcvBuf) => defaults.rcvbuf = Some(value),
            Some(AttribName::GlobalSndTimeo) => defaults.sndtimeo_us = Some(value),
            Some(AttribName::GlobalRcvTimeo) => defaults.rcvtimeo_us = Some(value),
            _ => {}
        }
    }
}

/// A running INS instance.
pub struct Ins {
    shared: Arc<InsShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Ins {
    /// Bring the back end up over an established session: attach the ring,
    /// spawn the worker pool and dispatcher, and (when a store is given)
    /// the heartbeat publisher.
    pub fn start(
        domid: DomId,
        region: Arc<SharedRegion>,
        evtchn: Arc<dyn EventChannel>,
        consumer_sem: Arc<Semaphore>,
        store: Option<Arc<dyn KeyStore>>,
        config: InsConfig,
    ) -> Result<Self> {
        let ring = BackRing::attach(region, evtchn)?;
        let shared = InsShared::new(domid, ring, consumer_sem, &config);

        let mut threads = pool::spawn_workers(&shared).map_err(InsError::Spawn)?;

        {
            let shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name("mw-ins-dispatcher".to_string())
                    .spawn(move || dispatcher::dispatcher_loop(shared))
                    .map_err(InsError::Spawn)?,
            );
        }

        if let Some(store) = store {
            let shared = Arc::clone(&shared);
            let interval = config.heartbeat_interval;
            threads.push(
                thread::Builder::new()
                    .name("mw-ins-heartbeat".to_string())
                    .spawn(move || heartbeat::heartbeat_loop(shared, store, interval))
                    .map_err(InsError::Spawn)?,
            );
        }

        mw_info!(
            "INS {} up: {} workers, {} buffers",
            domid,
            config.worker_count,
            config.buffer_count
        );
        Ok(Self { shared, threads })
    }

    pub fn shared(&self) -> Arc<InsShared> {
        Arc::clone(&self.shared)
    }

    /// Stop every subsystem thread and join them.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.consumer_sem.post();
        for slot in &self.shared.workers {
            slot.wake.post();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        mw_info!("INS {} shut down", self.shared.domid);
    }
}

impl Drop for Ins {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mwmux_proto::config::GRANT_REF_COUNT;
    use mwmux_ring::notify::NullChannel;
    use mwmux_ring::FrontRing;

    fn shared() -> Arc<InsShared> {
        let region = Arc::new(SharedRegion::anon(GRANT_REF_COUNT).unwrap());
        let _front = FrontRing::init(Arc::clone(&region), Arc::new(NullChannel)).unwrap();
        let ring = BackRing::attach(region, Arc::new(NullChannel)).unwrap();
        InsShared::new(
            3,
            ring,
            Arc::new(Semaphore::new(0)),
            &InsConfig {
                worker_count: 4,
                buffer_count: 8,
                worker_queue_depth: 8,
                heartbeat_interval: Duration::from_secs(1),
            },
        )
    }

    #[test]
    fn test_network_stats_format() {
        let shared = shared();
        shared.stats.open_sockets.store(2, Ordering::Relaxed);
        shared.stats.bytes_recv.store(0xff, Ordering::Relaxed);
        shared.stats.bytes_sent.store(16, Ordering::Relaxed);
        assert_eq!(shared.network_stats_string(), "2:ff:10");
    }

    #[test]
    fn test_sock_params_round_trip() {
        let shared = shared();
        assert_eq!(shared.sock_params_string(), "");
        shared.apply_sock_param("sndbuf", 131072);
        shared.apply_sock_param("rcvtimeo", 500000);
        shared.apply_sock_param("bogus", 1);
        assert_eq!(
            shared.sock_params_string(),
            "sndbuf:131072 rcvtimeo:500000"
        );
    }

    #[test]
    fn test_release_worker_resets_slot() {
        let shared = shared();
        let slot = shared.reserve_worker().unwrap();
        slot.public_fd.store(handle::encode(3, slot.idx), Ordering::Release);
        shared.release_worker(&slot);
        assert!(!slot.in_use.load(Ordering::Acquire));
        assert_eq!(slot.public_fd.load(Ordering::Acquire), handle::INVALID);
        // The slot is reservable again.
        assert!(shared.reserve_worker().is_some());
    }
}
