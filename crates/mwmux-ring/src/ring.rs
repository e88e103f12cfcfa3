//! Front and back ring endpoints.
//!
//! The front ring (PVM) produces requests and consumes responses; the back
//! ring (INS) is the mirror image. Each of the four indices has exactly one
//! writer, so plain Acquire/Release atomics on the shared header are enough;
//! slot payloads are copied before the owning index is published.
//!
//! A request slot may be reused only once the *response* consumer has moved
//! past it, so the front's full check is against `rsp_cons`, not `req_cons`.
//! Responses can never overflow: they are produced at most 1:1 with consumed
//! requests.
//!
//! Within one VM many threads may want to produce; the caller serializes
//! them with a single producer-side lock. The consumer on each side is one
//! dedicated thread. Validation failure on any dequeued message is fatal:
//! the endpoint enters pending-exit and every later call fails.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use mwmux_proto::config::SLOT_SIZE;
use mwmux_proto::message::Message;

use crate::error::{Result, RingError};
use crate::layout::{self, capacity_for, RING_MAGIC, SLOT_ARRAY_OFFSET};
use crate::notify::EventChannel;
use crate::region::SharedRegion;

struct RawRing {
    region: Arc<SharedRegion>,
    slots: *mut u8,
    capacity: u32,
    mask: u32,
    pending_exit: AtomicBool,
    evtchn: Arc<dyn EventChannel>,
}

// Safety: shared-header access goes through atomics; slot buffers are
// exclusively owned between index claim and index publication. Producer
// calls within one VM are serialized by the caller's producer lock.
unsafe impl Send for RawRing {}
unsafe impl Sync for RawRing {}

impl RawRing {
    fn new(region: Arc<SharedRegion>, evtchn: Arc<dyn EventChannel>) -> Result<Self> {
        let capacity = capacity_for(region.len())?;
        let slots = unsafe { region.as_ptr().add(SLOT_ARRAY_OFFSET) };
        Ok(Self {
            region,
            slots,
            capacity,
            mask: capacity - 1,
            pending_exit: AtomicBool::new(false),
            evtchn,
        })
    }

    #[inline(always)]
    fn index(&self, off: usize) -> &AtomicU32 {
        // Header fields live in page 0 at fixed offsets; each has a single
        // writer (see layout.rs).
        unsafe { &*(self.region.as_ptr().add(off) as *const AtomicU32) }
    }

    fn check_live(&self) -> Result<()> {
        if self.pending_exit.load(Ordering::Acquire) {
            Err(RingError::PendingExit)
        } else {
            Ok(())
        }
    }

    fn fatal(&self) {
        self.pending_exit.store(true, Ordering::Release);
        // Kick the peer so a parked consumer notices teardown.
        self.evtchn.signal();
    }

    fn write_slot(&self, pos: u32, msg: &Message) {
        let idx = (pos & self.mask) as usize;
        let total = msg.header.size as usize;
        let mut staged = [0u8; SLOT_SIZE];
        msg.encode_into(&mut staged);
        unsafe {
            ptr::copy_nonoverlapping(staged.as_ptr(), self.slots.add(idx * SLOT_SIZE), total);
        }
    }

    fn read_slot(&self, pos: u32, buf: &mut [u8; SLOT_SIZE]) {
        let idx = (pos & self.mask) as usize;
        unsafe {
            ptr::copy_nonoverlapping(self.slots.add(idx * SLOT_SIZE), buf.as_mut_ptr(), SLOT_SIZE);
        }
    }

    /// Shared consume path for both directions.
    ///
    /// `cons_off`/`prod_off` select the direction; `notify_off` is the flag
    /// this consumer raises before reporting empty, so the peer's next
    /// produce rings the doorbell.
    fn consume(
        &self,
        cons_off: usize,
        prod_off: usize,
        notify_off: usize,
        expect_request: bool,
    ) -> Result<Option<Message>> {
        self.check_live()?;

        let cons = self.index(cons_off).load(Ordering::Relaxed);
        let mut prod = self.index(prod_off).load(Ordering::Acquire);

        if prod == cons {
            // Park intent first, then re-check, so a produce racing with us
            // either sees the flag or we see its index update.
            self.index(notify_off).store(1, Ordering::SeqCst);
            prod = self.index(prod_off).load(Ordering::SeqCst);
            if prod == cons {
                return Ok(None);
            }
        }
        self.index(notify_off).store(0, Ordering::SeqCst);

        let mut buf = [0u8; SLOT_SIZE];
        self.read_slot(cons, &mut buf);

        let msg = match Message::decode(&buf, expect_request) {
            Ok(msg) => msg,
            Err(e) => {
                self.fatal();
                return Err(RingError::Corrupt(e));
            }
        };

        self.index(cons_off)
            .store(cons.wrapping_add(1), Ordering::Release);
        Ok(Some(msg))
    }

    /// Shared produce path. Returns whether the peer asked to be woken.
    fn produce(&self, prod_off: usize, peer_notify_off: usize, msg: &Message) {
        let prod = self.index(prod_off).load(Ordering::Relaxed);
        self.write_slot(prod, msg);
        self.index(prod_off)
            .store(prod.wrapping_add(1), Ordering::Release);

        if self.index(peer_notify_off).load(Ordering::SeqCst) != 0 {
            self.evtchn.signal();
        }
    }
}

/// PVM endpoint: produces requests, consumes responses.
pub struct FrontRing {
    raw: RawRing,
}

impl FrontRing {
    /// Lay out a fresh ring over the region and initialize the shared
    /// header. Done once, by the granting side, before the peer attaches.
    pub fn init(region: Arc<SharedRegion>, evtchn: Arc<dyn EventChannel>) -> Result<Self> {
        let raw = RawRing::new(region, evtchn)?;
        raw.index(layout::OFF_REQ_PROD).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_REQ_CONS).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_RSP_PROD).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_RSP_CONS).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_REQ_NOTIFY).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_RSP_NOTIFY).store(0, Ordering::Relaxed);
        raw.index(layout::OFF_SLOT_COUNT)
            .store(raw.capacity, Ordering::Relaxed);
        raw.index(layout::OFF_MAGIC)
            .store(RING_MAGIC, Ordering::SeqCst);
        Ok(Self { raw })
    }

    /// Copy one request into the ring.
    ///
    /// Fails with `Full` when the ring holds `capacity` requests whose
    /// responses have not yet been consumed; the caller surfaces EAGAIN.
    pub fn produce_request(&self, msg: &Message) -> Result<()> {
        self.raw.check_live()?;

        let prod = self.raw.index(layout::OFF_REQ_PROD).load(Ordering::Relaxed);
        let rsp_cons = self.raw.index(layout::OFF_RSP_CONS).load(Ordering::Relaxed);
        if prod.wrapping_sub(rsp_cons) >= self.raw.capacity {
            return Err(RingError::Full);
        }

        self.raw
            .produce(layout::OFF_REQ_PROD, layout::OFF_REQ_NOTIFY, msg);
        Ok(())
    }

    /// Take one response off the ring, or report empty with park intent
    /// raised. The caller drains until `None` before parking.
    pub fn consume_response(&self) -> Result<Option<Message>> {
        self.raw.consume(
            layout::OFF_RSP_CONS,
            layout::OFF_RSP_PROD,
            layout::OFF_RSP_NOTIFY,
            false,
        )
    }

    /// Declare the ring fatally corrupt (protocol violation observed
    /// outside the ring itself, e.g. an impossible correlation id).
    pub fn fatal(&self) {
        self.raw.fatal();
    }

    pub fn is_pending_exit(&self) -> bool {
        self.raw.pending_exit.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }

    /// Outstanding requests: produced but their responses not yet consumed.
    pub fn in_flight(&self) -> u32 {
        let prod = self.raw.index(layout::OFF_REQ_PROD).load(Ordering::Relaxed);
        let rsp_cons = self.raw.index(layout::OFF_RSP_CONS).load(Ordering::Relaxed);
        prod.wrapping_sub(rsp_cons)
    }
}

/// INS endpoint: consumes requests, produces responses.
pub struct BackRing {
    raw: RawRing,
}

impl BackRing {
    /// Attach to a ring the front side already initialized.
    pub fn attach(region: Arc<SharedRegion>, evtchn: Arc<dyn EventChannel>) -> Result<Self> {
        let raw = RawRing::new(region, evtchn)?;
        if raw.index(layout::OFF_MAGIC).load(Ordering::SeqCst) != RING_MAGIC {
            return Err(RingError::BadHeader);
        }
        if raw.index(layout::OFF_SLOT_COUNT).load(Ordering::Relaxed) != raw.capacity {
            return Err(RingError::BadHeader);
        }
        Ok(Self { raw })
    }

    pub fn consume_request(&self) -> Result<Option<Message>> {
        self.raw.consume(
            layout::OFF_REQ_CONS,
            layout::OFF_REQ_PROD,
            layout::OFF_REQ_NOTIFY,
            true,
        )
    }

    /// Copy one response into the ring. Cannot overflow: responses are
    /// produced at most 1:1 with consumed requests.
    pub fn produce_response(&self, msg: &Message) -> Result<()> {
        self.raw.check_live()?;

        debug_assert!({
            let prod = self.raw.index(layout::OFF_RSP_PROD).load(Ordering::Relaxed);
            let cons = self.raw.index(layout::OFF_RSP_CONS).load(Ordering::Relaxed);
            prod.wrapping_sub(cons) < self.raw.capacity
        });

        self.raw
            .produce(layout::OFF_RSP_PROD, layout::OFF_RSP_NOTIFY, msg);
        Ok(())
    }

    pub fn fatal(&self) {
        self.raw.fatal();
    }

    pub fn is_pending_exit(&self) -> bool {
        self.raw.pending_exit.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        self.raw.capacity
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventSem, NullChannel};
    use mwmux_proto::config::GRANT_REF_COUNT;
    use mwmux_proto::message::Opcode;
    use std::time::Duration;

    fn pair() -> (FrontRing, BackRing, EventSem, EventSem) {
        let region = Arc::new(SharedRegion::anon(GRANT_REF_COUNT).unwrap());
        let to_ins = EventSem::new();
        let to_pvm = EventSem::new();
        // Front signals the INS-bound channel, back signals the PVM-bound one.
        let front_evt: Arc<dyn EventChannel> = Arc::new(EventSemProxy(to_ins.sem()));
        let back_evt: Arc<dyn EventChannel> = Arc::new(EventSemProxy(to_pvm.sem()));
        let front = FrontRing::init(Arc::clone(&region), front_evt).unwrap();
        let back = BackRing::attach(Arc::clone(&region), back_evt).unwrap();
        (front, back, to_ins, to_pvm)
    }

    /// Signals by posting a borrowed semaphore, so tests can watch it.
    struct EventSemProxy(Arc<mwmux_core::Semaphore>);

    impl EventChannel for EventSemProxy {
        fn signal(&self) {
            self.0.post();
        }
    }

    fn req(op: Opcode, id: u64, payload: &[u8]) -> Message {
        let mut msg = Message::request(op, payload.to_vec()).unwrap();
        msg.header.id = id;
        msg
    }

    #[test]
    fn test_round_trip() {
        let (front, back, _ti, _tp) = pair();

        front.produce_request(&req(Opcode::Send, 1, b"hello")).unwrap();
        let got = back.consume_request().unwrap().unwrap();
        assert_eq!(got.header.id, 1);
        assert_eq!(got.payload, b"hello");

        let rsp = Message::response_to(&got.header, 5, vec![]).unwrap();
        back.produce_response(&rsp).unwrap();

        let got = front.consume_response().unwrap().unwrap();
        assert_eq!(got.header.id, 1);
        assert_eq!(got.header.status, 5);
    }

    #[test]
    fn test_empty_returns_none() {
        let (front, back, _ti, _tp) = pair();
        assert!(back.consume_request().unwrap().is_none());
        assert!(front.consume_response().unwrap().is_none());
    }

    #[test]
    fn test_full_until_responses_consumed() {
        let (front, back, _ti, _tp) = pair();
        let cap = front.capacity() as u64;

        for id in 0..cap {
            front.produce_request(&req(Opcode::Send, id + 1, b"x")).unwrap();
        }
        assert_eq!(
            front.produce_request(&req(Opcode::Send, 999, b"x")),
            Err(RingError::Full)
        );

        // Draining requests alone is not enough: the slots are still owned
        // by the pending responses.
        let first = back.consume_request().unwrap().unwrap();
        assert_eq!(
            front.produce_request(&req(Opcode::Send, 999, b"x")),
            Err(RingError::Full)
        );

        // A consumed response frees its slot.
        let rsp = Message::response_to(&first.header, 0, vec![]).unwrap();
        back.produce_response(&rsp).unwrap();
        front.consume_response().unwrap().unwrap();
        front.produce_request(&req(Opcode::Send, 999, b"x")).unwrap();
    }

    #[test]
    fn test_indices_wrap() {
        let (front, back, _ti, _tp) = pair();
        let rounds = front.capacity() as u64 * 3 + 16;

        for id in 1..=rounds {
            front.produce_request(&req(Opcode::Send, id, b"wrap")).unwrap();
            let got = back.consume_request().unwrap().unwrap();
            assert_eq!(got.header.id, id);
            let rsp = Message::response_to(&got.header, 0, vec![]).unwrap();
            back.produce_response(&rsp).unwrap();
            let got = front.consume_response().unwrap().unwrap();
            assert_eq!(got.header.id, id);
        }
        assert_eq!(front.in_flight(), 0);
    }

    #[test]
    fn test_corrupt_slot_is_fatal() {
        let region = Arc::new(SharedRegion::anon(GRANT_REF_COUNT).unwrap());
        let front = FrontRing::init(Arc::clone(&region), Arc::new(NullChannel)).unwrap();
        let back = BackRing::attach(Arc::clone(&region), Arc::new(NullChannel)).unwrap();

        front.produce_request(&req(Opcode::Send, 1, b"ok")).unwrap();

        // Scribble over the slot's signature before the back consumes it.
        unsafe {
            let slot = region.as_ptr().add(SLOT_ARRAY_OFFSET);
            *slot = 0x00;
            *slot.add(1) = 0x00;
        }

        assert!(matches!(
            back.consume_request(),
            Err(RingError::Corrupt(_))
        ));
        assert!(back.is_pending_exit());
        assert!(matches!(back.consume_request(), Err(RingError::PendingExit)));
    }

    #[test]
    fn test_attach_requires_init() {
        let region = Arc::new(SharedRegion::anon(GRANT_REF_COUNT).unwrap());
        assert!(matches!(
            BackRing::attach(Arc::clone(&region), Arc::new(NullChannel)),
            Err(RingError::BadHeader)
        ));
    }

    #[test]
    fn test_parked_consumer_gets_signal() {
        let (front, back, to_ins, _tp) = pair();

        // Drain to empty: the back registers park intent.
        assert!(back.consume_request().unwrap().is_none());

        front.produce_request(&req(Opcode::Close, 7, b"")).unwrap();
        assert!(to_ins.sem().wait_timeout(Duration::from_millis(100)));
        assert!(back.consume_request().unwrap().is_some());
    }

    #[test]
    fn test_no_signal_when_not_parked() {
        let (front, _back, to_ins, _tp) = pair();
        // Nobody raised the request-notify flag yet.
        front.produce_request(&req(Opcode::Close, 7, b"")).unwrap();
        assert!(!to_ins.sem().wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_threaded_echo() {
        let (front, back, to_ins, to_pvm) = pair();
        let front = Arc::new(front);
        let back = Arc::new(back);
        let n = 1000u64;

        let back2 = Arc::clone(&back);
        let ins_sem = to_ins.sem();
        let echo = std::thread::spawn(move || {
            let mut handled = 0u64;
            while handled < n {
                match back2.consume_request().unwrap() {
                    Some(got) => {
                        let rsp =
                            Message::response_to(&got.header, got.header.id as i32, vec![])
                                .unwrap();
                        back2.produce_response(&rsp).unwrap();
                        handled += 1;
                    }
                    None => {
                        ins_sem.wait_timeout(Duration::from_millis(100));
                    }
                }
            }
        });

        let pvm_sem = to_pvm.sem();
        let mut next_send = 1u64;
        let mut received = 0u64;
        while received < n {
            while next_send <= n {
                match front.produce_request(&req(Opcode::Send, next_send, b"e")) {
                    Ok(()) => next_send += 1,
                    Err(RingError::Full) => break,
                    Err(e) => panic!("produce: {}", e),
                }
            }
            match front.consume_response().unwrap() {
                Some(got) => {
                    received += 1;
                    assert_eq!(got.header.status as u64, got.header.id);
                }
                None => {
                    pvm_sem.wait_timeout(Duration::from_millis(100));
                }
            }
        }

        echo.join().unwrap();
        assert_eq!(front.in_flight(), 0);
    }
}
