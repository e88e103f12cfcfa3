//! # mwmux-loopback — Both VM sides in one process
//!
//! Wires a complete PVM front end and INS back end over one anonymous
//! shared region, with the in-memory keystore standing in for the
//! hypervisor store and `LoopbackHypervisor` for grants and event
//! channels. The full bootstrap handshake runs for real; only the
//! privileged seams are faked.
//!
//! This is the substrate for the scenario tests and `cmd/mw-smoke`. The
//! INS talks to the actual host network stack, so sockets created through
//! the rig carry real traffic against 127.0.0.1 peers.

use mwmux_bootstrap::keystore::MemStore;
use mwmux_bootstrap::loopback::LoopbackHypervisor;
use mwmux_bootstrap::{
    EventChannelAlloc, EventChannelBind, GrantMap, GrantOffer, InsHandshake, KeyStore,
    PvmHandshake, PvmSession,
};
use mwmux_core::Semaphore;
use mwmux_ins::{Ins, InsConfig, InsShared};
use mwmux_pvm::{Pvm, PvmConfig};
use std::sync::Arc;
use std::time::Duration;

pub const PVM_DOMID: u16 = 1;
pub const INS_DOMID: u16 = 7;

/// Options the tests most often want to vary.
pub struct RigConfig {
    pub ins: InsConfig,
    pub pvm: PvmConfig,
    /// Publish heartbeat/stats/listeners into the rig's keystore.
    pub heartbeat: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            ins: InsConfig {
                worker_count: 16,
                buffer_count: 24,
                worker_queue_depth: 24,
                heartbeat_interval: Duration::from_millis(200),
            },
            pvm: PvmConfig::default(),
            heartbeat: true,
        }
    }
}

pub struct LoopbackRig {
    // Declaration order is drop order: the PVM's rundown still needs a
    // live INS, so `pvm` must come first.
    pub pvm: Pvm,
    pub ins: Ins,
    pub store: Arc<MemStore>,
    pub hv: Arc<LoopbackHypervisor>,
    pvm_handshake: PvmHandshake,
    pvm_session: PvmSession,
}

impl LoopbackRig {
    pub fn start() -> Self {
        Self::start_with(RigConfig::default())
    }

    pub fn start_with(config: RigConfig) -> Self {
        let store = Arc::new(MemStore::new());
        let hv = LoopbackHypervisor::new();

        let pvm_handshake = PvmHandshake::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn GrantOffer>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn EventChannelAlloc>,
            PVM_DOMID,
        );
        let ins_handshake = InsHandshake::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn GrantMap>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn EventChannelBind>,
            INS_DOMID,
        );

        // The event-channel callbacks post the ring consumers' semaphores.
        let pvm_sem = Arc::new(Semaphore::new(0));
        let ins_sem = Arc::new(Semaphore::new(0));

        let pvm_cb = Arc::clone(&pvm_sem);
        let server = std::thread::spawn(move || {
            pvm_handshake
                .run(Box::new(move || pvm_cb.post()), Duration::from_secs(10))
                .map(|session| (pvm_handshake, session))
        });

        let ins_cb = Arc::clone(&ins_sem);
        let ins_session = ins_handshake
            .run(Box::new(move || ins_cb.post()), Duration::from_secs(10))
            .expect("INS handshake");
        let (pvm_handshake, pvm_session) = server
            .join()
            .expect("handshake thread")
            .expect("PVM handshake");

        // Ring layout order matters: the front end writes the header, the
        // back end validates it at attach.
        let pvm = Pvm::start(
            Arc::clone(&pvm_session.region),
            Arc::clone(&pvm_session.evtchn),
            pvm_sem,
            config.pvm,
        )
        .expect("PVM start");

        let hb_store = if config.heartbeat {
            Some(Arc::clone(&store) as Arc<dyn KeyStore>)
        } else {
            None
        };
        let ins = Ins::start(
            INS_DOMID,
            Arc::clone(&ins_session.region),
            Arc::clone(&ins_session.evtchn),
            ins_sem,
            hb_store,
            config.ins,
        )
        .expect("INS start");

        Self {
            pvm,
            ins,
            store,
            hv,
            pvm_handshake,
            pvm_session,
        }
    }

    pub fn ins_shared(&self) -> Arc<InsShared> {
        self.ins.shared()
    }

    /// Orderly teardown: PVM rundown first, then the INS, then the
    /// bootstrap keys and grants.
    pub fn shutdown(mut self) {
        self.pvm.shutdown();
        self.ins.shutdown();
        let _ = self.pvm_handshake.teardown(&self.pvm_session);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mwmux_bootstrap::keys;

    #[test]
    fn test_rig_comes_up_and_down() {
        let rig = LoopbackRig::start();
        assert_eq!(rig.pvm.state().instance_count(), 0);
        // Bootstrap artifacts are in place.
        assert!(rig.store.read(&keys::server_id()).is_some());
        assert_eq!(
            rig.store.read(&keys::vm_evt_chn_bound(INS_DOMID)),
            Some("1".to_string())
        );
        rig.shutdown();
    }

    #[test]
    fn test_heartbeat_publishes() {
        let rig = LoopbackRig::start();
        std::thread::sleep(Duration::from_millis(600));
        let beat: u64 = rig
            .store
            .read(&keys::heartbeat(INS_DOMID))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        assert!(beat >= 1, "heartbeat {}", beat);
        let stats = rig.store.read(&keys::network_stats(INS_DOMID)).unwrap();
        assert_eq!(stats.split(':').count(), 3);
        rig.shutdown();
    }
}
