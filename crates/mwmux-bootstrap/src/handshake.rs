//! Handshake state machines.
//!
//! The ordering is the whole protocol:
//!
//! PVM ("server"):
//! 1. register a watch on `ROOT`, then publish its domain id at
//!    `ROOT/server_id` (watch first, so a racing announcement cannot be
//!    missed);
//! 2. wait for `ROOT/<insid>/client_id` with a non-zero integer;
//! 3. allocate an unbound event-channel port toward that domain and publish
//!    the port number;
//! 4. allocate the shared pages, offer one grant per page, publish the
//!    space-delimited hex grant list;
//! 5. wait for the INS to mark the channel bound; the ring may now be
//!    initialized on the shared pages.
//!
//! INS ("client"):
//! 1. wait for `ROOT/server_id` to be non-zero (publishing before the
//!    server's watch exists would be lost);
//! 2. publish its own domain id at `ROOT/<insid>/client_id`;
//! 3. wait for the grant list, map the pages as one region;
//! 4. wait for the port, bind it, publish the bound marker.
//!
//! Any step failing aborts the handshake with an error; the caller decides
//! whether to retry. Teardown removes everything under `ROOT/<insid>` and
//! releases the grants.

use crate::error::{BootstrapError, Result};
use crate::grant::{
    self, DomId, EventChannelAlloc, EventChannelBind, EventHandler, GrantMap, GrantOffer,
    GrantRef,
};
use crate::keys;
use crate::keystore::{wait_for_key, KeyStore};
use mwmux_core::{mw_debug, mw_info};
use mwmux_proto::config::GRANT_REF_COUNT;
use mwmux_ring::{EventChannel, SharedRegion};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn parse_domid(s: &str, what: &'static str) -> Result<DomId> {
    s.trim()
        .parse::<DomId>()
        .map_err(|_| BootstrapError::BadValue(format!("{}: {:?}", what, s)))
}

/// Established PVM-side session: everything the ring front end needs.
pub struct PvmSession {
    pub remote_domid: DomId,
    pub region: Arc<SharedRegion>,
    pub evtchn: Arc<dyn EventChannel>,
    pub port: u32,
    pub grant_refs: Vec<GrantRef>,
}

impl std::fmt::Debug for PvmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvmSession")
            .field("remote_domid", &self.remote_domid)
            .field("region", &self.region)
            .field("port", &self.port)
            .field("grant_refs", &self.grant_refs)
            .finish()
    }
}

pub struct PvmHandshake {
    store: Arc<dyn KeyStore>,
    grants: Arc<dyn GrantOffer>,
    evtchn: Arc<dyn EventChannelAlloc>,
    own_domid: DomId,
}

impl PvmHandshake {
    pub fn new(
        store: Arc<dyn KeyStore>,
        grants: Arc<dyn GrantOffer>,
        evtchn: Arc<dyn EventChannelAlloc>,
        own_domid: DomId,
    ) -> Self {
        Self {
            store,
            grants,
            evtchn,
            own_domid,
        }
    }

    /// Drive the server side to completion. `handler` is invoked whenever
    /// the INS signals the event channel (it must only post a semaphore).
    pub fn run(&self, handler: EventHandler, timeout: Duration) -> Result<PvmSession> {
        let deadline = Instant::now() + timeout;
        let remaining = |what: &'static str| -> Result<Duration> {
            let now = Instant::now();
            if now >= deadline {
                Err(BootstrapError::Timeout(what))
            } else {
                Ok(deadline - now)
            }
        };

        // Watch before publishing so the announcement cannot slip past us.
        let watch = self.store.watch(keys::ROOT);
        self.store
            .write(&keys::server_id(), &self.own_domid.to_string())?;
        mw_info!("handshake: published server id {}", self.own_domid);

        // Wait for an INS to announce itself.
        let remote_domid = loop {
            let budget = remaining("client_id")?;
            let ev = watch
                .wait(budget)
                .ok_or(BootstrapError::Timeout("client_id"))?;
            if let Some(insid) = keys::parse_client_id_path(&ev.path) {
                match self.store.read(&ev.path) {
                    Some(val) if val.trim() != "0" => {
                        let announced = parse_domid(&val, "client_id")?;
                        if announced != insid {
                            return Err(BootstrapError::BadValue(format!(
                                "client_id {} under path for {}",
                                announced, insid
                            )));
                        }
                        break insid;
                    }
                    _ => continue,
                }
            }
        };
        mw_info!("handshake: INS domain {} announced", remote_domid);

        let (port, evtchn) = self.evtchn.alloc_unbound(remote_domid, handler)?;
        self.store
            .write(&keys::vm_evt_chn_port(remote_domid), &port.to_string())?;
        mw_debug!("handshake: published event channel port {}", port);

        let (region, grant_refs) = self.grants.offer(remote_domid, GRANT_REF_COUNT)?;
        self.store.write(
            &keys::gnt_ref(remote_domid),
            &grant::format_grant_refs(&grant_refs),
        )?;
        mw_debug!("handshake: published {} grant refs", grant_refs.len());

        wait_for_key(
            self.store.as_ref(),
            &keys::vm_evt_chn_bound(remote_domid),
            remaining("vm_evt_chn_bound")?,
            "vm_evt_chn_bound",
            |v| v.trim() == "1",
        )?;

        mw_info!("handshake: INS {} bound, ring region ready", remote_domid);
        Ok(PvmSession {
            remote_domid,
            region,
            evtchn,
            port,
            grant_refs,
        })
    }

    /// Remove everything published for `session` and revoke its grants.
    pub fn teardown(&self, session: &PvmSession) -> Result<()> {
        self.store
            .remove_subtree(&keys::ins_dir(session.remote_domid))?;
        self.grants.release(&session.grant_refs);
        Ok(())
    }
}

/// Established INS-side session.
pub struct InsSession {
    pub remote_domid: DomId,
    pub region: Arc<SharedRegion>,
    pub evtchn: Arc<dyn EventChannel>,
}

impl std::fmt::Debug for InsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsSession")
            .field("remote_domid", &self.remote_domid)
            .field("region", &self.region)
            .finish()
    }
}

pub struct InsHandshake {
    store: Arc<dyn KeyStore>,
    grant_map: Arc<dyn GrantMap>,
    evtchn: Arc<dyn EventChannelBind>,
    own_domid: DomId,
}

impl InsHandshake {
    pub fn new(
        store: Arc<dyn KeyStore>,
        grant_map: Arc<dyn GrantMap>,
        evtchn: Arc<dyn EventChannelBind>,
        own_domid: DomId,
    ) -> Self {
        Self {
            store,
            grant_map,
            evtchn,
            own_domid,
        }
    }

    pub fn run(&self, handler: EventHandler, timeout: Duration) -> Result<InsSession> {
        let deadline = Instant::now() + timeout;
        let remaining = |what: &'static str| -> Result<Duration> {
            let now = Instant::now();
            if now >= deadline {
                Err(BootstrapError::Timeout(what))
            } else {
                Ok(deadline - now)
            }
        };

        let server = wait_for_key(
            self.store.as_ref(),
            &keys::server_id(),
            remaining("server_id")?,
            "server_id",
            |v| v.trim() != "0" && !v.trim().is_empty(),
        )?;
        let remote_domid = parse_domid(&server, "server_id")?;
        mw_info!("handshake: PVM is domain {}", remote_domid);

        self.store.write(
            &keys::client_id(self.own_domid),
            &self.own_domid.to_string(),
        )?;

        let refs_str = wait_for_key(
            self.store.as_ref(),
            &keys::gnt_ref(self.own_domid),
            remaining("gnt_ref")?,
            "gnt_ref",
            |v| !v.trim().is_empty(),
        )?;
        let refs = grant::parse_grant_refs(&refs_str)
            .ok_or_else(|| BootstrapError::BadValue(format!("gnt_ref: {:?}", refs_str)))?;
        let region = self.grant_map.map(remote_domid, &refs)?;
        mw_debug!("handshake: mapped {} granted pages", region.pages());

        let port_str = wait_for_key(
            self.store.as_ref(),
            &keys::vm_evt_chn_port(self.own_domid),
            remaining("vm_evt_chn_port")?,
            "vm_evt_chn_port",
            |v| !v.trim().is_empty(),
        )?;
        let port: u32 = port_str
            .trim()
            .parse()
            .map_err(|_| BootstrapError::BadValue(format!("vm_evt_chn_port: {:?}", port_str)))?;
        let evtchn = self.evtchn.bind(remote_domid, port, handler)?;
        self.store
            .write(&keys::vm_evt_chn_bound(self.own_domid), "1")?;
        mw_info!("handshake: bound event channel port {}", port);

        Ok(InsSession {
            remote_domid,
            region,
            evtchn,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemStore;
    use crate::loopback::LoopbackHypervisor;
    use mwmux_core::Semaphore;

    fn rig() -> (
        Arc<MemStore>,
        Arc<LoopbackHypervisor>,
        PvmHandshake,
        InsHandshake,
    ) {
        let store = Arc::new(MemStore::new());
        let hv = LoopbackHypervisor::new();
        let pvm = PvmHandshake::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn GrantOffer>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn EventChannelAlloc>,
            1,
        );
        let ins = InsHandshake::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn GrantMap>,
            Arc::new(Arc::clone(&hv)) as Arc<dyn EventChannelBind>,
            7,
        );
        (store, hv, pvm, ins)
    }

    #[test]
    fn test_full_handshake() {
        let (store, _hv, pvm, ins) = rig();

        let pvm_sem = Arc::new(Semaphore::new(0));
        let ins_sem = Arc::new(Semaphore::new(0));

        let p = Arc::clone(&pvm_sem);
        let pvm_thread = std::thread::spawn(move || {
            pvm.run(Box::new(move || p.post()), Duration::from_secs(5))
                .map(|s| (pvm, s))
        });

        let i = Arc::clone(&ins_sem);
        let ins_session = ins
            .run(Box::new(move || i.post()), Duration::from_secs(5))
            .unwrap();
        let (pvm, pvm_session) = pvm_thread.join().unwrap().unwrap();

        assert_eq!(pvm_session.remote_domid, 7);
        assert_eq!(ins_session.remote_domid, 1);
        assert_eq!(pvm_session.region.pages(), GRANT_REF_COUNT);
        assert_eq!(ins_session.region.pages(), GRANT_REF_COUNT);

        // Same physical pages.
        unsafe {
            *pvm_session.region.as_ptr().add(100) = 0x5a;
            assert_eq!(*ins_session.region.as_ptr().add(100), 0x5a);
        }

        // Event channel works both ways.
        pvm_session.evtchn.signal();
        assert!(ins_sem.wait_timeout(Duration::from_millis(100)));
        ins_session.evtchn.signal();
        assert!(pvm_sem.wait_timeout(Duration::from_millis(100)));

        // Bound marker was published.
        assert_eq!(
            store.read(&keys::vm_evt_chn_bound(7)),
            Some("1".to_string())
        );

        // Teardown clears the INS subtree but not the server key.
        pvm.teardown(&pvm_session).unwrap();
        assert_eq!(store.read(&keys::client_id(7)), None);
        assert_eq!(store.read(&keys::gnt_ref(7)), None);
        assert!(store.read(&keys::server_id()).is_some());
    }

    #[test]
    fn test_ins_times_out_without_server() {
        let (_store, _hv, _pvm, ins) = rig();
        let err = ins
            .run(Box::new(|| {}), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout("server_id")));
    }

    #[test]
    fn test_pvm_times_out_without_client() {
        let (_store, _hv, pvm, _ins) = rig();
        let err = pvm
            .run(Box::new(|| {}), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout(_)));
    }

    #[test]
    fn test_zero_client_id_ignored() {
        let (store, _hv, pvm, _ins) = rig();
        let store2 = Arc::clone(&store);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            store2.write(&keys::client_id(9), "0").unwrap();
        });
        let err = pvm
            .run(Box::new(|| {}), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Timeout(_)));
    }
}
