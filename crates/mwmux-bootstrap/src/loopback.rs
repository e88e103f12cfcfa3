//! In-process implementations of the hypervisor seams.
//!
//! One `LoopbackHypervisor` stands in for the grant table and the event
//! channel fabric between two "VMs" living in the same process. Grants are
//! anonymous shared mappings registered under sequential refs; an event
//! channel is a pair of registered handlers where signaling one end runs
//! the handler installed at the other.

use crate::error::{BootstrapError, Result};
use crate::grant::{
    DomId, EventChannelAlloc, EventChannelBind, EventHandler, GrantMap, GrantOffer, GrantRef,
};
use mwmux_ring::{EventChannel, SharedRegion};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct PortState {
    server_handler: Option<EventHandler>,
    client_handler: Option<EventHandler>,
}

struct Inner {
    next_ref: GrantRef,
    next_port: u32,
    // First ref of an offer -> the whole region.
    grants: HashMap<GrantRef, Arc<SharedRegion>>,
    ports: HashMap<u32, PortState>,
}

pub struct LoopbackHypervisor {
    inner: Mutex<Inner>,
}

impl LoopbackHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_ref: 0x100,
                next_port: 1,
                grants: HashMap::new(),
                ports: HashMap::new(),
            }),
        })
    }

    fn signal(&self, port: u32, to_server: bool) {
        // Take the handler reference under the lock, run it outside? The
        // handlers only post semaphores, so running under the lock is
        // harmless and keeps unbind simple.
        let inner = self.inner.lock().unwrap();
        if let Some(state) = inner.ports.get(&port) {
            let handler = if to_server {
                &state.server_handler
            } else {
                &state.client_handler
            };
            if let Some(h) = handler {
                h();
            }
        }
    }
}

/// Signal end handed to one side; rings the opposite side's handler.
struct LoopbackChannel {
    hv: Arc<LoopbackHypervisor>,
    port: u32,
    peer_is_server: bool,
}

impl EventChannel for LoopbackChannel {
    fn signal(&self) {
        self.hv.signal(self.port, self.peer_is_server);
    }
}

impl GrantOffer for Arc<LoopbackHypervisor> {
    fn offer(&self, _remote: DomId, pages: usize) -> Result<(Arc<SharedRegion>, Vec<GrantRef>)> {
        let region = Arc::new(
            SharedRegion::anon(pages).map_err(|e| BootstrapError::Grant(e.to_string()))?,
        );
        let mut inner = self.inner.lock().unwrap();
        let first = inner.next_ref;
        inner.next_ref += pages as GrantRef;
        inner.grants.insert(first, Arc::clone(&region));
        let refs = (0..pages as GrantRef).map(|i| first + i).collect();
        Ok((region, refs))
    }

    fn release(&self, refs: &[GrantRef]) {
        if let Some(first) = refs.first() {
            self.inner.lock().unwrap().grants.remove(first);
        }
    }
}

impl GrantMap for Arc<LoopbackHypervisor> {
    fn map(&self, _remote: DomId, refs: &[GrantRef]) -> Result<Arc<SharedRegion>> {
        let first = refs
            .first()
            .ok_or_else(|| BootstrapError::Grant("empty grant list".into()))?;
        let inner = self.inner.lock().unwrap();
        let region = inner
            .grants
            .get(first)
            .ok_or_else(|| BootstrapError::Grant(format!("unknown grant ref {:#x}", first)))?;
        if region.pages() != refs.len() {
            return Err(BootstrapError::Grant(format!(
                "grant count {} does not match region of {} pages",
                refs.len(),
                region.pages()
            )));
        }
        Ok(Arc::clone(region))
    }
}

impl EventChannelAlloc for Arc<LoopbackHypervisor> {
    fn alloc_unbound(
        &self,
        _remote: DomId,
        handler: EventHandler,
    ) -> Result<(u32, Arc<dyn EventChannel>)> {
        let mut inner = self.inner.lock().unwrap();
        let port = inner.next_port;
        inner.next_port += 1;
        inner.ports.insert(
            port,
            PortState {
                server_handler: Some(handler),
                client_handler: None,
            },
        );
        Ok((
            port,
            Arc::new(LoopbackChannel {
                hv: Arc::clone(self),
                port,
                peer_is_server: false,
            }),
        ))
    }
}

impl EventChannelBind for Arc<LoopbackHypervisor> {
    fn bind(
        &self,
        _remote: DomId,
        port: u32,
        handler: EventHandler,
    ) -> Result<Arc<dyn EventChannel>> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .ports
            .get_mut(&port)
            .ok_or_else(|| BootstrapError::EventChannel(format!("no such port {}", port)))?;
        state.client_handler = Some(handler);
        Ok(Arc::new(LoopbackChannel {
            hv: Arc::clone(self),
            port,
            peer_is_server: true,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mwmux_core::Semaphore;
    use std::time::Duration;

    #[test]
    fn test_grant_offer_and_map_share_memory() {
        let hv = LoopbackHypervisor::new();
        let (region, refs) = hv.offer(2, 4).unwrap();
        assert_eq!(refs.len(), 4);
        let mapped = hv.map(1, &refs).unwrap();

        unsafe {
            *region.as_ptr() = 0x42;
            assert_eq!(*mapped.as_ptr(), 0x42);
        }
    }

    #[test]
    fn test_map_unknown_ref_fails() {
        let hv = LoopbackHypervisor::new();
        assert!(hv.map(1, &[0xdead]).is_err());
    }

    #[test]
    fn test_release_revokes() {
        let hv = LoopbackHypervisor::new();
        let (_region, refs) = hv.offer(2, 1).unwrap();
        hv.release(&refs);
        assert!(hv.map(1, &refs).is_err());
    }

    #[test]
    fn test_event_channel_both_directions() {
        let hv = LoopbackHypervisor::new();
        let server_sem = Arc::new(Semaphore::new(0));
        let client_sem = Arc::new(Semaphore::new(0));

        let s = Arc::clone(&server_sem);
        let (port, to_client) = hv
            .alloc_unbound(2, Box::new(move || s.post()))
            .unwrap();

        let c = Arc::clone(&client_sem);
        let to_server = hv.bind(1, port, Box::new(move || c.post())).unwrap();

        to_client.signal();
        assert!(client_sem.wait_timeout(Duration::from_millis(100)));

        to_server.signal();
        assert!(server_sem.wait_timeout(Duration::from_millis(100)));
    }

    #[test]
    fn test_bind_unknown_port_fails() {
        let hv = LoopbackHypervisor::new();
        assert!(hv.bind(1, 99, Box::new(|| {})).is_err());
    }
}
