//! Hypervisor seams: page grants and event channels.
//!
//! The core never talks to the hypervisor directly; it consumes these four
//! traits. Real deployments back them with grant-table and event-channel
//! bindings; tests and single-host runs use the `loopback` module.

use crate::error::Result;
use mwmux_ring::{EventChannel, SharedRegion};
use std::sync::Arc;

/// Domain id as published in the key store.
pub type DomId = u16;

/// A grant reference naming one shared page.
pub type GrantRef = u32;

/// Callback invoked when the peer signals our end of an event channel.
/// Runs in interrupt-ish context: it must only post a semaphore.
pub type EventHandler = Box<dyn Fn() + Send + Sync>;

/// PVM side: allocate pages and offer the peer access to them.
pub trait GrantOffer: Send + Sync {
    /// Allocate `pages` contiguous shared pages, offer one foreign-access
    /// grant per page to `remote`. Returns the region and the per-page
    /// grant references, in page order.
    fn offer(&self, remote: DomId, pages: usize) -> Result<(Arc<SharedRegion>, Vec<GrantRef>)>;

    /// Revoke previously offered grants.
    fn release(&self, refs: &[GrantRef]);
}

/// INS side: map granted pages as one contiguous region.
pub trait GrantMap: Send + Sync {
    fn map(&self, remote: DomId, refs: &[GrantRef]) -> Result<Arc<SharedRegion>>;
}

/// PVM side: allocate an unbound event-channel port for `remote` and hook
/// our receive callback to it. The returned channel signals the peer.
pub trait EventChannelAlloc: Send + Sync {
    fn alloc_unbound(
        &self,
        remote: DomId,
        handler: EventHandler,
    ) -> Result<(u32, Arc<dyn EventChannel>)>;
}

/// INS side: bind a local channel to the peer's published port.
pub trait EventChannelBind: Send + Sync {
    fn bind(
        &self,
        remote: DomId,
        port: u32,
        handler: EventHandler,
    ) -> Result<Arc<dyn EventChannel>>;
}

/// Render grant refs the way they are published: space-separated hex.
pub fn format_grant_refs(refs: &[GrantRef]) -> String {
    refs.iter()
        .map(|r| format!("{:x}", r))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a published grant-ref list.
pub fn parse_grant_refs(s: &str) -> Option<Vec<GrantRef>> {
    s.split_whitespace()
        .map(|tok| GrantRef::from_str_radix(tok, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_ref_round_trip() {
        let refs = vec![0x1u32, 0xff, 0xabc];
        let s = format_grant_refs(&refs);
        assert_eq!(s, "1 ff abc");
        assert_eq!(parse_grant_refs(&s), Some(refs));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_grant_refs("12 zz"), None);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_grant_refs(""), Some(vec![]));
    }
}
