//! Heartbeat and status publication.
//!
//! Renews `ROOT/<insid>/heartbeat` on an interval and republishes the
//! network statistics and listener list alongside it. Also picks up
//! `socket_params` changes and folds them into the socket defaults.

use mwmux_bootstrap::{keys, KeyStore};
use mwmux_core::{mw_debug, mw_info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::state::InsShared;

pub fn heartbeat_loop(shared: Arc<InsShared>, store: Arc<dyn KeyStore>, interval: Duration) {
    mwmux_core::log::set_thread_tag("ins:hb");
    let domid = shared.domid;

    let ip = discover_ip();
    let _ = store.write(&keys::ip_addr(domid), &ip);
    mw_info!("heartbeat up, ip {}", ip);

    let mut counter: u64 = 0;
    let mut last_params = String::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        counter += 1;
        let _ = store.write(&keys::heartbeat(domid), &counter.to_string());
        let _ = store.write(&keys::network_stats(domid), &shared.network_stats_string());
        let _ = store.write(&keys::listeners(domid), &shared.listeners_string());

        if let Some(params) = store.read(&keys::socket_params(domid)) {
            if params != last_params {
                apply_params(&shared, &params);
                last_params = params;
            }
        }

        sleep_checked(&shared, interval);
    }
    mw_debug!("heartbeat down after {} beats", counter);
}

/// Sleep in short ticks so shutdown is noticed promptly.
fn sleep_checked(shared: &InsShared, total: Duration) {
    let tick = Duration::from_millis(50);
    let mut remaining = total;
    while !shared.shutdown.load(Ordering::Acquire) && remaining > Duration::ZERO {
        let step = remaining.min(tick);
        std::thread::sleep(step);
        remaining -= step;
    }
}

/// Apply `name:value` tokens from the socket_params key.
fn apply_params(shared: &InsShared, params: &str) {
    for token in params.split_whitespace() {
        if let Some((name, value)) = token.split_once(':') {
            if let Ok(value) = value.parse::<i64>() {
                mw_debug!("socket param {} = {}", name, value);
                shared.apply_sock_param(name, value);
            }
        }
    }
}

/// First non-loopback AF_INET address on the host, if any.
fn discover_ip() -> String {
    if let Ok(addrs) = nix::ifaddrs::getifaddrs() {
        for ifa in addrs {
            if let Some(storage) = ifa.address {
                if let Some(sin) = storage.as_sockaddr_in() {
                    let ip = sin.ip();
                    if !ip.is_loopback() {
                        return ip.to_string();
                    }
                }
            }
        }
    }
    "0.0.0.0".to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_ip_parses() {
        // Whatever the host has, the result must be a valid IPv4 literal.
        let ip = discover_ip();
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok(), "got {}", ip);
    }
}
