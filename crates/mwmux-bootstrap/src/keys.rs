//! Key paths used during bootstrap and status publication.
//!
//! All values are ASCII strings. Per-INS keys live under `ROOT/<insid>/` so
//! teardown can clear one INS without touching another.

use crate::grant::DomId;

pub const ROOT: &str = "/mwmux";

pub fn server_id() -> String {
    format!("{}/server_id", ROOT)
}

pub fn ins_dir(insid: DomId) -> String {
    format!("{}/{}", ROOT, insid)
}

pub fn client_id(insid: DomId) -> String {
    format!("{}/{}/client_id", ROOT, insid)
}

pub fn gnt_ref(insid: DomId) -> String {
    format!("{}/{}/gnt_ref", ROOT, insid)
}

pub fn vm_evt_chn_port(insid: DomId) -> String {
    format!("{}/{}/vm_evt_chn_port", ROOT, insid)
}

pub fn vm_evt_chn_bound(insid: DomId) -> String {
    format!("{}/{}/vm_evt_chn_bound", ROOT, insid)
}

pub fn heartbeat(insid: DomId) -> String {
    format!("{}/{}/heartbeat", ROOT, insid)
}

pub fn network_stats(insid: DomId) -> String {
    format!("{}/{}/network_stats", ROOT, insid)
}

pub fn listeners(insid: DomId) -> String {
    format!("{}/{}/listeners", ROOT, insid)
}

pub fn ip_addr(insid: DomId) -> String {
    format!("{}/{}/ip_addr", ROOT, insid)
}

pub fn socket_params(insid: DomId) -> String {
    format!("{}/{}/socket_params", ROOT, insid)
}

pub fn netflow_port() -> String {
    format!("{}/pvm/netflow_port", ROOT)
}

/// Does this path name a client_id key, and for which INS?
pub fn parse_client_id_path(path: &str) -> Option<DomId> {
    let rest = path.strip_prefix(ROOT)?.strip_prefix('/')?;
    let (insid, leaf) = rest.split_once('/')?;
    if leaf != "client_id" {
        return None;
    }
    insid.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(server_id(), "/mwmux/server_id");
        assert_eq!(gnt_ref(7), "/mwmux/7/gnt_ref");
        assert_eq!(netflow_port(), "/mwmux/pvm/netflow_port");
    }

    #[test]
    fn test_parse_client_id_path() {
        assert_eq!(parse_client_id_path("/mwmux/12/client_id"), Some(12));
        assert_eq!(parse_client_id_path("/mwmux/12/gnt_ref"), None);
        assert_eq!(parse_client_id_path("/mwmux/server_id"), None);
        assert_eq!(parse_client_id_path("/other/12/client_id"), None);
    }
}
