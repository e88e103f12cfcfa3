//! Per-opcode payload forms that are not addresses or attributes.
//!
//! Raw data (Send request bytes, Recv response bytes) is carried as-is after
//! the header with its length implied by `header.size`; only the structured
//! payloads are defined here.

/// Canonical socket type values (host kernels disagree on the numbers).
pub const MW_ST_UNSET: u32 = 0;
pub const MW_ST_DGRAM: u32 = 1;
pub const MW_ST_STREAM: u32 = 2;

pub const CREATE_PAYLOAD_LEN: usize = 12;
pub const LISTEN_PAYLOAD_LEN: usize = 4;
pub const RECV_PAYLOAD_LEN: usize = 8;
pub const SHUTDOWN_PAYLOAD_LEN: usize = 4;
pub const POLLSET_ENTRY_LEN: usize = 8;

/// Create: canonical family, canonical type, raw protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatePayload {
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
}

impl CreatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CREATE_PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.family.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sock_type.to_le_bytes());
        buf[8..12].copy_from_slice(&self.protocol.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CREATE_PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            family: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            sock_type: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            protocol: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

pub fn encode_listen(backlog: u32) -> Vec<u8> {
    backlog.to_le_bytes().to_vec()
}

pub fn decode_listen(buf: &[u8]) -> Option<u32> {
    if buf.len() < LISTEN_PAYLOAD_LEN {
        return None;
    }
    Some(u32::from_le_bytes(buf[..4].try_into().unwrap()))
}

/// Shutdown carries the how value (0=RD, 1=WR, 2=RDWR, POSIX numbering).
pub fn encode_shutdown(how: u32) -> Vec<u8> {
    how.to_le_bytes().to_vec()
}

pub fn decode_shutdown(buf: &[u8]) -> Option<u32> {
    if buf.len() < SHUTDOWN_PAYLOAD_LEN {
        return None;
    }
    Some(u32::from_le_bytes(buf[..4].try_into().unwrap()))
}

/// Recv/RecvFrom request: byte count wanted and host recv flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvPayload {
    pub requested: u32,
    pub recv_flags: u32,
}

impl RecvPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECV_PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.requested.to_le_bytes());
        buf[4..8].copy_from_slice(&self.recv_flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECV_PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            requested: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            recv_flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

/// One readiness report in a PollsetQuery response. Event bits are the
/// host's poll bits, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollsetEntry {
    pub sockfd: u32,
    pub events: u16,
}

pub fn encode_pollset(entries: &[PollsetEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * POLLSET_ENTRY_LEN];
    for (i, e) in entries.iter().enumerate() {
        let off = i * POLLSET_ENTRY_LEN;
        buf[off..off + 4].copy_from_slice(&e.sockfd.to_le_bytes());
        buf[off + 4..off + 6].copy_from_slice(&e.events.to_le_bytes());
    }
    buf
}

pub fn decode_pollset(buf: &[u8]) -> Vec<PollsetEntry> {
    buf.chunks_exact(POLLSET_ENTRY_LEN)
        .map(|c| PollsetEntry {
            sockfd: u32::from_le_bytes(c[0..4].try_into().unwrap()),
            events: u16::from_le_bytes([c[4], c[5]]),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_round_trip() {
        let p = CreatePayload {
            family: 1,
            sock_type: MW_ST_STREAM,
            protocol: 0,
        };
        assert_eq!(CreatePayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_listen_round_trip() {
        assert_eq!(decode_listen(&encode_listen(16)), Some(16));
        assert_eq!(decode_listen(&[1, 2]), None);
    }

    #[test]
    fn test_recv_round_trip() {
        let p = RecvPayload {
            requested: 1500,
            recv_flags: 0,
        };
        assert_eq!(RecvPayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_pollset_round_trip() {
        let entries = vec![
            PollsetEntry {
                sockfd: 0x4d00_0001,
                events: 0x0001,
            },
            PollsetEntry {
                sockfd: 0x4d00_0002,
                events: 0x0005,
            },
        ];
        let buf = encode_pollset(&entries);
        assert_eq!(buf.len(), 16);
        assert_eq!(decode_pollset(&buf), entries);
    }

    #[test]
    fn test_pollset_empty() {
        assert!(decode_pollset(&encode_pollset(&[])).is_empty());
    }
}
