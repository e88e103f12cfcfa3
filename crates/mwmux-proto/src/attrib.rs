//! Attribute (socket option / INS sysctl) messages.
//!
//! One opcode covers both per-socket options and INS-global defaults; the
//! name's high byte selects the namespace. The request is
//! `modify u16, name u32, value i64`; the response echoes a single `value`.

pub const ATTRIB_GET: u16 = 0;
pub const ATTRIB_SET: u16 = 1;

pub const ATTRIB_REQUEST_LEN: usize = 16;
pub const ATTRIB_RESPONSE_LEN: usize = 8;

/// Namespace bit: names above this are INS-global sysctls, resolved without
/// a socket.
pub const ATTRIB_GLOBAL_BASE: u32 = 0x100;

/// Attribute names.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttribName {
    /// O_NONBLOCK mirror on the remote socket.
    Nonblock = 1,
    ReuseAddr = 2,
    KeepAlive = 3,
    SndBuf = 4,
    RcvBuf = 5,
    /// Microseconds.
    SndTimeo = 6,
    /// Microseconds.
    RcvTimeo = 7,
    /// Defer-accept mode on a listener.
    DeferAccept = 8,
    /// Pending SO_ERROR on the remote socket.
    Error = 9,

    // INS-global defaults applied to subsequently created sockets.
    GlobalSndBuf = 0x101,
    GlobalRcvBuf = 0x102,
    GlobalSndTimeo = 0x103,
    GlobalRcvTimeo = 0x104,
}

impl AttribName {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => AttribName::Nonblock,
            2 => AttribName::ReuseAddr,
            3 => AttribName::KeepAlive,
            4 => AttribName::SndBuf,
            5 => AttribName::RcvBuf,
            6 => AttribName::SndTimeo,
            7 => AttribName::RcvTimeo,
            8 => AttribName::DeferAccept,
            9 => AttribName::Error,
            0x101 => AttribName::GlobalSndBuf,
            0x102 => AttribName::GlobalRcvBuf,
            0x103 => AttribName::GlobalSndTimeo,
            0x104 => AttribName::GlobalRcvTimeo,
            _ => return None,
        })
    }

    pub fn is_global(self) -> bool {
        self as u32 >= ATTRIB_GLOBAL_BASE
    }

    /// Parse a `name:value` token from the bootstrap `socket_params` key.
    pub fn from_param_token(name: &str) -> Option<Self> {
        Some(match name {
            "sndbuf" => AttribName::GlobalSndBuf,
            "rcvbuf" => AttribName::GlobalRcvBuf,
            "sndtimeo" => AttribName::GlobalSndTimeo,
            "rcvtimeo" => AttribName::GlobalRcvTimeo,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttribRequest {
    pub modify: bool,
    pub name: AttribName,
    pub value: i64,
}

impl AttribRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ATTRIB_REQUEST_LEN];
        let modify = if self.modify { ATTRIB_SET } else { ATTRIB_GET };
        buf[0..2].copy_from_slice(&modify.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.name as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ATTRIB_REQUEST_LEN {
            return None;
        }
        let modify = u16::from_le_bytes([buf[0], buf[1]]) == ATTRIB_SET;
        let name = AttribName::from_u32(u32::from_le_bytes(buf[4..8].try_into().unwrap()))?;
        let value = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        Some(Self {
            modify,
            name,
            value,
        })
    }
}

/// Encode the response payload: the (possibly unchanged) attribute value.
pub fn encode_value(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_value(buf: &[u8]) -> Option<i64> {
    if buf.len() < ATTRIB_RESPONSE_LEN {
        return None;
    }
    Some(i64::from_le_bytes(buf[..8].try_into().unwrap()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = AttribRequest {
            modify: true,
            name: AttribName::SndBuf,
            value: 65536,
        };
        let buf = req.encode();
        assert_eq!(AttribRequest::decode(&buf), Some(req));
    }

    #[test]
    fn test_get_round_trip() {
        let req = AttribRequest {
            modify: false,
            name: AttribName::Error,
            value: 0,
        };
        assert_eq!(AttribRequest::decode(&req.encode()), Some(req));
    }

    #[test]
    fn test_unknown_name_rejected() {
        let mut buf = AttribRequest {
            modify: false,
            name: AttribName::Nonblock,
            value: 0,
        }
        .encode();
        buf[4..8].copy_from_slice(&0xdeadu32.to_le_bytes());
        assert_eq!(AttribRequest::decode(&buf), None);
    }

    #[test]
    fn test_global_namespace() {
        assert!(AttribName::GlobalSndBuf.is_global());
        assert!(!AttribName::SndBuf.is_global());
    }

    #[test]
    fn test_param_tokens() {
        assert_eq!(
            AttribName::from_param_token("sndbuf"),
            Some(AttribName::GlobalSndBuf)
        );
        assert_eq!(AttribName::from_param_token("bogus"), None);
    }

    #[test]
    fn test_value_round_trip() {
        assert_eq!(decode_value(&encode_value(-5)), Some(-5));
    }
}
