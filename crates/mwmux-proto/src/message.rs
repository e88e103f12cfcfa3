//! Message header and framing.
//!
//! Every request and response starts with the same 24-byte packed
//! little-endian header:
//!
//! ```text
//! off  field   type
//!  0   sig     u16   0xff11 request, 0xff33 response
//!  2   type    u16   opcode; responses have RESPONSE_MASK set
//!  4   size    u16   total bytes including this header
//!  6   id      u64   assigned by the PVM; 0 reserved
//! 14   sockfd  u32   mwsocket handle, or INVALID
//! 18   flags   u16
//! 20   status  i32   responses only; requests carry 0
//! ```
//!
//! Requests and responses are matched by `id`, never by ring position.
//! The response type for opcode `x` is `x | RESPONSE_MASK` so a dequeued
//! message can be classified from its type alone.

use crate::config::{MAX_PAYLOAD, SLOT_SIZE};
use crate::handle;

/// Fixed signature identifying direction.
pub const MSG_SIG_REQUEST: u16 = 0xff11;
pub const MSG_SIG_RESPONSE: u16 = 0xff33;

/// Set on the `type` field of every response.
pub const RESPONSE_MASK: u16 = 0x7000;

pub const HEADER_LEN: usize = 24;

/// Request id 0 is reserved (never assigned).
pub const UNASSIGNED_ID: u64 = 0;

/// Message flags.
pub mod flags {
    /// Request: the originator will not read the response; the PVM drops
    /// it after post-processing.
    pub const FIRE_AND_FORGET: u16 = 1 << 0;
    /// Response: the INS observed the remote peer close this socket.
    pub const REMOTE_CLOSED: u16 = 1 << 1;
    /// Request: the caller is blocking on this operation. Scheduling hint
    /// for the INS; carries no semantics.
    pub const CALLER_BLOCKING: u16 = 1 << 2;
}

/// Reserved high-bit band marking critical statuses. A critical status is
/// treated by the PVM as equivalent to a remote close.
pub const CRITICAL_MASK: u32 = 0xc000_0000;

pub const fn critical(code: u32) -> i32 {
    (CRITICAL_MASK | code) as i32
}

/// Worker-pool exhaustion or unrecoverable engine failure.
pub const STATUS_INTERNAL_ERROR: i32 = critical(1);

pub fn is_critical_status(status: i32) -> bool {
    status < 0 && (status as u32 & CRITICAL_MASK) == CRITICAL_MASK
}

/// Operation codes. Request and response values run in parallel.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Invalid = 0,
    Create = 1,
    Shutdown = 2,
    Close = 3,
    Connect = 4,
    Bind = 5,
    Listen = 6,
    Accept = 7,
    Send = 8,
    Recv = 9,
    RecvFrom = 10,
    GetSockName = 11,
    GetPeerName = 12,
    Attrib = 13,
    PollsetQuery = 14,
}

impl Opcode {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw & !RESPONSE_MASK {
            0 => Opcode::Invalid,
            1 => Opcode::Create,
            2 => Opcode::Shutdown,
            3 => Opcode::Close,
            4 => Opcode::Connect,
            5 => Opcode::Bind,
            6 => Opcode::Listen,
            7 => Opcode::Accept,
            8 => Opcode::Send,
            9 => Opcode::Recv,
            10 => Opcode::RecvFrom,
            11 => Opcode::GetSockName,
            12 => Opcode::GetPeerName,
            13 => Opcode::Attrib,
            14 => Opcode::PollsetQuery,
            _ => return None,
        })
    }

    pub fn request_type(self) -> u16 {
        self as u16
    }

    pub fn response_type(self) -> u16 {
        self as u16 | RESPONSE_MASK
    }

    /// Does the INS dispatcher run this opcode inline rather than handing
    /// it to a worker? Inline opcodes do not block meaningfully.
    pub fn runs_inline(self) -> bool {
        matches!(
            self,
            Opcode::Create
                | Opcode::PollsetQuery
                | Opcode::Shutdown
                | Opcode::Close
                | Opcode::Bind
                | Opcode::Listen
                | Opcode::Attrib
        )
    }

    /// Opcodes serialized by the per-socket oplock, so a Close cannot race
    /// an in-flight Send on the same remote handle.
    pub fn needs_oplock(self) -> bool {
        matches!(self, Opcode::Send | Opcode::Shutdown | Opcode::Close)
    }

    /// Opcodes that do not resolve to a worker slot via the sockfd.
    pub fn is_socketless(self) -> bool {
        matches!(self, Opcode::Create | Opcode::PollsetQuery)
    }
}

/// Decoded message header. See the module doc for the byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub sig: u16,
    pub mtype: u16,
    pub size: u16,
    pub id: u64,
    pub sockfd: u32,
    pub flags: u16,
    pub status: i32,
}

/// Errors raised while framing or validating messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgError {
    /// Buffer shorter than the fixed header.
    Truncated,
    /// Signature does not match the expected direction.
    BadSignature(u16),
    /// `size` field disagrees with the actual byte count or slot bound.
    BadSize(u16),
    /// Unknown opcode.
    BadOpcode(u16),
    /// Payload exceeds the slot capacity.
    PayloadTooLarge(usize),
}

impl std::fmt::Display for MsgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgError::Truncated => write!(f, "message truncated"),
            MsgError::BadSignature(s) => write!(f, "bad signature {:#06x}", s),
            MsgError::BadSize(s) => write!(f, "bad size field {}", s),
            MsgError::BadOpcode(t) => write!(f, "unknown opcode {:#06x}", t),
            MsgError::PayloadTooLarge(n) => write!(f, "payload of {} bytes exceeds slot", n),
        }
    }
}

impl std::error::Error for MsgError {}

impl MsgHeader {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.sig.to_le_bytes());
        buf[2..4].copy_from_slice(&self.mtype.to_le_bytes());
        buf[4..6].copy_from_slice(&self.size.to_le_bytes());
        buf[6..14].copy_from_slice(&self.id.to_le_bytes());
        buf[14..18].copy_from_slice(&self.sockfd.to_le_bytes());
        buf[18..20].copy_from_slice(&self.flags.to_le_bytes());
        buf[20..24].copy_from_slice(&self.status.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < HEADER_LEN {
            return Err(MsgError::Truncated);
        }
        Ok(Self {
            sig: u16::from_le_bytes([buf[0], buf[1]]),
            mtype: u16::from_le_bytes([buf[2], buf[3]]),
            size: u16::from_le_bytes([buf[4], buf[5]]),
            id: u64::from_le_bytes(buf[6..14].try_into().unwrap()),
            sockfd: u32::from_le_bytes(buf[14..18].try_into().unwrap()),
            flags: u16::from_le_bytes([buf[18], buf[19]]),
            status: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }

    pub fn is_request(&self) -> bool {
        self.sig == MSG_SIG_REQUEST && (self.mtype & RESPONSE_MASK) == 0
    }

    pub fn is_response(&self) -> bool {
        self.sig == MSG_SIG_RESPONSE && (self.mtype & RESPONSE_MASK) == RESPONSE_MASK
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.mtype)
    }
}

/// An owned wire message: header plus payload bytes.
///
/// Payload interpretation is per-opcode; see `sockaddr` and `attrib` for
/// the composite payload forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a request. `id` and `sockfd` are placeholders until the PVM
    /// dispatcher rewrites them at send time.
    pub fn request(op: Opcode, payload: Vec<u8>) -> Result<Self, MsgError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(MsgError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            header: MsgHeader {
                sig: MSG_SIG_REQUEST,
                mtype: op.request_type(),
                size: (HEADER_LEN + payload.len()) as u16,
                id: UNASSIGNED_ID,
                sockfd: handle::INVALID,
                flags: 0,
                status: 0,
            },
            payload,
        })
    }

    /// Build the response to `req`, copying id and sockfd across.
    pub fn response_to(req: &MsgHeader, status: i32, payload: Vec<u8>) -> Result<Self, MsgError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(MsgError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            header: MsgHeader {
                sig: MSG_SIG_RESPONSE,
                mtype: req.mtype | RESPONSE_MASK,
                size: (HEADER_LEN + payload.len()) as u16,
                id: req.id,
                sockfd: req.sockfd,
                flags: 0,
                status,
            },
            payload,
        })
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.header.opcode()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        self.header.encode_into(&mut buf);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let total = HEADER_LEN + self.payload.len();
        self.header.encode_into(buf);
        buf[HEADER_LEN..total].copy_from_slice(&self.payload);
        total
    }

    /// Decode and validate one message from a slot-sized buffer.
    ///
    /// `expect_request` selects which direction the caller will accept;
    /// a mismatch is a protocol violation, fatal for the ring.
    pub fn decode(buf: &[u8], expect_request: bool) -> Result<Self, MsgError> {
        let header = MsgHeader::decode(buf)?;

        let dir_ok = if expect_request {
            header.is_request()
        } else {
            header.is_response()
        };
        if !dir_ok {
            return Err(MsgError::BadSignature(header.sig));
        }

        let size = header.size as usize;
        if size < HEADER_LEN || size > SLOT_SIZE || size > buf.len() {
            return Err(MsgError::BadSize(header.size));
        }
        if header.opcode().is_none() {
            return Err(MsgError::BadOpcode(header.mtype));
        }

        Ok(Self {
            header,
            payload: buf[HEADER_LEN..size].to_vec(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
