//! Netflow backchannel.
//!
//! A plain TCP listener on the PVM. Connected consumers receive
//! length-prefixed stats records; each consumer may send feature requests
//! which are translated into synthetic Attrib requests against a specific
//! mwsocket (by remote handle) or the INS globals, and answered with
//! feature responses. Everything on this channel is big-endian.
//!
//! Frames:
//!
//! ```text
//! mw_feature_request  (22 bytes): sig u16 | id u32 | flags u16 (bit0 =
//!                     modify) | name u16 | sockfd u32 | value i64
//! mw_feature_response (18 bytes): sig u16 | id u32 | status i32 | value i64
//! stats record:       len u16 | ASCII bytes
//! ```

use mwmux_bootstrap::{keys, KeyStore};
use mwmux_core::{mw_debug, mw_info, mw_warn};
use mwmux_proto::attrib::{self, AttribName, AttribRequest};
use mwmux_proto::errno;
use mwmux_proto::message::{Message, Opcode};

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::state::PvmState;

pub const FEATURE_REQUEST_SIG: u16 = 0x4d46; // "MF"
pub const FEATURE_RESPONSE_SIG: u16 = 0x4d52; // "MR"
pub const FEATURE_REQUEST_LEN: usize = 22;
pub const FEATURE_RESPONSE_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRequest {
    pub id: u32,
    pub modify: bool,
    pub name: u16,
    pub sockfd: u32,
    pub value: i64,
}

impl FeatureRequest {
    pub fn encode(&self) -> [u8; FEATURE_REQUEST_LEN] {
        let mut buf = [0u8; FEATURE_REQUEST_LEN];
        buf[0..2].copy_from_slice(&FEATURE_REQUEST_SIG.to_be_bytes());
        buf[2..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..8].copy_from_slice(&(self.modify as u16).to_be_bytes());
        buf[8..10].copy_from_slice(&self.name.to_be_bytes());
        buf[10..14].copy_from_slice(&self.sockfd.to_be_bytes());
        buf[14..22].copy_from_slice(&self.value.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FEATURE_REQUEST_LEN {
            return None;
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != FEATURE_REQUEST_SIG {
            return None;
        }
        Some(Self {
            id: u32::from_be_bytes(buf[2..6].try_into().unwrap()),
            modify: u16::from_be_bytes([buf[6], buf[7]]) & 1 != 0,
            name: u16::from_be_bytes([buf[8], buf[9]]),
            sockfd: u32::from_be_bytes(buf[10..14].try_into().unwrap()),
            value: i64::from_be_bytes(buf[14..22].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureResponse {
    pub id: u32,
    pub status: i32,
    pub value: i64,
}

impl FeatureResponse {
    pub fn encode(&self) -> [u8; FEATURE_RESPONSE_LEN] {
        let mut buf = [0u8; FEATURE_RESPONSE_LEN];
        buf[0..2].copy_from_slice(&FEATURE_RESPONSE_SIG.to_be_bytes());
        buf[2..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.status.to_be_bytes());
        buf[10..18].copy_from_slice(&self.value.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FEATURE_RESPONSE_LEN {
            return None;
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != FEATURE_RESPONSE_SIG {
            return None;
        }
        Some(Self {
            id: u32::from_be_bytes(buf[2..6].try_into().unwrap()),
            status: i32::from_be_bytes(buf[6..10].try_into().unwrap()),
            value: i64::from_be_bytes(buf[10..18].try_into().unwrap()),
        })
    }
}

pub struct Backchannel {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    port: u16,
}

impl Backchannel {
    /// Bind the listener, publish `ip:port` at the netflow key, and start
    /// serving consumers.
    pub fn start(
        state: Arc<PvmState>,
        store: Arc<dyn KeyStore>,
        bind_addr: &str,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let _ = store.write(
            &keys::netflow_port(),
            &format!("{}:{}", local.ip(), local.port()),
        );
        mw_info!("netflow backchannel on {}", local);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("mw-pvm-netflow".to_string())
            .spawn(move || serve(state, listener, flag))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            port: local.port(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Backchannel {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Consumer {
    stream: TcpStream,
    inbuf: Vec<u8>,
}

fn serve(state: Arc<PvmState>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    mwmux_core::log::set_thread_tag("pvm:nf");
    let mut consumers: Vec<Consumer> = Vec::new();
    let mut last_stats = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                mw_debug!("netflow consumer {}", peer);
                let _ = stream.set_nonblocking(true);
                consumers.push(Consumer {
                    stream,
                    inbuf: Vec::new(),
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                mw_warn!("netflow accept: {}", e);
            }
        }

        // Drain feature requests from every consumer.
        let mut i = 0;
        while i < consumers.len() {
            match pump_consumer(&state, &mut consumers[i]) {
                Ok(()) => i += 1,
                Err(_) => {
                    consumers.swap_remove(i);
                }
            }
        }

        // Periodic stats record to every consumer.
        if last_stats.elapsed() >= Duration::from_secs(1) {
            last_stats = Instant::now();
            let line = format!(
                "mwsockets:{} inflight:{}",
                state.instance_count(),
                state.actives.len()
            );
            let mut frame = Vec::with_capacity(2 + line.len());
            frame.extend_from_slice(&(line.len() as u16).to_be_bytes());
            frame.extend_from_slice(line.as_bytes());
            consumers.retain_mut(|c| c.stream.write_all(&frame).is_ok());
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Read whatever is available and answer every complete frame.
fn pump_consumer(state: &Arc<PvmState>, consumer: &mut Consumer) -> std::io::Result<()> {
    let mut chunk = [0u8; 256];
    loop {
        match consumer.stream.read(&mut chunk) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => consumer.inbuf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    while consumer.inbuf.len() >= FEATURE_REQUEST_LEN {
        let frame: Vec<u8> = consumer.inbuf.drain(..FEATURE_REQUEST_LEN).collect();
        let Some(req) = FeatureRequest::decode(&frame) else {
            // Garbage on the channel; drop the consumer.
            return Err(std::io::Error::from(ErrorKind::InvalidData));
        };
        let resp = handle_feature_request(state, &req);
        consumer.stream.write_all(&resp.encode())?;
    }
    Ok(())
}

/// Translate one feature request into a synthetic Attrib round trip.
fn handle_feature_request(state: &Arc<PvmState>, req: &FeatureRequest) -> FeatureResponse {
    let fail = |status: i32| FeatureResponse {
        id: req.id,
        status,
        value: 0,
    };

    let Some(name) = AttribName::from_u32(req.name as u32) else {
        return fail(-errno::MW_ENOPROTOOPT);
    };

    let inst = if name.is_global() {
        None
    } else {
        match state.find_by_remote(req.sockfd) {
            Some(inst) => Some(inst),
            None => return fail(-errno::MW_EBADF),
        }
    };

    let payload = AttribRequest {
        modify: req.modify,
        name,
        value: req.value,
    }
    .encode();
    let Ok(msg) = Message::request(Opcode::Attrib, payload) else {
        return fail(-errno::MW_EINVAL);
    };

    // Synthetic request: correlated like any other, but never visible to
    // the handle's read discipline.
    let actreq = match state.submit(inst.as_ref(), msg, true) {
        Ok(actreq) => actreq,
        Err(_) => return fail(-errno::MW_EAGAIN),
    };
    match actreq.wait(Some(mwmux_proto::config::GENERAL_RESPONSE_TIMEOUT)) {
        Ok(resp) => FeatureResponse {
            id: req.id,
            status: resp.header.status,
            value: attrib::decode_value(&resp.payload).unwrap_or(0),
        },
        Err(_) => {
            actreq.interrupt();
            fail(-errno::MW_ETIMEDOUT)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_request_round_trip() {
        let req = FeatureRequest {
            id: 7,
            modify: true,
            name: 4,
            sockfd: 0x4d00_0001,
            value: 65536,
        };
        let buf = req.encode();
        assert_eq!(FeatureRequest::decode(&buf), Some(req));
    }

    #[test]
    fn test_feature_frames_are_big_endian() {
        let req = FeatureRequest {
            id: 0x0102_0304,
            modify: false,
            name: 0,
            sockfd: 0,
            value: 0,
        };
        let buf = req.encode();
        assert_eq!(buf[2], 0x01);
        assert_eq!(buf[5], 0x04);
    }

    #[test]
    fn test_feature_response_round_trip() {
        let resp = FeatureResponse {
            id: 9,
            status: -11,
            value: 42,
        };
        assert_eq!(FeatureResponse::decode(&resp.encode()), Some(resp));
    }

    #[test]
    fn test_decode_rejects_bad_sig() {
        let mut buf = FeatureRequest {
            id: 1,
            modify: false,
            name: 1,
            sockfd: 0,
            value: 0,
        }
        .encode();
        buf[0] = 0;
        assert_eq!(FeatureRequest::decode(&buf), None);
    }
}
