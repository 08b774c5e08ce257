//! ICMPv6 neighbor protocol engine.
//!
//! Each interface owns one raw ICMPv6 socket bound to its link-local
//! address. Outbound traffic is the periodic Neighbor Advertisement sent
//! unicast to each known partner peer; inbound traffic is dispatched by
//! ICMPv6 type code to a per-variant callback. The kernel computes the
//! ICMPv6 checksum on raw sockets, so the codec leaves it zero.

use std::io;
use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{debug, error, warn};

use netmgr_common::types::MacAddr;

use crate::sock::{self, SocketFd};

pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;

/// Neighbor Advertisement flag bits, as a host-order u32 of the wire field.
pub const ND_NA_FLAG_ROUTER: u32 = 0x8000_0000;
pub const ND_NA_FLAG_SOLICITED: u32 = 0x4000_0000;
pub const ND_NA_FLAG_OVERRIDE: u32 = 0x2000_0000;

const ND_OPT_TARGET_LINKADDR: u8 = 2;

const ND_TARGET_LEN: usize = 24;

const RECV_BUFFER_SIZE: usize = 2048;
const SOCKET_RECV_BUFFER: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Log only every Nth consecutive bind failure.
const BIND_LOG_INTERVAL: u32 = 30;

/// A decoded ICMPv6 protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    EchoRequest,
    EchoReply,
    NeighborSolicitation {
        target: Ipv6Addr,
    },
    NeighborAdvertisement {
        target: Ipv6Addr,
        flags: u32,
        mac: Option<MacAddr>,
    },
    /// Any type code without a dedicated decoder.
    Other {
        pdu_type: u8,
        code: u8,
    },
}

impl Pdu {
    /// Build the advertisement this node sends for one of its interfaces:
    /// the interface's own link-local as target, its MAC as the
    /// target-link-layer option, and the Override flag set.
    pub fn advertisement(target: Ipv6Addr, mac: MacAddr) -> Pdu {
        Pdu::NeighborAdvertisement {
            target,
            flags: ND_NA_FLAG_OVERRIDE,
            mac: Some(mac),
        }
    }

    /// Decode one PDU. Returns `None` when the buffer is too short to carry
    /// an ICMPv6 header at all.
    pub fn parse(buffer: &[u8]) -> Option<Pdu> {
        if buffer.len() < 4 {
            return None;
        }
        let pdu_type = buffer[0];
        let code = buffer[1];

        match pdu_type {
            ICMP6_ECHO_REQUEST => Some(Pdu::EchoRequest),
            ICMP6_ECHO_REPLY => Some(Pdu::EchoReply),
            ND_NEIGHBOR_SOLICIT => {
                if buffer.len() < ND_TARGET_LEN {
                    return None;
                }
                let mut target = [0u8; 16];
                target.copy_from_slice(&buffer[8..24]);
                Some(Pdu::NeighborSolicitation {
                    target: Ipv6Addr::from(target),
                })
            }
            ND_NEIGHBOR_ADVERT => {
                if buffer.len() < ND_TARGET_LEN {
                    return None;
                }
                let flags = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
                let mut target = [0u8; 16];
                target.copy_from_slice(&buffer[8..24]);
                Some(Pdu::NeighborAdvertisement {
                    target: Ipv6Addr::from(target),
                    flags,
                    mac: parse_target_lladdr(&buffer[ND_TARGET_LEN..]),
                })
            }
            _ => Some(Pdu::Other { pdu_type, code }),
        }
    }

    /// Encode this PDU to its wire form. The checksum field is left zero for
    /// the kernel to fill in.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Pdu::EchoRequest => {
                put_header(&mut buf, ICMP6_ECHO_REQUEST, 0);
                buf.put_u32(0);
            }
            Pdu::EchoReply => {
                put_header(&mut buf, ICMP6_ECHO_REPLY, 0);
                buf.put_u32(0);
            }
            Pdu::NeighborSolicitation { target } => {
                put_header(&mut buf, ND_NEIGHBOR_SOLICIT, 0);
                buf.put_u32(0);
                buf.put_slice(&target.octets());
            }
            Pdu::NeighborAdvertisement { target, flags, mac } => {
                put_header(&mut buf, ND_NEIGHBOR_ADVERT, 0);
                buf.put_u32(*flags);
                buf.put_slice(&target.octets());
                if let Some(mac) = mac {
                    buf.put_u8(ND_OPT_TARGET_LINKADDR);
                    buf.put_u8(1); // length in units of 8 bytes
                    buf.put_slice(&mac.octets());
                }
            }
            Pdu::Other { pdu_type, code } => {
                put_header(&mut buf, *pdu_type, *code);
                buf.put_u32(0);
            }
        }
        buf
    }

    /// Double-dispatch to the per-variant callback.
    pub fn deliver(&self, from: Ipv6Addr, handler: &mut dyn ReceiveHandler) {
        match self {
            Pdu::EchoRequest => handler.echo_request(from),
            Pdu::EchoReply => handler.echo_reply(from),
            Pdu::NeighborSolicitation { target } => handler.neighbor_solicitation(from, *target),
            Pdu::NeighborAdvertisement { target, mac, .. } => {
                handler.neighbor_advertisement(from, *target, *mac)
            }
            Pdu::Other { pdu_type, code } => handler.other(from, *pdu_type, *code),
        }
    }
}

fn put_header(buf: &mut BytesMut, pdu_type: u8, code: u8) {
    buf.put_u8(pdu_type);
    buf.put_u8(code);
    buf.put_u16(0); // checksum, kernel-computed
}

fn parse_target_lladdr(mut options: &[u8]) -> Option<MacAddr> {
    while options.len() >= 2 {
        let opt_type = options[0];
        let opt_len = options[1] as usize * 8;
        if opt_len == 0 || opt_len > options.len() {
            return None;
        }
        if opt_type == ND_OPT_TARGET_LINKADDR && opt_len == 8 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&options[2..8]);
            return Some(MacAddr(mac));
        }
        options = &options[opt_len..];
    }
    None
}

/// Per-variant receive callback. Unhandled variants default to a debug log.
pub trait ReceiveHandler {
    fn echo_request(&mut self, _from: Ipv6Addr) {}
    fn echo_reply(&mut self, _from: Ipv6Addr) {}
    fn neighbor_solicitation(&mut self, _from: Ipv6Addr, _target: Ipv6Addr) {}
    fn neighbor_advertisement(&mut self, _from: Ipv6Addr, _target: Ipv6Addr, _mac: Option<MacAddr>);
    fn other(&mut self, from: Ipv6Addr, pdu_type: u8, code: u8) {
        debug!("ignoring ICMPv6 type {pdu_type} code {code} from {from}");
    }
}

struct BindState {
    completed: bool,
    attempts: u32,
    scope: u32,
}

/// A raw ICMPv6 socket with a single-writer bind latch.
pub struct IcmpSocket {
    fd: SocketFd,
    bind: Mutex<BindState>,
}

impl IcmpSocket {
    /// Open and configure the socket: 64 KiB receive buffer, multicast loop
    /// off, close-on-exec, 60 second receive timeout.
    pub fn open() -> io::Result<IcmpSocket> {
        let fd = SocketFd::open(libc::SOCK_RAW, libc::IPPROTO_ICMPV6)?;
        fd.set_recv_buffer(SOCKET_RECV_BUFFER)?;
        if let Err(err) = fd.set_multicast_loop(false) {
            error!("ICMPv6 socket: failed to turn off loopback: {err}");
        }
        if let Err(err) = fd.set_cloexec() {
            error!("ICMPv6 socket: could not set close on exec: {err}");
        }
        if let Err(err) = fd.set_recv_timeout(RECV_TIMEOUT) {
            error!("ICMPv6 socket: could not set receive timeout: {err}");
        }
        Ok(IcmpSocket {
            fd,
            bind: Mutex::new(BindState {
                completed: false,
                attempts: 0,
                scope: 0,
            }),
        })
    }

    /// Bind to `(address, port 0, scope)`. The first successful bind latches;
    /// later calls are no-ops. Failures are logged once every
    /// [`BIND_LOG_INTERVAL`] attempts.
    pub fn bind(&self, address: Ipv6Addr, scope: u32) -> bool {
        let mut state = self.bind.lock().unwrap();
        if state.completed {
            return true;
        }

        match self.fd.bind6(address, 0, scope) {
            Ok(()) => {
                state.completed = true;
                state.scope = scope;
                state.attempts = 0;
                debug!("ICMPv6 socket bound to {address} (scope {scope})");
                true
            }
            Err(err) => {
                if state.attempts % BIND_LOG_INTERVAL == 0 {
                    error!("ICMPv6 bind(\"{address}\", {scope}): {err}");
                }
                state.attempts += 1;
                false
            }
        }
    }

    /// True once a bind has succeeded.
    pub fn bound(&self) -> bool {
        self.bind.lock().unwrap().completed
    }

    /// Send a PDU unicast to `recipient` on the bound interface.
    pub fn send(&self, recipient: Ipv6Addr, pdu: &Pdu) -> bool {
        let scope = self.bind.lock().unwrap().scope;
        let payload = pdu.encode();
        match self.fd.send_to6(&payload, recipient, 0, scope) {
            Ok(_) => true,
            Err(err) => {
                debug!("ICMPv6 send to {recipient} failed: {err}");
                false
            }
        }
    }

    /// Receive loop. Returns quietly on receive timeout; any other socket
    /// error is logged and also returns, leaving the caller to decide
    /// whether to come back.
    pub fn receive(&self, handler: &mut dyn ReceiveHandler) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (size, from) = match self.fd.recv_from6(&mut buffer) {
                Ok(result) => result,
                Err(err) if sock::is_timeout(&err) => return,
                Err(err) if sock::is_interrupted(&err) => continue,
                Err(err) => {
                    error!("ICMPv6 recvfrom failed: {err}");
                    return;
                }
            };
            if size == 0 {
                continue;
            }

            match Pdu::parse(&buffer[..size]) {
                Some(pdu) => pdu.deliver(from, handler),
                None => warn!("runt ICMPv6 message ({size} bytes) from {from}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_wire_format() {
        let target: Ipv6Addr = "fe80::ff:fe00:aa".parse().unwrap();
        let mac = MacAddr([0x02, 0, 0, 0, 0, 0xaa]);
        let wire = Pdu::advertisement(target, mac).encode();

        assert_eq!(wire.len(), 32);
        assert_eq!(wire[0], ND_NEIGHBOR_ADVERT);
        assert_eq!(wire[1], 0);
        // override flag is the third bit of the flags byte
        assert_eq!(wire[4], 0x20);
        assert_eq!(&wire[8..24], &target.octets());
        assert_eq!(wire[24], ND_OPT_TARGET_LINKADDR);
        assert_eq!(wire[25], 1);
        assert_eq!(&wire[26..32], &mac.octets());
    }

    #[test]
    fn test_advertisement_round_trip() {
        let target: Ipv6Addr = "fe80::213:72ff:fe4b:541".parse().unwrap();
        let mac = MacAddr([0x00, 0x13, 0x72, 0x4b, 0x05, 0x41]);
        let pdu = Pdu::advertisement(target, mac);
        let parsed = Pdu::parse(&pdu.encode()).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_solicitation_round_trip() {
        let target: Ipv6Addr = "fe80::1".parse().unwrap();
        let pdu = Pdu::NeighborSolicitation { target };
        assert_eq!(Pdu::parse(&pdu.encode()).unwrap(), pdu);
    }

    #[test]
    fn test_echo_and_unknown_types() {
        assert_eq!(
            Pdu::parse(&Pdu::EchoRequest.encode()).unwrap(),
            Pdu::EchoRequest
        );
        assert_eq!(Pdu::parse(&Pdu::EchoReply.encode()).unwrap(), Pdu::EchoReply);

        let unknown = [200u8, 3, 0, 0];
        assert_eq!(
            Pdu::parse(&unknown).unwrap(),
            Pdu::Other {
                pdu_type: 200,
                code: 3
            }
        );
        assert_eq!(Pdu::parse(&[1, 2]), None);
    }

    #[test]
    fn test_advertisement_without_lladdr_option() {
        let target: Ipv6Addr = "fe80::1".parse().unwrap();
        let pdu = Pdu::NeighborAdvertisement {
            target,
            flags: ND_NA_FLAG_OVERRIDE | ND_NA_FLAG_SOLICITED,
            mac: None,
        };
        let wire = pdu.encode();
        assert_eq!(wire.len(), 24);
        assert_eq!(Pdu::parse(&wire).unwrap(), pdu);
    }

    #[test]
    fn test_malformed_option_is_ignored() {
        let target: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut wire = Pdu::NeighborAdvertisement {
            target,
            flags: 0,
            mac: None,
        }
        .encode()
        .to_vec();
        // zero-length option must not loop forever or be taken as a MAC
        wire.extend_from_slice(&[ND_OPT_TARGET_LINKADDR, 0, 1, 2, 3, 4, 5, 6]);
        match Pdu::parse(&wire).unwrap() {
            Pdu::NeighborAdvertisement { mac, .. } => assert_eq!(mac, None),
            other => panic!("unexpected PDU: {other:?}"),
        }
    }

    struct Recorder {
        events: Vec<String>,
    }

    impl ReceiveHandler for Recorder {
        fn neighbor_advertisement(
            &mut self,
            from: Ipv6Addr,
            target: Ipv6Addr,
            _mac: Option<MacAddr>,
        ) {
            self.events.push(format!("na {from} {target}"));
        }

        fn neighbor_solicitation(&mut self, from: Ipv6Addr, target: Ipv6Addr) {
            self.events.push(format!("ns {from} {target}"));
        }
    }

    #[test]
    fn test_dispatch() {
        let from: Ipv6Addr = "fe80::2".parse().unwrap();
        let target: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut recorder = Recorder { events: Vec::new() };

        Pdu::NeighborSolicitation { target }.deliver(from, &mut recorder);
        Pdu::advertisement(target, MacAddr::default()).deliver(from, &mut recorder);
        // default impls swallow the rest
        Pdu::EchoRequest.deliver(from, &mut recorder);
        Pdu::Other {
            pdu_type: 4,
            code: 0,
        }
        .deliver(from, &mut recorder);

        assert_eq!(
            recorder.events,
            vec![format!("ns {from} {target}"), format!("na {from} {target}")]
        );
    }
}
