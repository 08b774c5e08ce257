//! Multicast heartbeat engine.
//!
//! Every eligible interface carries a small link-local multicast datagram
//! whose payload is this node's 16-byte UUID. Receiving one interns the
//! sender into the identity store and into the receiving interface's
//! neighbor table, which is how cluster members find each other without any
//! configuration.

use std::io;
use std::net::Ipv6Addr;
use std::time::Duration;

use log::debug;

use netmgr_common::uuid::Uuid;

use crate::sock::SocketFd;

/// Link-local multicast group the heartbeat travels on.
pub const HEARTBEAT_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x4d47);

/// Heartbeat port.
pub const HEARTBEAT_PORT: u16 = 3309;

/// Heartbeat payload length: the raw UUID bytes.
pub const HEARTBEAT_PAYLOAD_LEN: usize = 16;

const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// A heartbeat datagram socket.
pub struct HeartbeatSocket {
    fd: SocketFd,
    scope: u32,
}

impl HeartbeatSocket {
    /// Receiving socket for one interface: bound to the group and port with
    /// the interface's scope, joined to the group on that interface,
    /// multicast loop off, close-on-exec, 60 second receive timeout.
    pub fn inbound(index: u32) -> io::Result<HeartbeatSocket> {
        let fd = SocketFd::open(libc::SOCK_DGRAM, 0)?;
        fd.bind6(HEARTBEAT_GROUP, HEARTBEAT_PORT, index)?;
        fd.join_multicast_group(HEARTBEAT_GROUP, index)?;
        fd.set_multicast_loop(false)?;
        fd.set_cloexec()?;
        fd.set_recv_timeout(RECV_TIMEOUT)?;
        debug!("inbound heartbeat socket ({}) created", fd.as_raw_fd());
        Ok(HeartbeatSocket { fd, scope: index })
    }

    /// Sending socket for one interface: multicast interface pinned, loop
    /// off, close-on-exec.
    pub fn outbound(index: u32) -> io::Result<HeartbeatSocket> {
        let fd = SocketFd::open(libc::SOCK_DGRAM, 0)?;
        fd.set_multicast_interface(index)?;
        fd.set_multicast_loop(false)?;
        fd.set_cloexec()?;
        debug!("outbound heartbeat socket ({}) created", fd.as_raw_fd());
        Ok(HeartbeatSocket { fd, scope: index })
    }

    /// Send one heartbeat carrying `uuid`.
    pub fn send(&self, uuid: &Uuid) -> io::Result<()> {
        self.fd
            .send_to6(uuid.as_bytes(), HEARTBEAT_GROUP, HEARTBEAT_PORT, self.scope)?;
        Ok(())
    }

    /// Block for one datagram. Returns the sender's link-local address and
    /// the decoded UUID, or `None` for runt payloads.
    pub fn receive(&self) -> io::Result<Option<(Ipv6Addr, Uuid)>> {
        let mut buffer = [0u8; 64];
        let (size, sender) = self.fd.recv_from6(&mut buffer)?;
        if size < HEARTBEAT_PAYLOAD_LEN {
            debug!("runt heartbeat ({size} bytes) from {sender}");
            return Ok(None);
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&buffer[..HEARTBEAT_PAYLOAD_LEN]);
        Ok(Some((sender, Uuid::from_bytes(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_is_link_local_multicast() {
        assert!(HEARTBEAT_GROUP.is_multicast());
        assert_eq!(HEARTBEAT_GROUP.segments()[0], 0xff02);
    }

    #[test]
    fn test_payload_is_raw_uuid() {
        let uuid = Uuid::parse("99999999-2222-3333-4444-555555555555").unwrap();
        assert_eq!(uuid.as_bytes().len(), HEARTBEAT_PAYLOAD_LEN);
    }
}
