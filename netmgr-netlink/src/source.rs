//! Blocking notification socket.
//!
//! One dedicated thread owns a `NETLINK_ROUTE` socket bound to the link and
//! address multicast groups and feeds decoded [`Event`]s into an mpsc
//! channel. The receive loop never terminates on transient errors: `EINTR`
//! is retried, `ENOBUFS` is logged as a bug indicator (it means we are not
//! draining fast enough and may have lost events), and malformed or
//! truncated buffers are logged and discarded.

use std::os::fd::AsRawFd;
use std::thread;

use log::{debug, error, info, warn};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tokio::sync::mpsc;

use crate::events::{self, Event};
use crate::Result;

// rtnetlink multicast groups, from linux/rtnetlink.h. Neighbor and route
// groups are left out: they arrive by the hundreds per second under load and
// overflow the receive buffer, dropping the link events we do need.
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_NOTIFY: u32 = 0x2;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTMGRP_IPV6_IFADDR: u32 = 0x100;
const RTMGRP_IPV6_IFINFO: u32 = 0x800;
const RTMGRP_IPV6_PREFIX: u32 = 0x20000;

const SUBSCRIBED_GROUPS: u32 = RTMGRP_LINK
    | RTMGRP_NOTIFY
    | RTMGRP_IPV4_IFADDR
    | RTMGRP_IPV6_IFADDR
    | RTMGRP_IPV6_IFINFO
    | RTMGRP_IPV6_PREFIX;

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// The kernel notification socket and its read loop.
pub struct EventSource {
    socket: Socket,
}

impl EventSource {
    /// Open the notification socket, subscribe to the link/address groups,
    /// and grow the receive buffer.
    pub fn subscribe() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, SUBSCRIBED_GROUPS))?;
        grow_receive_buffer(socket.as_raw_fd());
        Ok(EventSource { socket })
    }

    /// Spawn the read loop on its own thread. The thread exits when the
    /// receiving side of `tx` is dropped.
    pub fn spawn(self, tx: mpsc::Sender<Event>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("netlink-events".into())
            .spawn(move || self.run(tx))
            .expect("failed to spawn netlink event thread")
    }

    fn run(self, tx: mpsc::Sender<Event>) {
        info!("kernel event source started");
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let size = {
                let mut slice = &mut buffer[..];
                match self.socket.recv(&mut slice, 0) {
                    Ok(size) => size,
                    Err(err) => match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::ENOBUFS) => {
                            error!("%BUG netlink recv returned ENOBUFS, events may be lost");
                            continue;
                        }
                        _ => {
                            error!("netlink recv failed: {err}");
                            continue;
                        }
                    },
                }
            };
            if size == 0 {
                continue;
            }

            let mut offset = 0;
            while offset < size {
                let msg =
                    match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..size])
                    {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!("truncated netlink message, discarding remainder: {err}");
                            break;
                        }
                    };

                let length = msg.header.length as usize;
                if length == 0 {
                    warn!("zero-length netlink message, discarding remainder");
                    break;
                }

                match &msg.payload {
                    NetlinkPayload::InnerMessage(_) => {
                        if let Some(event) = events::decode(&msg) {
                            if tx.blocking_send(event).is_err() {
                                info!("event channel closed, kernel event source exiting");
                                return;
                            }
                        } else {
                            debug!("ignoring netlink message type {}", msg.header.message_type);
                        }
                    }
                    NetlinkPayload::Error(err) => {
                        warn!("netlink error message: {err:?}");
                    }
                    _ => {}
                }

                // messages within one datagram are 4-byte aligned
                offset += (length + 3) & !3;
            }
        }
    }
}

fn grow_receive_buffer(fd: i32) {
    let mut size: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut size as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        warn!(
            "failed to determine the netlink socket rcvbuf size: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    debug!("netlink socket rcvbuf size is {size}");

    size *= 4;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(
            "failed to increase the netlink socket rcvbuf size: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    info!("netlink socket rcvbuf size set to {size}");
}
