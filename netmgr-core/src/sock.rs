//! Thin wrapper over the libc socket calls the engines need.
//!
//! Raw ICMPv6 and multicast UDP sockets are opened and driven through this
//! one place so the unsafe surface stays small. Receive timeouts bound every
//! blocking listener; a socket read that times out reports `WouldBlock`.

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use std::time::Duration;

/// An owned socket file descriptor.
#[derive(Debug)]
pub(crate) struct SocketFd {
    fd: RawFd,
}

pub(crate) fn sockaddr6(addr: Ipv6Addr, port: u16, scope: u32) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = port.to_be();
    sa.sin6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };
    sa.sin6_scope_id = scope;
    sa
}

impl SocketFd {
    pub(crate) fn open(ty: libc::c_int, protocol: libc::c_int) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET6, ty, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SocketFd { fd })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn set_recv_buffer(&self, size: usize) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, &(size as libc::c_int))
    }

    pub(crate) fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
    }

    pub(crate) fn set_multicast_loop(&self, enabled: bool) -> io::Result<()> {
        let flag: libc::c_uint = if enabled { 1 } else { 0 };
        self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, &flag)
    }

    pub(crate) fn set_multicast_interface(&self, index: u32) -> io::Result<()> {
        self.setsockopt(
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_IF,
            &(index as libc::c_int),
        )
    }

    pub(crate) fn join_multicast_group(&self, group: Ipv6Addr, index: u32) -> io::Result<()> {
        let mreq = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: group.octets(),
            },
            ipv6mr_interface: index as libc::c_uint,
        };
        self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq)
    }

    pub(crate) fn set_cloexec(&self) -> io::Result<()> {
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn bind6(&self, addr: Ipv6Addr, port: u16, scope: u32) -> io::Result<()> {
        let sa = sockaddr6(addr, port, scope);
        let rc = unsafe {
            libc::bind(
                self.fd,
                &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn send_to6(
        &self,
        payload: &[u8],
        addr: Ipv6Addr,
        port: u16,
        scope: u32,
    ) -> io::Result<usize> {
        let sa = sockaddr6(addr, port, scope);
        let sent = unsafe {
            libc::sendto(
                self.fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    pub(crate) fn recv_from6(&self, buffer: &mut [u8]) -> io::Result<(usize, Ipv6Addr)> {
        let mut sender: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut sender_len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
                &mut sender as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                &mut sender_len,
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((received as usize, Ipv6Addr::from(sender.sin6_addr.s6_addr)))
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// True for the errno values a receive timeout produces. `SO_RCVTIMEO`
/// surfaces as EAGAIN on Linux.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::ETIMEDOUT)
    )
}

/// True when the call was interrupted and should simply be retried.
pub(crate) fn is_interrupted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}
