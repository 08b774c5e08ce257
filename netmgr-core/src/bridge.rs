//! Layer-2 bridge capability.
//!
//! Bridges are created and populated through the classic bridge ioctls on a
//! throwaway AF_INET socket. The engine treats a bridge as an opaque named
//! capability: create it, clone a MAC onto it, capture ports, and ask
//! whether a tunnel pseudo-interface is among them.

use std::ffi::CString;
use std::io;

use libc::SIOCSIFHWADDR;
use log::{info, warn};

use netmgr_common::types::MacAddr;

use crate::platform::Platform;

// bridge ioctls, from linux/sockios.h
const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const SIOCBRDELIF: libc::c_ulong = 0x89a3;

const ARPHRD_ETHER: libc::c_ushort = 1;

/// A named bridge.
#[derive(Debug, Clone)]
pub struct Bridge {
    name: String,
}

struct ControlSocket(libc::c_int);

impl ControlSocket {
    fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ControlSocket(fd))
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn ifreq_with_name(name: &str) -> libc::ifreq {
    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in request.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    request
}

impl Bridge {
    pub fn new(name: impl Into<String>) -> Self {
        Bridge { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the bridge device. Succeeds if it already exists.
    pub fn create(&self) -> io::Result<()> {
        info!("create new bridge '{}'", self.name);
        let sock = ControlSocket::open()?;
        let name = CString::new(self.name.as_str())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let result = unsafe { libc::ioctl(sock.0, SIOCBRADDBR, name.as_ptr()) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete the bridge device.
    pub fn destroy(&self) -> io::Result<()> {
        let sock = ControlSocket::open()?;
        let name = CString::new(self.name.as_str())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let result = unsafe { libc::ioctl(sock.0, SIOCBRDELBR, name.as_ptr()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Capture an interface as a port of this bridge.
    pub fn add(&self, index: u32, port_name: &str) -> io::Result<()> {
        info!("capturing interface '{port_name}' in bridge '{}'", self.name);
        let sock = ControlSocket::open()?;
        let mut request = ifreq_with_name(&self.name);
        unsafe {
            request.ifr_ifru.ifru_ifindex = index as libc::c_int;
        }
        let result = unsafe { libc::ioctl(sock.0, SIOCBRADDIF, &request) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Release a captured port.
    pub fn remove(&self, index: u32, port_name: &str) -> io::Result<()> {
        info!("removing interface '{port_name}' from bridge '{}'", self.name);
        let sock = ControlSocket::open()?;
        let mut request = ifreq_with_name(&self.name);
        unsafe {
            request.ifr_ifru.ifru_ifindex = index as libc::c_int;
        }
        let result = unsafe { libc::ioctl(sock.0, SIOCBRDELIF, &request) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Clone a hardware address onto the bridge. The bridge address lock is
    /// released around the change so the kernel accepts it.
    pub fn set_mac_address(&self, platform: &Platform, mac: MacAddr) -> io::Result<()> {
        info!("set MAC address of bridge '{}' to {mac}", self.name);

        self.write_bridge_attr(platform, "address_locked", "0");

        let sock = ControlSocket::open()?;
        let mut request = ifreq_with_name(&self.name);
        unsafe {
            request.ifr_ifru.ifru_hwaddr.sa_family = ARPHRD_ETHER;
            for (dst, src) in request.ifr_ifru.ifru_hwaddr.sa_data[..6]
                .iter_mut()
                .zip(mac.octets())
            {
                *dst = src as libc::c_char;
            }
        }
        let result = unsafe { libc::ioctl(sock.0, SIOCSIFHWADDR, &request) };
        let err = io::Error::last_os_error();

        self.write_bridge_attr(platform, "address_locked", "1");

        if result < 0 {
            warn!("failed to set MAC address for bridge '{}': {err}", self.name);
            return Err(err);
        }
        Ok(())
    }

    /// Pin the bridge's address so port changes do not rewrite it.
    pub fn lock_address(&self, platform: &Platform) {
        info!("locking {} address", self.name);
        self.write_bridge_attr(platform, "address_locked", "1");
    }

    pub fn unlock_address(&self, platform: &Platform) {
        info!("unlocking {} address", self.name);
        self.write_bridge_attr(platform, "address_locked", "0");
    }

    /// The bridge forward delay, in seconds.
    pub fn forward_delay(&self, platform: &Platform) -> Option<u64> {
        let raw = self.read_bridge_attr(platform, "forward_delay")?;
        raw.trim().parse::<u64>().ok().map(|hz| hz / 100)
    }

    /// Set the bridge forward delay, in seconds.
    pub fn set_forward_delay(&self, platform: &Platform, seconds: u64) {
        self.write_bridge_attr(platform, "forward_delay", &format!("{}", seconds * 100));
    }

    /// True if a tunnel pseudo-interface is captured by this bridge.
    pub fn is_tunnelled(&self, platform: &Platform) -> bool {
        platform.is_tunnelled(&self.name)
    }

    fn bridge_attr_path(&self, platform: &Platform, attr: &str) -> std::path::PathBuf {
        platform_sysfs(platform).join(&self.name).join("bridge").join(attr)
    }

    fn read_bridge_attr(&self, platform: &Platform, attr: &str) -> Option<String> {
        std::fs::read_to_string(self.bridge_attr_path(platform, attr)).ok()
    }

    fn write_bridge_attr(&self, platform: &Platform, attr: &str, value: &str) {
        let path = self.bridge_attr_path(platform, attr);
        if let Err(err) = std::fs::write(&path, format!("{value}\n")) {
            warn!("could not write {}: {}", path.display(), err);
        }
    }
}

fn platform_sysfs(platform: &Platform) -> std::path::PathBuf {
    platform.sysfs_net_root().to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetmgrConfig;

    #[test]
    fn test_forward_delay_units() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetmgrConfig {
            sysfs_net: dir.path().to_path_buf(),
            ..Default::default()
        };
        let platform = Platform::from_config(&config);
        std::fs::create_dir_all(dir.path().join("biz0").join("bridge")).unwrap();

        let bridge = Bridge::new("biz0");
        bridge.set_forward_delay(&platform, 2);
        assert_eq!(bridge.forward_delay(&platform), Some(2));

        let raw = std::fs::read_to_string(dir.path().join("biz0/bridge/forward_delay")).unwrap();
        assert_eq!(raw.trim(), "200");
    }

    #[test]
    fn test_address_lock_toggles_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetmgrConfig {
            sysfs_net: dir.path().to_path_buf(),
            ..Default::default()
        };
        let platform = Platform::from_config(&config);
        std::fs::create_dir_all(dir.path().join("biz0").join("bridge")).unwrap();

        let bridge = Bridge::new("biz0");
        bridge.lock_address(&platform);
        let raw = std::fs::read_to_string(dir.path().join("biz0/bridge/address_locked")).unwrap();
        assert_eq!(raw.trim(), "1");

        bridge.unlock_address(&platform);
        let raw = std::fs::read_to_string(dir.path().join("biz0/bridge/address_locked")).unwrap();
        assert_eq!(raw.trim(), "0");
    }
}
