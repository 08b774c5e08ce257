//! Point-to-point tunnel maintenance.
//!
//! A tunnel splices a remote business interface into a local bridge through
//! a `tun` pseudo-interface managed by an external tunnel daemon. The
//! daemon's process lifecycle is not handled here; the engine only decides
//! what should happen next (start a server or client endpoint, capture the
//! tunnel interface, tear the tunnel down) and hands that decision to the
//! daemon manager.
//!
//! The daemon is considered up while its pidfile names a live process.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::platform::Platform;

/// Base port for tunnel endpoints; each tunnel adds its ordinal.
const TUNNEL_BASE_PORT: u16 = 5000;

/// What the external tunnel daemon manager should do for one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Nothing to do; the endpoint state matches the desired state.
    Leave,
    /// Start the listening endpoint on the given port.
    StartServer { port: u16 },
    /// Start the connecting endpoint toward the partner on the given port.
    StartClient { port: u16 },
    /// Capture the now-up tunnel interface in the bridge.
    Capture { bridge: String },
    /// Stop the endpoint with the given pid and remove its pidfile.
    TearDown { pid: i32 },
}

/// One configured tunnel: a shared network name, the `tun<N>` interface the
/// daemon creates, and the `biz<N>` bridge it splices into.
#[derive(Debug, Clone)]
pub struct Tunnel {
    name: String,
    ordinal: u32,
    tunnel_interface: String,
    bridge: String,
    run_dir: PathBuf,
}

impl Tunnel {
    pub fn new(name: impl Into<String>, ordinal: u32, run_dir: PathBuf) -> Tunnel {
        Tunnel {
            name: name.into(),
            ordinal,
            tunnel_interface: format!("tun{ordinal}"),
            bridge: format!("biz{ordinal}"),
            run_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn tunnel_interface(&self) -> &str {
        &self.tunnel_interface
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// The endpoint port for this tunnel.
    pub fn port(&self) -> u16 {
        TUNNEL_BASE_PORT + self.ordinal as u16
    }

    fn pidfile(&self) -> PathBuf {
        self.run_dir
            .join(format!("vtund-{}.pid", self.tunnel_interface))
    }

    /// The daemon pid, if its pidfile names a live process.
    pub fn daemon_pid(&self) -> Option<i32> {
        let contents = fs::read_to_string(self.pidfile()).ok()?;
        let pid: i32 = contents.split_whitespace().next()?.parse().ok()?;
        if pid <= 0 || !pid_alive(pid) {
            return None;
        }
        Some(pid)
    }

    /// True while the tunnel daemon for this tunnel is running.
    pub fn is_tunnel_up(&self) -> bool {
        self.daemon_pid().is_some()
    }

    /// Decide the next step toward `wanted`.
    ///
    /// `server` selects which endpoint this node runs (by convention node 0
    /// listens and node 1 connects). Capture is requested only once the
    /// daemon is up, the tunnel interface exists, and the bridge does not
    /// already hold a tunnel port.
    pub fn maintain(&self, platform: &Platform, wanted: bool, server: bool) -> TunnelAction {
        let up = self.is_tunnel_up();

        if !wanted {
            return match self.daemon_pid() {
                Some(pid) => TunnelAction::TearDown { pid },
                None => TunnelAction::Leave,
            };
        }

        if !up {
            return if server {
                TunnelAction::StartServer { port: self.port() }
            } else {
                TunnelAction::StartClient { port: self.port() }
            };
        }

        if !platform.exists(&self.tunnel_interface) {
            // daemon alive but the interface is not there yet
            return TunnelAction::Leave;
        }

        if platform.is_captured(&self.tunnel_interface) {
            return TunnelAction::Leave;
        }
        if platform.is_tunnelled(&self.bridge) {
            warn!(
                "'{}' already holds a tunnel port, not capturing '{}'",
                self.bridge, self.tunnel_interface
            );
            return TunnelAction::Leave;
        }

        TunnelAction::Capture {
            bridge: self.bridge.clone(),
        }
    }

    /// Log the decision the way the daemon manager will see it.
    pub fn report(&self, action: &TunnelAction) {
        match action {
            TunnelAction::Leave => {}
            TunnelAction::StartServer { port } => {
                info!("tunnel '{}': start server endpoint on port {port}", self.name);
            }
            TunnelAction::StartClient { port } => {
                info!("tunnel '{}': start client endpoint on port {port}", self.name);
            }
            TunnelAction::Capture { bridge } => {
                info!(
                    "tunnel '{}': capture '{}' in bridge '{bridge}'",
                    self.name, self.tunnel_interface
                );
            }
            TunnelAction::TearDown { pid } => {
                info!("tunnel '{}': tear down endpoint (pid {pid})", self.name);
            }
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetmgrConfig;

    fn scratch() -> (tempfile::TempDir, Platform, Tunnel) {
        let dir = tempfile::tempdir().unwrap();
        let config = NetmgrConfig {
            sysfs_net: dir.path().join("net"),
            ..Default::default()
        };
        fs::create_dir_all(&config.sysfs_net).unwrap();
        let platform = Platform::from_config(&config);
        let tunnel = Tunnel::new("ibiz0", 0, dir.path().to_path_buf());
        (dir, platform, tunnel)
    }

    #[test]
    fn test_port_follows_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Tunnel::new("ibiz2", 2, dir.path().to_path_buf());
        assert_eq!(tunnel.port(), 5002);
        assert_eq!(tunnel.tunnel_interface(), "tun2");
        assert_eq!(tunnel.bridge(), "biz2");
    }

    #[test]
    fn test_down_without_pidfile() {
        let (_dir, platform, tunnel) = scratch();
        assert!(!tunnel.is_tunnel_up());
        assert_eq!(
            tunnel.maintain(&platform, true, true),
            TunnelAction::StartServer { port: 5000 }
        );
        assert_eq!(
            tunnel.maintain(&platform, true, false),
            TunnelAction::StartClient { port: 5000 }
        );
        // nothing wanted, nothing running
        assert_eq!(tunnel.maintain(&platform, false, true), TunnelAction::Leave);
    }

    #[test]
    fn test_stale_pidfile_counts_as_down() {
        let (dir, platform, tunnel) = scratch();
        // pid 1 is alive but unlikely ours; use an absurd pid instead
        fs::write(dir.path().join("vtund-tun0.pid"), "999999999\n").unwrap();
        assert!(!tunnel.is_tunnel_up());
        assert_eq!(
            tunnel.maintain(&platform, true, true),
            TunnelAction::StartServer { port: 5000 }
        );
    }

    #[test]
    fn test_live_daemon_drives_capture_and_teardown() {
        let (dir, platform, tunnel) = scratch();
        let own_pid = std::process::id() as i32;
        fs::write(dir.path().join("vtund-tun0.pid"), format!("{own_pid}\n")).unwrap();
        assert_eq!(tunnel.daemon_pid(), Some(own_pid));

        // daemon up but no interface yet
        assert_eq!(tunnel.maintain(&platform, true, true), TunnelAction::Leave);

        // interface appears, not captured: capture it
        fs::create_dir_all(dir.path().join("net").join("tun0")).unwrap();
        assert_eq!(
            tunnel.maintain(&platform, true, true),
            TunnelAction::Capture {
                bridge: "biz0".to_string()
            }
        );

        // already captured: nothing to do
        fs::create_dir_all(dir.path().join("net").join("tun0").join("brport")).unwrap();
        assert_eq!(tunnel.maintain(&platform, true, true), TunnelAction::Leave);

        // no longer wanted: tear the daemon down
        assert_eq!(
            tunnel.maintain(&platform, false, true),
            TunnelAction::TearDown { pid: own_pid }
        );
    }
}
