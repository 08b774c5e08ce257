//! sysfs/procfs platform capability.
//!
//! Everything the engine learns about an interface outside of netlink comes
//! through here: carrier state, bridge/captured/tunnelled classification,
//! router-advertisement acceptance, and the administrative sentinel files.
//! The roots are injectable so tests can point them at a scratch tree.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use netmgr_common::types::MacAddr;

use crate::config::NetmgrConfig;

/// Filesystem-facing platform operations.
#[derive(Debug, Clone)]
pub struct Platform {
    sysfs_net: PathBuf,
    proc_ipv6_conf: PathBuf,
    quiesce_dir: PathBuf,
    fault_dir: PathBuf,
}

impl Platform {
    pub fn from_config(config: &NetmgrConfig) -> Self {
        Platform {
            sysfs_net: config.sysfs_net.clone(),
            proc_ipv6_conf: config.proc_ipv6_conf.clone(),
            quiesce_dir: config.quiesce_dir.clone(),
            fault_dir: config.fault_dir.clone(),
        }
    }

    fn class_dir(&self, name: &str) -> PathBuf {
        self.sysfs_net.join(name)
    }

    /// Root of the sysfs network class tree.
    pub fn sysfs_net_root(&self) -> &Path {
        &self.sysfs_net
    }

    /// True if the kernel currently knows an interface by this name.
    pub fn exists(&self, name: &str) -> bool {
        self.class_dir(name).symlink_metadata().is_ok()
    }

    /// Read the interface's hardware address from sysfs. Used when a link
    /// message arrives without one.
    pub fn mac_address(&self, name: &str) -> Option<netmgr_common::types::MacAddr> {
        let path = self.class_dir(name).join("address");
        let contents = fs::read_to_string(path).ok()?;
        contents.trim().parse().ok()
    }

    /// Read the carrier bit. `None` when the interface (or its carrier
    /// attribute) is gone, which callers treat as "no link".
    pub fn carrier(&self, name: &str) -> Option<bool> {
        let path = self.class_dir(name).join("carrier");
        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<i32>() {
                Ok(value) => Some(value != 0),
                Err(_) => None,
            },
            Err(err) => {
                debug!("{name}: could not determine carrier: {err}");
                None
            }
        }
    }

    /// Physical interfaces have a backing device in sysfs. Xen vif devices
    /// also expose one, so those are excluded by name.
    pub fn is_physical(&self, name: &str) -> bool {
        if name.starts_with("vif") {
            return false;
        }
        self.class_dir(name).join("device").symlink_metadata().is_ok()
    }

    /// True if the interface is itself a bridge.
    pub fn is_bridge(&self, name: &str) -> bool {
        self.class_dir(name).join("bridge").symlink_metadata().is_ok()
    }

    /// True if the interface has been captured as a bridge port.
    pub fn is_captured(&self, name: &str) -> bool {
        self.class_dir(name).join("brport").symlink_metadata().is_ok()
    }

    /// True if some `tun*` pseudo-interface is a port of the named bridge.
    pub fn is_tunnelled(&self, bridge: &str) -> bool {
        let entries = match fs::read_dir(&self.sysfs_net) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        for entry in entries.flatten() {
            let port_name = entry.file_name();
            let port_name = port_name.to_string_lossy();
            if !port_name.starts_with("tun") {
                continue;
            }
            let link = entry.path().join("brport").join("bridge");
            let target = match fs::read_link(&link) {
                Ok(target) => target,
                Err(_) => continue,
            };
            if target.file_name().map(|n| n == bridge).unwrap_or(false) {
                info!("'{bridge}' is tunnelled through '{port_name}'");
                return true;
            }
        }
        false
    }

    /// Names of the ports captured by the named bridge.
    pub fn bridge_ports(&self, bridge: &str) -> Vec<String> {
        let brif = self.class_dir(bridge).join("brif");
        let mut ports = Vec::new();
        if let Ok(entries) = fs::read_dir(brif) {
            for entry in entries.flatten() {
                ports.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ports
    }

    /// Read the interface's `accept_ra` setting.
    pub fn accept_ra(&self, name: &str) -> Option<bool> {
        let path = self.proc_ipv6_conf.join(name).join("accept_ra");
        match fs::read_to_string(&path) {
            Ok(contents) => contents.trim().parse::<i32>().ok().map(|v| v != 0),
            Err(err) => {
                error!("{name}: could not determine accept_ra: {err}");
                None
            }
        }
    }

    /// Write the interface's `accept_ra` setting.
    pub fn set_accept_ra(&self, name: &str, value: bool) {
        let path = self.proc_ipv6_conf.join(name).join("accept_ra");
        if let Err(err) = fs::write(&path, if value { "1\n" } else { "0\n" }) {
            error!("{name}: could not set accept_ra: {err}");
        }
    }

    /// True while the quiesce sentinel for this interface is present. A
    /// quiesced interface must not be bounced.
    pub fn is_quiesced(&self, name: &str) -> bool {
        self.quiesce_dir.join(format!("{name}.quiesce")).exists()
    }

    /// True while the fault sentinel for this interface is present. Link
    /// repair and bridge capture are skipped under fault injection.
    pub fn has_fault_injected(&self, name: &str) -> bool {
        self.fault_dir.join(format!("{name}.fault")).exists()
    }

    /// Rewrite the udev rename rules pinning each physical interface's name
    /// to its hardware address. The file is replaced atomically.
    pub fn persist_interface_names(
        &self,
        rules_file: &Path,
        interfaces: &[(MacAddr, String)],
    ) -> std::io::Result<()> {
        info!("persisting the change in interface configuration");
        let tmp = rules_file.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        for (mac, name) in interfaces {
            writeln!(
                f,
                "KERNEL==\"eth*\", SYSFS{{address}}==\"{mac}\", NAME=\"{name}\", OPTIONS=\"last_rule\""
            )?;
        }
        if let Err(err) = f.sync_data() {
            error!("IO error saving persistent device names: {err}");
        }
        drop(f);
        fs::rename(&tmp, rules_file)?;
        Ok(())
    }
}
