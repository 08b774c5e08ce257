//! Engine configuration.
//!
//! All values have working defaults; the daemon layers an optional config
//! file and environment overrides on top of these before start. Paths are
//! configurable mostly so the filesystem-touching paths can be pointed at a
//! scratch directory in tests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the network state engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetmgrConfig {
    /// Directory holding the persisted state (`partner-cache`, `hosts`).
    pub workdir: PathBuf,

    /// File holding this node's UUID; assigned on first run if missing.
    pub uuid_file: PathBuf,

    /// Name of the designated private link, if any. Peers discovered on this
    /// link become the partner node.
    pub private_link: Option<String>,

    /// Seconds between advertisement/heartbeat rounds.
    pub advertise_interval: u64,

    /// Minimum seconds between link bounces.
    pub link_bounce_interval: u64,

    /// Bounce attempts before backing off.
    pub link_bounce_attempts: u32,

    /// Seconds to back off once the attempt budget is spent.
    pub link_bounce_reattempt: u64,

    /// File consulted for the cluster name when the domain name is unset.
    pub cluster_name_file: PathBuf,

    /// udev rules file rewritten to pin physical interface names.
    pub udev_rules_file: PathBuf,

    /// sysfs network class directory.
    pub sysfs_net: PathBuf,

    /// procfs per-interface IPv6 configuration directory.
    pub proc_ipv6_conf: PathBuf,

    /// Directory checked for `<name>.quiesce` sentinel files.
    pub quiesce_dir: PathBuf,

    /// Directory checked for `<name>.fault` sentinel files.
    pub fault_dir: PathBuf,

    /// Directory holding tunnel daemon pidfiles.
    pub run_dir: PathBuf,
}

impl Default for NetmgrConfig {
    fn default() -> Self {
        NetmgrConfig {
            workdir: PathBuf::from("/var/lib/netmgr"),
            uuid_file: PathBuf::from("/etc/netmgr/uuid"),
            private_link: None,
            advertise_interval: 3,
            link_bounce_interval: 1200,
            link_bounce_attempts: 2,
            link_bounce_reattempt: 1200,
            cluster_name_file: PathBuf::from("/etc/sysconfig/cluster_name"),
            udev_rules_file: PathBuf::from("/etc/udev/rules.d/58-net-rename.rules"),
            sysfs_net: PathBuf::from("/sys/class/net"),
            proc_ipv6_conf: PathBuf::from("/proc/sys/net/ipv6/conf"),
            quiesce_dir: PathBuf::from("/tmp"),
            fault_dir: PathBuf::from("/var/run/interface"),
            run_dir: PathBuf::from("/var/run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetmgrConfig::default();
        assert_eq!(config.advertise_interval, 3);
        assert_eq!(config.link_bounce_interval, 1200);
        assert_eq!(config.link_bounce_attempts, 2);
        assert_eq!(config.link_bounce_reattempt, 1200);
        assert!(config.private_link.is_none());
    }
}
