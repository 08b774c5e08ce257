//! Network state engine for the netmgr cluster network manager.
//!
//! The engine consumes typed kernel events from `netmgr-netlink`, maintains
//! the interface registry and the node/peer identity tables, runs the
//! ICMPv6 neighbor protocol and the multicast heartbeat on every tracked
//! interface, and periodically publishes the cluster membership view as a
//! binary host table.

pub mod bridge;
pub mod config;
pub mod heartbeat;
pub mod icmp6;
pub mod interface;
pub mod monitor;
pub mod node;
pub mod peer;
pub mod platform;
mod sock;
pub mod tunnel;

pub use config::NetmgrConfig;
pub use monitor::Monitor;
