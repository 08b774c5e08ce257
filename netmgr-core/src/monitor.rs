//! Interface registry and reconciliation loop.
//!
//! The monitor owns the map from kernel interface index to [`Interface`],
//! applies kernel events to it, and drives the periodic work: neighbor
//! advertisements, heartbeats, link probes to catch missed events, and the
//! host table snapshot. Kernel events arrive on a single task so events for
//! one interface are always applied in the order the kernel sent them; a
//! new interface is inserted into the registry before its listeners start.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::io;
use std::io::Write;
use std::net::Ipv6Addr;
use std::os::unix::fs::PermissionsExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use netmgr_common::hosts::{HostEntry, HOST_TABLE_ENTRIES, HOST_TABLE_SIZE};
use netmgr_common::types::{remote_interface_name, MacAddr, ORDINAL_UNASSIGNED};
use netmgr_common::uuid::Uuid;
use netmgr_netlink::{
    AddressEvent, AddressOutcome, Event, LinkFamily, LinkSnapshot, NetlinkClient,
};

use crate::bridge::Bridge;
use crate::config::NetmgrConfig;
use crate::heartbeat::HeartbeatSocket;
use crate::icmp6::{IcmpSocket, Pdu, ReceiveHandler};
use crate::interface::Interface;
use crate::node::{NodeId, NodeStore};
use crate::platform::Platform;
use crate::sock;
use crate::tunnel::{Tunnel, TunnelAction};

/// How many ticks between link re-probes.
const PROBE_TICKS: u64 = 10;

/// How many ticks between maintenance hooks.
const MAINTENANCE_TICKS: u64 = 100;

/// The network state engine.
pub struct Monitor {
    config: NetmgrConfig,
    platform: Platform,
    nodes: NodeStore,
    interfaces: RwLock<HashMap<u32, Arc<Interface>>>,
    client: NetlinkClient,
    uuid: Uuid,
    host_ordinal: u8,
    tunnels: std::sync::Mutex<Vec<(Tunnel, bool)>>,
    topology_changed: AtomicBool,
    cluster_name_known: AtomicBool,
    cluster_name_err_rate: AtomicU32,
}

impl Monitor {
    /// Build the engine around an open netlink request client.
    pub fn new(config: NetmgrConfig, client: NetlinkClient, uuid: Uuid) -> Arc<Monitor> {
        let platform = Platform::from_config(&config);
        let nodes = NodeStore::new(config.workdir.join("partner-cache"));
        let host_ordinal = derive_host_ordinal();

        Arc::new(Monitor {
            config,
            platform,
            nodes,
            interfaces: RwLock::new(HashMap::new()),
            client,
            uuid,
            host_ordinal,
            tunnels: std::sync::Mutex::new(Vec::new()),
            topology_changed: AtomicBool::new(false),
            cluster_name_known: AtomicBool::new(false),
            cluster_name_err_rate: AtomicU32::new(0),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Current interfaces, in index order.
    pub fn interfaces_snapshot(&self) -> Vec<Arc<Interface>> {
        let map = self.interfaces.read().unwrap();
        let mut interfaces: Vec<_> = map.values().cloned().collect();
        interfaces.sort_by_key(|i| i.index());
        interfaces
    }

    pub fn find_interface(&self, index: u32) -> Option<Arc<Interface>> {
        self.interfaces.read().unwrap().get(&index).cloned()
    }

    pub fn find_interface_by_name(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces
            .read()
            .unwrap()
            .values()
            .find(|i| i.name() == name)
            .cloned()
    }

    // ---- kernel event handling ----------------------------------------

    pub async fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::LinkAdded(snapshot) => self.handle_new_link(snapshot).await,
            Event::LinkRemoved(snapshot) => self.handle_del_link(snapshot),
            Event::AddressAdded(event) => self.handle_new_address(event),
            Event::AddressRemoved(event) => self.handle_del_address(event).await,
        }
    }

    async fn handle_new_link(self: &Arc<Self>, snapshot: LinkSnapshot) {
        let existing = self.find_interface(snapshot.index);

        let interface = match existing {
            None => {
                let Some(name) = snapshot.name.clone() else {
                    warn!("link message for index {} carries no name", snapshot.index);
                    return;
                };
                debug!("adding {}({}) to interface list", name, snapshot.index);

                let interface = Arc::new(Interface::from_snapshot(
                    &snapshot,
                    name,
                    self.platform.clone(),
                    &self.config,
                ));
                self.interfaces
                    .write()
                    .unwrap()
                    .insert(snapshot.index, Arc::clone(&interface));

                interface.update(&snapshot);

                if interface.is_physical() {
                    if interface.carrier() {
                        interface.link_up();
                    } else {
                        interface.link_down();
                    }
                }

                // A shared network can be deleted before the event
                // announcing its creation is read, typically after a
                // netlink buffer overflow.
                if !interface.exists() {
                    warn!(
                        "interface {} does not appear to exist, skipping",
                        interface.label()
                    );
                    return;
                }

                let is_bridge = interface.is_bridge();
                let is_physical = interface.is_physical();
                info!(
                    "checking whether {} should be brought up: {} {}",
                    interface.label(),
                    if is_bridge { "is BRIDGE" } else { "not BRIDGE" },
                    if is_physical { "is PHYSICAL" } else { "not PHYSICAL" },
                );

                if is_bridge || is_physical {
                    self.bring_up(&interface).await;
                    info!("brought up interface {}", interface.label());
                }
                return;
            }
            Some(interface) => interface,
        };

        // state change on a known interface
        interface.update(&snapshot);

        let mut link_message = "";
        let mut repair_needed = false;

        let state = interface.link_state();
        if state.link_changed() {
            if state.has_link() {
                interface.link_up();
                link_message = ", link up";
            } else {
                interface.link_down();
                link_message = ", link down";
            }
        }

        if !state.has_link()
            && interface.is_physical()
            && (!interface.is_private() || interface.is_sync())
            && interface.bounce_expired()
        {
            repair_needed = true;
        }

        let up_message = if state.up_changed() {
            if state.is_up() {
                ", oper brought up"
            } else {
                ", oper brought down"
            }
        } else {
            ""
        };
        let running_message = if state.running_changed() {
            if state.has_link() {
                ", started running"
            } else {
                ", stopped running"
            }
        } else {
            ""
        };
        let promisc_message = if state.promiscuity_changed() {
            if state.is_promiscuous() {
                ", went promiscuous"
            } else {
                ", left promiscuous"
            }
        } else {
            ""
        };
        let dormant_message = if state.dormancy_changed() {
            if state.is_dormant() {
                ", went dormant"
            } else {
                ", left dormant"
            }
        } else {
            ""
        };

        if !link_message.is_empty()
            || !up_message.is_empty()
            || !running_message.is_empty()
            || !promisc_message.is_empty()
            || !dormant_message.is_empty()
        {
            info!(
                "{}: <NewLink>{link_message}{up_message}{running_message}{promisc_message}{dormant_message}",
                interface.label()
            );
        }

        if snapshot.family == LinkFamily::Bridge {
            let bridge_name = snapshot
                .bridge_index
                .and_then(|index| self.find_interface(index))
                .map(|bridge| bridge.name().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            info!("{}: added to bridge '{bridge_name}'", interface.label());
        }

        if repair_needed {
            if interface.has_fault_injected() {
                info!(
                    "{} fault injected, not repairing link",
                    interface.label()
                );
            } else {
                self.repair_link(&interface).await;
            }
        }
    }

    fn handle_del_link(&self, snapshot: LinkSnapshot) {
        if snapshot.index == 0 {
            warn!("received a DelLink message for interface index 0");
            return;
        }

        let Some(interface) = self.find_interface(snapshot.index) else {
            let name = snapshot.name.as_deref().unwrap_or("unknown");
            warn!("unknown interface removed: {}({})", name, snapshot.index);
            return;
        };

        interface.update(&snapshot);

        let state = interface.link_state();
        let mut messages = Vec::new();
        if state.link_changed() {
            if state.has_link() {
                interface.link_up();
                messages.push(", link up");
            } else {
                interface.link_down();
                messages.push(", link down");
            }
        }
        if state.up_changed() {
            messages.push(if state.is_up() {
                ", oper brought up"
            } else {
                ", oper brought down"
            });
        }
        if state.running_changed() {
            messages.push(if state.has_link() {
                ", started running"
            } else {
                ", stopped running"
            });
        }
        if state.promiscuity_changed() {
            messages.push(if state.is_promiscuous() {
                ", went promiscuous"
            } else {
                ", left promiscuous"
            });
        }
        if !messages.is_empty() {
            info!("{}: <DelLink>{}", interface.label(), messages.concat());
        }

        if snapshot.family == LinkFamily::Bridge {
            let bridge_name = snapshot
                .bridge_index
                .and_then(|index| self.find_interface(index))
                .map(|bridge| bridge.name().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            if interface.is_captured() {
                info!(
                    "{}: removed from bridge '{bridge_name}'",
                    interface.label()
                );
            } else {
                info!(
                    "{}: DelLink message from bridge '{bridge_name}' but not removed",
                    interface.label()
                );
            }
            return;
        }

        if snapshot.change_mask == 0xFFFF_FFFF {
            warn!("{}: removed from system", interface.label());
            interface.remove();
        }
    }

    fn handle_new_address(&self, event: AddressEvent) {
        let Some(interface) = self.find_interface(event.index) else {
            // address on an interface we do not track (like a VIF)
            return;
        };

        match event.family {
            LinkFamily::Inet6 => {}
            LinkFamily::Inet => {
                info!("IPv4 address added to '{}'", interface.name());
                return;
            }
            _ => {
                info!("unknown address family added to '{}'", interface.name());
                return;
            }
        }

        match event.address {
            Some(std::net::IpAddr::V6(address)) if interface.is_primary(&address) => {
                info!("primary ipv6 address added to '{}'", interface.name());
            }
            _ => {
                debug!(
                    "secondary ipv6 address added to '{}', ignoring",
                    interface.name()
                );
            }
        }
    }

    async fn handle_del_address(&self, event: AddressEvent) {
        let Some(interface) = self.find_interface(event.index) else {
            return;
        };

        match event.family {
            LinkFamily::Inet6 => {}
            LinkFamily::Inet => {
                info!("IPv4 address removed from '{}', ignoring", interface.name());
                return;
            }
            _ => {
                info!(
                    "unknown address family removed from '{}', ignoring",
                    interface.name()
                );
                return;
            }
        }

        match event.address {
            Some(std::net::IpAddr::V6(address)) if interface.is_primary(&address) => {
                info!(
                    "primary ipv6 address removed from '{}', repairing",
                    interface.name()
                );
                self.configure_addresses(&interface).await;
            }
            _ => {
                debug!(
                    "secondary ipv6 address removed from '{}', ignoring",
                    interface.name()
                );
            }
        }
    }

    // ---- interface bring-up and repair --------------------------------

    /// Install the interface's link-local address, tolerating "already
    /// there".
    async fn configure_addresses(&self, interface: &Interface) {
        match self
            .client
            .set_address(interface.index(), interface.primary_address(), 64)
            .await
        {
            Ok(AddressOutcome::Installed) => {
                debug!("configured address for '{}'", interface.name());
            }
            Ok(AddressOutcome::AlreadyPresent) => {
                debug!("'{}' already configured with address", interface.name());
            }
            Err(err) => {
                error!("addr config request for '{}' failed: {err}", interface.name());
            }
        }
    }

    /// Bring the link up, install the primary address, open the sockets,
    /// and start the per-interface listeners.
    async fn bring_up(self: &Arc<Self>, interface: &Arc<Interface>) {
        debug!("bring up '{}'", interface.name());

        if interface.has_fault_injected() {
            info!(
                "{} fault injected, not bringing link up",
                interface.label()
            );
        } else {
            if let Err(err) = self.client.set_link_up(interface.index()).await {
                warn!("could not bring link up for '{}': {err}", interface.name());
            }
            self.configure_addresses(interface).await;
        }

        if let Err(err) = interface.create_sockets() {
            // central policy for socket exhaustion: give up on this
            // interface, keep the process alive
            error!(
                "{}: could not create sockets: {err}, disabling interface",
                interface.label()
            );
            interface.remove();
            return;
        }

        self.spawn_listeners(interface);
    }

    /// Bounce the link to force renegotiation. No-op while quiesced.
    async fn repair_link(&self, interface: &Arc<Interface>) {
        if interface.is_quiesced() {
            info!("{}: is quiesced, not bouncing", interface.label());
            return;
        }
        debug!("{}: attempt to repair link", interface.label());
        if let Err(err) = self.client.set_link_down(interface.index()).await {
            warn!("could not bring link down for '{}': {err}", interface.name());
        }
        if let Err(err) = self.client.set_link_up(interface.index()).await {
            warn!("could not bring link up for '{}': {err}", interface.name());
        }
        interface.record_bounce();
    }

    /// Capture a physical `ibiz<N>` interface in its `biz<N>` bridge.
    pub async fn capture(&self, interface: &Arc<Interface>) {
        if interface.has_fault_injected() {
            info!(
                "{} fault injected, not capturing in bridge",
                interface.label()
            );
            return;
        }

        info!("need to capture '{}'", interface.name());
        let Some(ordinal) = interface
            .name()
            .strip_prefix("ibiz")
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            error!("invalid interface name for bridge: '{}'", interface.name());
            return;
        };

        let bridge = Bridge::new(format!("biz{ordinal}"));
        if let Err(err) = bridge.create() {
            error!("failed to create bridge '{}': {err}", bridge.name());
            return;
        }
        if let Err(err) = bridge.set_mac_address(&self.platform, interface.mac()) {
            warn!("could not clone MAC onto '{}': {err}", bridge.name());
        }

        if bridge.is_tunnelled(&self.platform) {
            warn!(
                "'{}' is tunnelled, not capturing '{}'",
                bridge.name(),
                interface.name()
            );
        } else if let Err(err) = bridge.add(interface.index(), interface.name()) {
            warn!(
                "failed to capture '{}' in '{}': {err}",
                interface.name(),
                bridge.name()
            );
        }

        if let Err(err) = self.client.set_link_up(interface.index()).await {
            warn!("could not bring link up for '{}': {err}", interface.name());
        }
    }

    /// The bridge that captured `interface`, if any.
    pub fn find_bridge_interface(&self, interface: &Interface) -> Option<Arc<Interface>> {
        if !interface.is_physical() || !interface.is_captured() {
            return None;
        }
        for candidate in self.interfaces_snapshot() {
            if !candidate.is_bridge() {
                continue;
            }
            if self
                .platform
                .bridge_ports(candidate.name())
                .iter()
                .any(|port| port == interface.name())
            {
                return Some(candidate);
            }
        }
        info!("unable to find bridge interface for {}", interface.name());
        None
    }

    // ---- listeners -----------------------------------------------------

    fn spawn_listeners(self: &Arc<Self>, interface: &Arc<Interface>) {
        let icmp_interface = Arc::clone(interface);
        let result = thread::Builder::new()
            .name(format!("icmp6-{}", interface.name()))
            .spawn(move || {
                let guarded = catch_unwind(AssertUnwindSafe(|| {
                    icmp6_listener(&icmp_interface);
                }));
                if guarded.is_err() {
                    error!(
                        "{}: ICMPv6 listener panicked, disabling interface",
                        icmp_interface.label()
                    );
                    icmp_interface.remove();
                }
            });
        if let Err(err) = result {
            error!("could not spawn ICMPv6 listener: {err}");
        }

        let monitor = Arc::clone(self);
        let pulse_interface = Arc::clone(interface);
        let result = thread::Builder::new()
            .name(format!("pulse-{}", interface.name()))
            .spawn(move || {
                let guarded = catch_unwind(AssertUnwindSafe(|| {
                    heartbeat_listener(&monitor, &pulse_interface);
                }));
                if guarded.is_err() {
                    error!(
                        "{}: heartbeat listener panicked, disabling interface",
                        pulse_interface.label()
                    );
                    pulse_interface.remove();
                }
            });
        if let Err(err) = result {
            error!("could not spawn heartbeat listener: {err}");
        }
    }

    /// A heartbeat arrived: learn the node, learn the peer, link them, and
    /// raise partner/topology state as needed.
    pub fn heartbeat_received(&self, interface: &Interface, sender: Ipv6Addr, uuid: Uuid) {
        let Some(node_id) = self.nodes.intern(uuid) else {
            return;
        };
        let Some((peer_id, is_new)) = interface.neighbors().intern(sender) else {
            return;
        };

        let is_private = interface.is_private();
        let ordinal = interface.ordinal();
        let Some((peer_partner, spine_notified)) =
            interface.neighbors().with_peer(peer_id, |peer| {
                peer.set_interface(is_private, ordinal);
                if is_new && is_private {
                    peer.make_partner();
                }
                peer.set_node(node_id);
                peer.touch();
                (peer.is_partner(), peer.has_notified_spine())
            })
        else {
            return;
        };

        if is_new && is_private {
            info!("{} neighbor {sender} is partner", interface.label());
        }

        // A partner peer pointing at a node that is not yet a partner means
        // this is the first discovery (or a node replace); cache it.
        if peer_partner && self.nodes.make_partner(node_id) {
            info!("node {uuid} is partner");
            self.nodes.save_partner_cache();
        }

        if !spine_notified {
            self.report_topology_change(interface, peer_id, node_id);
        }
    }

    fn report_topology_change(&self, interface: &Interface, peer_id: crate::peer::PeerId, node_id: NodeId) {
        let node_ordinal = match self.nodes.get(node_id) {
            Some(node) if node.ordinal() != ORDINAL_UNASSIGNED => node.ordinal().to_string(),
            _ => "?".to_string(),
        };
        let remote = interface
            .neighbors()
            .with_peer(peer_id, |peer| {
                peer.set_spine_notified();
                remote_interface_name(peer.name(), peer.ordinal(), peer.is_private())
            })
            .unwrap_or_else(|| "?".to_string());
        info!(
            "Topology change: node{node_ordinal}:{remote} seen on {}",
            interface.name()
        );
        self.notify_topology_changed();
    }

    pub fn notify_topology_changed(&self) {
        self.topology_changed.store(true, Ordering::SeqCst);
    }

    /// Consume the topology-change flag.
    pub fn take_topology_change(&self) -> bool {
        self.topology_changed.swap(false, Ordering::SeqCst)
    }

    // ---- periodic work -------------------------------------------------

    /// Send neighbor advertisements on every interface.
    pub fn advertise(&self) {
        for interface in self.interfaces_snapshot() {
            interface.advertise(&self.nodes);
        }
    }

    /// Send a heartbeat on every interface with an open sender.
    pub fn send_heartbeats(&self) {
        for interface in self.interfaces_snapshot() {
            interface.send_heartbeat(&self.uuid);
        }
    }

    /// Re-dump the link table to catch events lost to buffer overruns.
    pub async fn probe(self: &Arc<Self>) {
        debug!("sending link probe");
        match self.client.list_links().await {
            Ok(links) => {
                for snapshot in links {
                    self.handle_new_link(snapshot).await;
                }
            }
            Err(err) => warn!("link probe failed: {err}"),
        }
    }

    /// Register a tunnel or update whether it should be up. Called by the
    /// administrative channel when a shared network gains or loses its
    /// remote interface.
    pub fn set_tunnel(&self, name: &str, ordinal: u32, wanted: bool) {
        let mut tunnels = self.tunnels.lock().unwrap();
        if let Some(slot) = tunnels.iter_mut().find(|(t, _)| t.name() == name) {
            slot.1 = wanted;
            return;
        }
        info!("tracking tunnel '{name}' (ordinal {ordinal})");
        tunnels.push((
            Tunnel::new(name, ordinal, self.config.run_dir.clone()),
            wanted,
        ));
    }

    /// Evaluate every tracked tunnel and apply the resulting decisions.
    /// Endpoint starts and stops are only reported; the daemon lifecycle
    /// belongs to an external manager.
    pub fn maintain_tunnels(&self) {
        let server = self.host_ordinal == 0;
        let tunnels = self.tunnels.lock().unwrap().clone();
        for (tunnel, wanted) in tunnels {
            let action = tunnel.maintain(&self.platform, wanted, server);
            tunnel.report(&action);
            if let TunnelAction::Capture { bridge } = action {
                let Some(interface) = self.find_interface_by_name(tunnel.tunnel_interface())
                else {
                    continue;
                };
                let bridge = Bridge::new(bridge);
                if let Err(err) = bridge.add(interface.index(), interface.name()) {
                    warn!(
                        "failed to capture '{}' in '{}': {err}",
                        interface.name(),
                        bridge.name()
                    );
                }
            }
        }
    }

    /// Rewrite the udev rules pinning physical interface names.
    pub fn persist_interface_names(&self) {
        let interfaces: Vec<(MacAddr, String)> = self
            .interfaces_snapshot()
            .iter()
            .filter(|i| !i.removed() && i.is_physical())
            .map(|i| (i.mac(), i.name().to_string()))
            .collect();
        if let Err(err) = self
            .platform
            .persist_interface_names(&self.config.udev_rules_file, &interfaces)
        {
            error!("could not persist interface names: {err}");
        }
    }

    /// Publish the host table snapshot: one entry per bridge or private
    /// interface, one per partner peer, written to a scratch file and
    /// rotated into place so readers never see a partial table.
    pub fn update_hosts(&self) {
        if let Err(err) = self.write_hosts() {
            error!("could not update hosts table: {err}");
        }
    }

    fn write_hosts(&self) -> io::Result<()> {
        let mut image = BytesMut::with_capacity(HOST_TABLE_SIZE);
        let mut entries = 0usize;
        let mut truncated = false;

        let mut push = |entry: HostEntry, image: &mut BytesMut| {
            if entries == HOST_TABLE_ENTRIES {
                truncated = true;
                return;
            }
            entry.encode(image);
            entries += 1;
        };

        for interface in self.interfaces_snapshot() {
            if interface.removed() {
                continue;
            }
            if !interface.is_bridge() && !interface.is_private() {
                continue;
            }

            if !interface.no_ordinal() {
                push(
                    HostEntry {
                        node_uuid: self.uuid,
                        primary_address: interface.primary_address(),
                        valid: true,
                        partner: false,
                        is_private: interface.is_private(),
                        mac: interface.mac(),
                        node_ordinal: self.host_ordinal,
                        interface_ordinal: interface.ordinal(),
                        ..Default::default()
                    },
                    &mut image,
                );
            }

            interface.neighbors().each_peer(|peer| {
                let Some(node_id) = peer.node() else {
                    return;
                };
                let Some(node) = self.nodes.get(node_id) else {
                    return;
                };
                if !node.is_partner() {
                    return;
                }
                push(
                    HostEntry {
                        node_uuid: node.uuid(),
                        primary_address: peer.address(),
                        valid: true,
                        partner: peer.is_partner(),
                        is_private: peer.is_private(),
                        node_ordinal: node.ordinal(),
                        interface_ordinal: peer.ordinal(),
                        ..Default::default()
                    },
                    &mut image,
                );
            });
        }

        if truncated {
            warn!("host table full, some entries were dropped");
        }
        image.resize(HOST_TABLE_SIZE, 0);

        let tmp = self.config.workdir.join("hosts.tmp");
        let hosts = self.config.workdir.join("hosts");
        let previous = self.config.workdir.join("hosts.1");

        let mut file = fs::File::create(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(0o644))?;
        file.write_all(&image)?;
        file.sync_all()?;
        drop(file);

        let _ = fs::remove_file(&previous);
        if let Err(err) = fs::hard_link(&hosts, &previous) {
            debug!("no previous hosts generation: {err}");
        }
        fs::rename(&tmp, &hosts)?;
        Ok(())
    }

    /// Learn the cluster name from the domain name or the sysconfig file,
    /// and push it back into the kernel when only the file has it.
    fn determine_cluster_name(&self) {
        let mut buffer = [0u8; 128];
        let rc = unsafe {
            libc::getdomainname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len())
        };
        if rc == 0 {
            if let Ok(name) = CStr::from_bytes_until_nul(&buffer) {
                let name = name.to_string_lossy();
                if !name.is_empty() && name != "(none)" {
                    info!("cluster name is {name}");
                    self.cluster_name_known.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }

        let contents = match fs::read_to_string(&self.config.cluster_name_file) {
            Ok(contents) => contents,
            Err(_) => {
                if (self.cluster_name_err_rate.fetch_add(1, Ordering::SeqCst) & 0xf) == 0 {
                    warn!("no cluster name present");
                }
                return;
            }
        };

        let name = contents
            .lines()
            .find_map(|line| line.trim().strip_prefix("export CLUSTERNAME="))
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let Some(name) = name else {
            warn!("failed to parse cluster name file");
            return;
        };

        let rc = unsafe {
            libc::setdomainname(name.as_ptr() as *const libc::c_char, name.len())
        };
        if rc == 0 {
            info!("set cluster name to {name}");
        } else {
            warn!(
                "failed to set cluster name to {name}: {}",
                io::Error::last_os_error()
            );
        }
        self.cluster_name_known.store(true, Ordering::SeqCst);
    }

    // ---- top level -----------------------------------------------------

    /// Run the engine: load the partner cache, seed the registry, consume
    /// kernel events, and tick the periodic work forever.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        self.nodes.load_partner_cache();
        self.probe().await;
        self.persist_interface_names();

        let event_monitor = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                event_monitor.handle_event(event).await;
            }
            info!("kernel event stream closed");
        });

        info!("network monitor started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.advertise_interval.max(1)));
        let mut iteration = 0u64;
        loop {
            ticker.tick().await;
            iteration += 1;

            if !self.cluster_name_known.load(Ordering::SeqCst) {
                self.determine_cluster_name();
            }
            self.maintain_tunnels();

            self.advertise();
            self.send_heartbeats();

            if iteration % PROBE_TICKS == 0 {
                self.probe().await;
            }
            if iteration % MAINTENANCE_TICKS == 0 {
                debug!("maintenance tick");
            }

            if self.take_topology_change() {
                info!("topology change recorded");
            }

            self.update_hosts();
        }
    }
}

// ---- per-interface listener bodies ------------------------------------

struct NeighborListener<'a> {
    interface: &'a Interface,
    icmp: &'a IcmpSocket,
}

impl ReceiveHandler for NeighborListener<'_> {
    fn echo_request(&mut self, from: Ipv6Addr) {
        self.icmp.send(from, &Pdu::EchoReply);
    }

    fn neighbor_solicitation(&mut self, from: Ipv6Addr, target: Ipv6Addr) {
        if self.interface.is_primary(&target) {
            let na = Pdu::advertisement(self.interface.primary_address(), self.interface.mac());
            self.icmp.send(from, &na);
        }
    }

    fn neighbor_advertisement(
        &mut self,
        from: Ipv6Addr,
        _target: Ipv6Addr,
        _mac: Option<MacAddr>,
    ) {
        let Some((peer_id, _)) = self.interface.neighbors().intern(from) else {
            return;
        };
        let is_private = self.interface.is_private();
        let ordinal = self.interface.ordinal();
        self.interface.neighbors().with_peer(peer_id, |peer| {
            peer.set_interface(is_private, ordinal);
            peer.touch();
        });
    }
}

fn icmp6_listener(interface: &Arc<Interface>) {
    while !interface.removed() {
        let Some(icmp) = interface.icmp_socket() else {
            break;
        };
        let mut listener = NeighborListener {
            interface: interface.as_ref(),
            icmp,
        };
        icmp.receive(&mut listener);
    }
    debug!("{}: ICMPv6 listener exiting", interface.label());
}

fn heartbeat_listener(monitor: &Arc<Monitor>, interface: &Arc<Interface>) {
    let inbound = match HeartbeatSocket::inbound(interface.index()) {
        Ok(socket) => socket,
        Err(err) => {
            error!(
                "{}: could not create heartbeat socket: {err}, disabling interface",
                interface.label()
            );
            interface.remove();
            return;
        }
    };

    while !interface.removed() {
        match inbound.receive() {
            Ok(Some((sender, uuid))) => monitor.heartbeat_received(interface, sender, uuid),
            Ok(None) => {}
            Err(err) if sock::is_timeout(&err) || sock::is_interrupted(&err) => continue,
            Err(err) => {
                error!("{}: heartbeat receive failed: {err}", interface.label());
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    debug!("{}: heartbeat listener exiting", interface.label());
}

pub(crate) fn derive_host_ordinal() -> u8 {
    let mut buffer = [0u8; 64];
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if rc != 0 {
        return 0;
    }
    let hostname = match CStr::from_bytes_until_nul(&buffer) {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(_) => return 0,
    };
    match hostname
        .strip_prefix("node")
        .and_then(|digits| digits.parse::<u8>().ok())
    {
        Some(ordinal) => {
            info!("host ordinal set to {ordinal}");
            ordinal
        }
        None => {
            info!("could not determine node ordinal");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmgr_common::hosts::decode_table;
    use std::net::Ipv6Addr;

    fn scratch_config(dir: &tempfile::TempDir) -> NetmgrConfig {
        NetmgrConfig {
            workdir: dir.path().join("state"),
            sysfs_net: dir.path().join("net"),
            proc_ipv6_conf: dir.path().join("conf"),
            quiesce_dir: dir.path().join("quiesce"),
            fault_dir: dir.path().join("fault"),
            run_dir: dir.path().join("run"),
            private_link: Some("priv0".to_string()),
            ..Default::default()
        }
    }

    fn scratch_monitor(dir: &tempfile::TempDir) -> Arc<Monitor> {
        let config = scratch_config(dir);
        fs::create_dir_all(&config.workdir).unwrap();
        fs::create_dir_all(&config.sysfs_net).unwrap();
        fs::create_dir_all(&config.quiesce_dir).unwrap();
        fs::create_dir_all(&config.fault_dir).unwrap();
        let client = NetlinkClient::connect().unwrap();
        let uuid = Uuid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        Monitor::new(config, client, uuid)
    }

    fn bridge_interface(monitor: &Monitor, index: u32, name: &str, mac: [u8; 6]) -> Arc<Interface> {
        // a directory with a bridge/ subdir classifies the name as a bridge
        fs::create_dir_all(monitor.platform().sysfs_net_root().join(name).join("bridge")).unwrap();
        let snapshot = LinkSnapshot {
            index,
            name: Some(name.to_string()),
            mac: Some(MacAddr(mac)),
            ..Default::default()
        };
        let interface = Arc::new(Interface::from_snapshot(
            &snapshot,
            name.to_string(),
            monitor.platform().clone(),
            &monitor.config,
        ));
        monitor
            .interfaces
            .write()
            .unwrap()
            .insert(index, Arc::clone(&interface));
        interface
    }

    fn private_interface(monitor: &Monitor, index: u32) -> Arc<Interface> {
        fs::create_dir_all(monitor.platform().sysfs_net_root().join("priv0")).unwrap();
        let snapshot = LinkSnapshot {
            index,
            name: Some("priv0".to_string()),
            mac: Some(MacAddr([0x00, 0x13, 0x72, 0x4b, 0x05, 0x41])),
            ..Default::default()
        };
        let interface = Arc::new(Interface::from_snapshot(
            &snapshot,
            "priv0".to_string(),
            monitor.platform().clone(),
            &monitor.config,
        ));
        monitor
            .interfaces
            .write()
            .unwrap()
            .insert(index, Arc::clone(&interface));
        interface
    }

    #[tokio::test]
    async fn test_hosts_snapshot_for_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        monitor.update_hosts();

        let image = fs::read(monitor.config.workdir.join("hosts")).unwrap();
        assert_eq!(image.len(), HOST_TABLE_SIZE);
        let entries = decode_table(&image).unwrap();
        assert_eq!(entries.len(), 1);

        let own = &entries[0];
        assert!(own.valid);
        assert!(!own.partner);
        assert_eq!(own.node_uuid, monitor.uuid());
        assert_eq!(
            own.primary_address,
            "fe80::ff:fe00:aa".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(own.interface_ordinal, 0);
        assert_eq!(own.node_ordinal, monitor.host_ordinal);
        assert_eq!(own.mac, MacAddr([0x02, 0, 0, 0, 0, 0xaa]));
    }

    #[tokio::test]
    async fn test_hosts_snapshot_includes_partner_peers() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        let bridge = bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        let partner_uuid = Uuid::parse("99999999-8888-7777-6666-555555555555").unwrap();
        let sender: Ipv6Addr = "fe80::203:4ff:fe05:6a7b".parse().unwrap();
        monitor.heartbeat_received(&bridge, sender, partner_uuid);
        let node_id = monitor.nodes().find(partner_uuid).unwrap();
        monitor.nodes().make_partner(node_id);

        monitor.update_hosts();

        let image = fs::read(monitor.config.workdir.join("hosts")).unwrap();
        let entries = decode_table(&image).unwrap();
        assert_eq!(entries.len(), 2);
        let peer_entry = entries
            .iter()
            .find(|e| e.node_uuid == partner_uuid)
            .unwrap();
        assert_eq!(peer_entry.primary_address, sender);
        assert_eq!(peer_entry.interface_ordinal, 0);
        assert!(!peer_entry.partner); // the peer itself never became one
    }

    #[tokio::test]
    async fn test_hosts_excludes_interfaces_without_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        // a bridge whose name carries no numeric suffix has no ordinal
        bridge_interface(&monitor, 5, "backbone", [0x02, 0, 0, 0, 0, 0xdd]);

        monitor.update_hosts();

        let image = fs::read(monitor.config.workdir.join("hosts")).unwrap();
        assert!(decode_table(&image).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hosts_rotation_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        monitor.update_hosts();
        let first = fs::read(monitor.config.workdir.join("hosts")).unwrap();

        bridge_interface(&monitor, 4, "biz1", [0x02, 0, 0, 0, 0, 0xbb]);
        monitor.update_hosts();

        let second = fs::read(monitor.config.workdir.join("hosts")).unwrap();
        let previous = fs::read(monitor.config.workdir.join("hosts.1")).unwrap();
        assert_eq!(previous, first);
        assert_ne!(second, first);
        assert!(!monitor.config.workdir.join("hosts.tmp").exists());
    }

    #[tokio::test]
    async fn test_heartbeat_on_private_link_discovers_partner() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        let private = private_interface(&monitor, 7);

        let partner_uuid = Uuid::parse("99999999-8888-7777-6666-555555555555").unwrap();
        let sender: Ipv6Addr = "fe80::203:4ff:fe05:6a7b".parse().unwrap();
        monitor.heartbeat_received(&private, sender, partner_uuid);

        let node_id = monitor.nodes().find(partner_uuid).unwrap();
        assert!(monitor.nodes().is_partner(node_id));

        let peer_id = private.neighbors().find(sender).unwrap();
        let peer = private.neighbors().get(peer_id).unwrap();
        assert_eq!(peer.node(), Some(node_id));
        assert!(peer.is_partner());
        assert!(peer.is_private());

        let cache = fs::read_to_string(monitor.config.workdir.join("partner-cache")).unwrap();
        assert_eq!(cache, format!("{partner_uuid}\n"));

        assert!(monitor.take_topology_change());
        assert!(!monitor.take_topology_change());

        // a second heartbeat changes nothing and raises no new notification
        monitor.heartbeat_received(&private, sender, partner_uuid);
        assert!(!monitor.take_topology_change());
    }

    #[tokio::test]
    async fn test_removed_interface_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        let bridge = bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        let partner_uuid = Uuid::parse("99999999-8888-7777-6666-555555555555").unwrap();
        let sender: Ipv6Addr = "fe80::203:4ff:fe05:6a7b".parse().unwrap();
        monitor.heartbeat_received(&bridge, sender, partner_uuid);

        let removal = LinkSnapshot {
            index: 3,
            name: Some("biz0".to_string()),
            change_mask: 0xffff_ffff,
            ..Default::default()
        };
        monitor.handle_del_link(removal);

        assert!(bridge.removed());
        // neighbors were invalidated with the interface
        assert!(bridge.neighbors().find(sender).is_none());
        // sends have become no-ops
        assert!(!bridge.advertise(monitor.nodes()));
        // and the hosts file no longer carries it
        monitor.update_hosts();
        let image = fs::read(monitor.config.workdir.join("hosts")).unwrap();
        assert!(decode_table(&image).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_skipped_under_fault_injection() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        fs::create_dir_all(monitor.platform().sysfs_net_root().join("ibiz0")).unwrap();
        fs::write(dir.path().join("fault").join("ibiz0.fault"), "").unwrap();

        let snapshot = LinkSnapshot {
            index: 9,
            name: Some("ibiz0".to_string()),
            mac: Some(MacAddr([0x02, 0, 0, 0, 0, 0xcc])),
            ..Default::default()
        };
        let interface = Arc::new(Interface::from_snapshot(
            &snapshot,
            "ibiz0".to_string(),
            monitor.platform().clone(),
            &monitor.config,
        ));

        // returns without touching any bridge state
        monitor.capture(&interface).await;
        assert!(!monitor.platform().is_bridge("biz0"));
    }

    #[tokio::test]
    async fn test_tunnel_registration() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        fs::create_dir_all(dir.path().join("run")).unwrap();

        monitor.set_tunnel("ibiz0", 0, true);
        // no daemon running: the decision is an endpoint start, no state
        // changes locally
        monitor.maintain_tunnels();

        // re-registration only flips the wanted bit
        monitor.set_tunnel("ibiz0", 0, false);
        assert_eq!(monitor.tunnels.lock().unwrap().len(), 1);
        monitor.maintain_tunnels();
    }

    #[tokio::test]
    async fn test_find_bridge_interface() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        let bridge = bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        // a captured physical port of biz0
        let net = monitor.platform().sysfs_net_root().to_path_buf();
        fs::create_dir_all(net.join("ibiz0").join("device")).unwrap();
        fs::create_dir_all(net.join("ibiz0").join("brport")).unwrap();
        fs::create_dir_all(net.join("biz0").join("brif").join("ibiz0")).unwrap();

        let snapshot = LinkSnapshot {
            index: 9,
            name: Some("ibiz0".to_string()),
            mac: Some(MacAddr([0x02, 0, 0, 0, 0, 0xcc])),
            ..Default::default()
        };
        let port = Arc::new(Interface::from_snapshot(
            &snapshot,
            "ibiz0".to_string(),
            monitor.platform().clone(),
            &monitor.config,
        ));
        monitor
            .interfaces
            .write()
            .unwrap()
            .insert(9, Arc::clone(&port));

        let found = monitor.find_bridge_interface(&port).unwrap();
        assert_eq!(found.index(), bridge.index());
        // the bridge itself is not captured by anything
        assert!(monitor.find_bridge_interface(&bridge).is_none());
    }

    #[tokio::test]
    async fn test_address_events_ignore_other_families() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = scratch_monitor(&dir);
        bridge_interface(&monitor, 3, "biz0", [0x02, 0, 0, 0, 0, 0xaa]);

        // IPv4 removal must not trigger a repair request
        monitor
            .handle_del_address(AddressEvent {
                index: 3,
                family: LinkFamily::Inet,
                address: Some("10.0.0.1".parse().unwrap()),
                prefix_len: 24,
            })
            .await;

        // secondary IPv6 removal is ignored as well
        monitor
            .handle_del_address(AddressEvent {
                index: 3,
                family: LinkFamily::Inet6,
                address: Some("fe80::dead".parse().unwrap()),
                prefix_len: 64,
            })
            .await;
    }
}
