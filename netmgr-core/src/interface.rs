//! Tracked network interfaces.
//!
//! An [`Interface`] is the engine's view of one kernel netdev: the flag
//! snapshot and delta from the last link message, the carrier bit as read
//! from sysfs (which overrides what the kernel event claimed), the EUI-64
//! link-local address, the neighbor table, and the two sockets the
//! listeners run on. Kernel events mutate it from the event task while the
//! reconciliation tick and the per-interface listener threads read it.

use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use netmgr_common::types::{interface_ordinal, MacAddr, ORDINAL_UNASSIGNED};
use netmgr_common::uuid::Uuid;
use netmgr_netlink::LinkSnapshot;

use crate::config::NetmgrConfig;
use crate::heartbeat::HeartbeatSocket;
use crate::icmp6::{IcmpSocket, Pdu};
use crate::node::NodeStore;
use crate::peer::NeighborTable;
use crate::platform::Platform;

pub(crate) const IFF_UP: u32 = libc::IFF_UP as u32;
pub(crate) const IFF_RUNNING: u32 = libc::IFF_RUNNING as u32;
pub(crate) const IFF_PROMISC: u32 = libc::IFF_PROMISC as u32;
pub(crate) const IFF_NOARP: u32 = libc::IFF_NOARP as u32;
pub(crate) const IFF_LOOPBACK: u32 = libc::IFF_LOOPBACK as u32;
pub(crate) const IFF_MULTICAST: u32 = libc::IFF_MULTICAST as u32;
// not exposed through net/if.h everywhere, from linux/if.h
pub(crate) const IFF_LOWER_UP: u32 = 1 << 16;
pub(crate) const IFF_DORMANT: u32 = 1 << 17;

const NO_PEER_REPORT_INTERVAL: Duration = Duration::from_secs(120);
const SEND_ERROR_REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// Bind retry backoff: start here, grow by the same step each failure.
const BIND_RETRY_STEP: Duration = Duration::from_secs(5);

/// Link-bounce pacing parameters.
#[derive(Debug, Clone)]
pub struct BounceConfig {
    pub interval: Duration,
    pub attempts: u32,
    pub reattempt: Duration,
}

impl BounceConfig {
    pub fn from_config(config: &NetmgrConfig) -> Self {
        BounceConfig {
            interval: Duration::from_secs(config.link_bounce_interval),
            attempts: config.link_bounce_attempts,
            reattempt: Duration::from_secs(config.link_bounce_reattempt),
        }
    }
}

/// Bounce bookkeeping. Once the attempt budget is spent, bouncing pauses
/// for the reattempt window, then the budget refills.
#[derive(Debug, Default)]
pub struct BounceState {
    attempts: u32,
    last_bounce: Option<Instant>,
    last_reattempt: Option<Instant>,
}

impl BounceState {
    pub fn expired_at(&mut self, now: Instant, config: &BounceConfig) -> bool {
        if self.attempts >= config.attempts {
            match self.last_reattempt {
                Some(t) if now.duration_since(t) < config.reattempt => false,
                _ => {
                    self.attempts = 0;
                    true
                }
            }
        } else {
            match self.last_bounce {
                Some(t) => now.duration_since(t) >= config.interval,
                None => true,
            }
        }
    }

    pub fn record_bounce_at(&mut self, now: Instant, config: &BounceConfig) {
        self.last_bounce = Some(now);
        self.attempts += 1;
        if self.attempts >= config.attempts {
            self.last_reattempt = Some(now);
        }
    }
}

/// Flag snapshot and delta tracking for one interface.
#[derive(Debug, Clone)]
pub struct LinkState {
    netlink_flags: u32,
    netlink_change: u32,
    last_flags: u32,
    last_processed_flags: u32,
    changed: u32,
    current_carrier: bool,
    previous_carrier: bool,
    unknown_carrier: bool,
}

impl LinkState {
    fn new() -> Self {
        LinkState {
            netlink_flags: 0,
            netlink_change: 0,
            last_flags: 0,
            last_processed_flags: 0,
            changed: 0,
            current_carrier: false,
            previous_carrier: false,
            unknown_carrier: true,
        }
    }

    /// Fold one kernel flag report into the snapshot. The kernel's LOWER_UP
    /// claim is not trusted; the carrier bit read from sysfs wins.
    pub fn apply(&mut self, flags: u32, change: u32, carrier: bool) {
        self.netlink_flags = flags;
        self.netlink_change = change;
        self.changed = (self.last_processed_flags ^ flags) | change;

        self.current_carrier = carrier;
        if self.unknown_carrier {
            self.previous_carrier = !carrier;
        }
        if self.previous_carrier != self.current_carrier {
            self.changed |= IFF_LOWER_UP;
            if carrier {
                self.netlink_flags |= IFF_LOWER_UP;
            } else {
                self.netlink_flags &= !IFF_LOWER_UP;
            }
            self.previous_carrier = carrier;
        }

        self.last_flags = self.netlink_flags;
    }

    /// Stamp the current report as processed (the synthetic link up/down
    /// event has been emitted).
    pub fn mark_processed(&mut self) {
        self.last_processed_flags = self.netlink_flags;
        self.previous_carrier = self.current_carrier;
        self.unknown_carrier = false;
    }

    pub fn is_up(&self) -> bool {
        self.last_flags & IFF_UP != 0
    }

    pub fn has_link(&self) -> bool {
        self.last_flags & IFF_LOWER_UP != 0
    }

    pub fn is_running(&self) -> bool {
        self.last_flags & IFF_RUNNING != 0
    }

    pub fn is_promiscuous(&self) -> bool {
        self.last_flags & IFF_PROMISC != 0
    }

    pub fn is_dormant(&self) -> bool {
        self.last_flags & IFF_DORMANT != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.last_flags & IFF_LOOPBACK != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.last_flags & IFF_MULTICAST != 0
    }

    pub fn up_changed(&self) -> bool {
        self.changed & IFF_UP != 0
    }

    pub fn link_changed(&self) -> bool {
        self.changed & IFF_LOWER_UP != 0
    }

    pub fn running_changed(&self) -> bool {
        self.changed & IFF_RUNNING != 0
    }

    pub fn promiscuity_changed(&self) -> bool {
        self.changed & IFF_PROMISC != 0
    }

    pub fn dormancy_changed(&self) -> bool {
        self.changed & IFF_DORMANT != 0
    }

    pub fn interesting_change(&self) -> bool {
        self.changed & !IFF_NOARP != 0
    }
}

/// One tracked kernel interface.
pub struct Interface {
    index: u32,
    name: String,
    mac: MacAddr,
    primary_address: Ipv6Addr,
    ordinal: u8,
    no_ordinal: bool,
    link_type: u16,
    designated_private: bool,
    link: Mutex<LinkState>,
    bounce: Mutex<BounceState>,
    bounce_config: BounceConfig,
    neighbors: NeighborTable,
    icmp: OnceLock<IcmpSocket>,
    outbound: OnceLock<HeartbeatSocket>,
    removed: AtomicBool,
    advertise_errors: AtomicU32,
    last_no_peer_report: Mutex<Option<Instant>>,
    last_send_error_report: Mutex<Option<Instant>>,
    platform: Platform,
}

impl Interface {
    /// Build the interface object for a first-seen link.
    pub fn from_snapshot(
        snapshot: &LinkSnapshot,
        name: String,
        platform: Platform,
        config: &NetmgrConfig,
    ) -> Interface {
        let mac = snapshot
            .mac
            .filter(|m| !m.is_zero())
            .or_else(|| platform.mac_address(&name))
            .unwrap_or_default();
        let primary_address = mac.link_local();

        let (ordinal, no_ordinal) = match interface_ordinal(&name) {
            Some(ordinal) => {
                info!("interface {name} ordinal is {ordinal}");
                (ordinal, false)
            }
            None => {
                info!("could not parse interface name '{name}'");
                (ORDINAL_UNASSIGNED, true)
            }
        };

        let designated_private = config.private_link.as_deref() == Some(name.as_str());
        let label = format!("{name}({})", snapshot.index);

        Interface {
            index: snapshot.index,
            name,
            mac,
            primary_address,
            ordinal,
            no_ordinal,
            link_type: snapshot.link_type,
            designated_private,
            link: Mutex::new(LinkState::new()),
            bounce: Mutex::new(BounceState::default()),
            bounce_config: BounceConfig::from_config(config),
            neighbors: NeighborTable::new(label),
            icmp: OnceLock::new(),
            outbound: OnceLock::new(),
            removed: AtomicBool::new(false),
            advertise_errors: AtomicU32::new(0),
            last_no_peer_report: Mutex::new(None),
            last_send_error_report: Mutex::new(None),
            platform,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn primary_address(&self) -> Ipv6Addr {
        self.primary_address
    }

    pub fn is_primary(&self, address: &Ipv6Addr) -> bool {
        *address == self.primary_address
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn no_ordinal(&self) -> bool {
        self.no_ordinal
    }

    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// `name(index)`, the identifier used in log lines.
    pub fn label(&self) -> String {
        format!("{}({})", self.name, self.index)
    }

    // ---- kernel flag state --------------------------------------------

    /// Fold a link message into the flag snapshot, reading the carrier bit
    /// from sysfs rather than trusting the event.
    pub fn update(&self, snapshot: &LinkSnapshot) {
        let carrier = self.carrier();
        let mut link = self.link.lock().unwrap();
        let last_flags = link.last_flags;
        let last_processed = link.last_processed_flags;
        link.apply(snapshot.flags, snapshot.change_mask, carrier);
        if link.interesting_change() {
            info!(
                "{} <{}> Flags: last/processed=0x{:08x}/0x{:08x} => new=0x{:08x} (changed=0x{:08x})",
                self.label(),
                snapshot.family,
                last_flags,
                last_processed,
                link.netlink_flags,
                link.changed,
            );
        }
    }

    /// Synthetic link-up event: stamp the report processed.
    pub fn link_up(&self) {
        debug!("{}: link up", self.label());
        self.link.lock().unwrap().mark_processed();
    }

    /// Synthetic link-down event: stamp the report processed.
    pub fn link_down(&self) {
        debug!("{}: link down", self.label());
        self.link.lock().unwrap().mark_processed();
    }

    pub fn link_state(&self) -> LinkState {
        self.link.lock().unwrap().clone()
    }

    pub fn is_up(&self) -> bool {
        self.link.lock().unwrap().is_up()
    }

    pub fn has_link(&self) -> bool {
        self.link.lock().unwrap().has_link()
    }

    // ---- platform-derived state ---------------------------------------

    /// Current sysfs carrier bit. Reads as "no carrier" when the interface
    /// is gone.
    pub fn carrier(&self) -> bool {
        self.platform.carrier(&self.name).unwrap_or(false)
    }

    pub fn exists(&self) -> bool {
        self.platform.exists(&self.name)
    }

    pub fn is_physical(&self) -> bool {
        self.platform.is_physical(&self.name)
    }

    pub fn is_bridge(&self) -> bool {
        self.platform.is_bridge(&self.name)
    }

    pub fn is_captured(&self) -> bool {
        self.platform.is_captured(&self.name)
    }

    pub fn is_private(&self) -> bool {
        self.designated_private
    }

    pub fn is_sync(&self) -> bool {
        self.name.starts_with("sync")
    }

    pub fn is_quiesced(&self) -> bool {
        self.platform.is_quiesced(&self.name)
    }

    pub fn has_fault_injected(&self) -> bool {
        self.platform.has_fault_injected(&self.name)
    }

    pub fn accept_ra(&self) -> Option<bool> {
        self.platform.accept_ra(&self.name)
    }

    pub fn set_accept_ra(&self, value: bool) {
        self.platform.set_accept_ra(&self.name, value)
    }

    // ---- bounce pacing -------------------------------------------------

    pub fn bounce_expired(&self) -> bool {
        self.bounce
            .lock()
            .unwrap()
            .expired_at(Instant::now(), &self.bounce_config)
    }

    pub fn record_bounce(&self) {
        self.bounce
            .lock()
            .unwrap()
            .record_bounce_at(Instant::now(), &self.bounce_config)
    }

    // ---- sockets and listeners ----------------------------------------

    /// Open the outbound heartbeat socket and the raw ICMPv6 socket.
    pub fn create_sockets(&self) -> io::Result<()> {
        if self.outbound.get().is_none() {
            let outbound = HeartbeatSocket::outbound(self.index)?;
            let _ = self.outbound.set(outbound);
            info!("created outbound socket for '{}'", self.name);
        }
        if self.icmp.get().is_none() {
            let icmp = IcmpSocket::open()?;
            let _ = self.icmp.set(icmp);
        }
        Ok(())
    }

    /// The interface's ICMPv6 socket, bound. Retries the bind with a
    /// growing backoff and gives up only when the interface is removed.
    /// Blocks; only the per-interface listener thread calls this.
    pub fn icmp_socket(&self) -> Option<&IcmpSocket> {
        let icmp = self.icmp.get()?;
        if icmp.bound() {
            return Some(icmp);
        }

        let mut delay = BIND_RETRY_STEP;
        while !icmp.bind(self.primary_address, self.index) {
            warn!("{}: could not bind ICMPv6 socket", self.label());
            if self.removed() {
                return None;
            }
            std::thread::sleep(delay);
            delay += BIND_RETRY_STEP;
            if self.removed() {
                return None;
            }
        }
        Some(icmp)
    }

    /// Send the periodic Neighbor Advertisement to each known partner peer.
    ///
    /// Unicast per peer rather than multicast: the neighbor-discovery code
    /// on the receiving side only refreshes its cache for solicited-style
    /// unicast advertisements, and the peer set is tiny anyway.
    pub fn advertise(&self, nodes: &NodeStore) -> bool {
        if self.removed() {
            return false;
        }
        let Some(icmp) = self.icmp.get() else {
            return false;
        };

        if !icmp.bound() {
            debug!("advertise: binding ICMPv6 socket for '{}'", self.name);
            if !icmp.bind(self.primary_address, self.index) {
                debug!("advertise: ICMPv6 bind for '{}' failed", self.name);
                return false;
            }
        }

        let na = Pdu::advertisement(self.primary_address, self.mac);
        let mut peers_sent = 0u32;
        self.neighbors.each_peer_mut(|peer| {
            let Some(node_id) = peer.node() else {
                return;
            };
            if !nodes.is_partner(node_id) {
                return;
            }

            if icmp.send(peer.address(), &na) {
                self.advertise_errors.store(0, Ordering::Relaxed);
                peer.touch_advertised();
            } else {
                let errors = self.advertise_errors.fetch_add(1, Ordering::Relaxed);
                if errors == 0 {
                    warn!("failed to send neighbor advertisement out '{}'", self.name);
                }
            }
            peers_sent += 1;
        });

        if peers_sent == 0 {
            let mut last = self.last_no_peer_report.lock().unwrap();
            let due = last
                .map(|t| t.elapsed() > NO_PEER_REPORT_INTERVAL)
                .unwrap_or(true);
            if due {
                warn!("no peers found on {}", self.name);
                *last = Some(Instant::now());
            }
        }

        true
    }

    /// Best-effort heartbeat send.
    pub fn send_heartbeat(&self, uuid: &Uuid) {
        if self.removed() {
            return;
        }
        let Some(outbound) = self.outbound.get() else {
            debug!("{} has no outbound socket", self.label());
            return;
        };
        if let Err(err) = outbound.send(uuid) {
            let mut last = self.last_send_error_report.lock().unwrap();
            let due = last
                .map(|t| t.elapsed() > SEND_ERROR_REPORT_INTERVAL)
                .unwrap_or(true);
            if due {
                warn!("{} heartbeat send failed: {err}", self.label());
                *last = Some(Instant::now());
            }
        }
    }

    // ---- teardown ------------------------------------------------------

    /// Mark the interface removed. Sends become no-ops, the listener
    /// threads exit at their next timeout, and the neighbor table is
    /// invalidated.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.neighbors.invalidate_all();
    }

    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounce_config() -> BounceConfig {
        BounceConfig {
            interval: Duration::from_secs(1200),
            attempts: 2,
            reattempt: Duration::from_secs(1200),
        }
    }

    #[test]
    fn test_bounce_pacing() {
        let config = bounce_config();
        let mut state = BounceState::default();
        let t0 = Instant::now();
        let t = |s: u64| t0 + Duration::from_secs(s);

        // never bounced: expired immediately
        assert!(state.expired_at(t(0), &config));
        state.record_bounce_at(t(0), &config);

        // within the interval
        assert!(!state.expired_at(t(100), &config));
        assert!(state.expired_at(t(1200), &config));
        state.record_bounce_at(t(1200), &config);

        // budget spent at the second bounce: wait out the reattempt window
        assert!(!state.expired_at(t(1300), &config));
        assert!(!state.expired_at(t(2399), &config));

        // window over: budget refills
        assert!(state.expired_at(t(2400), &config));
        state.record_bounce_at(t(2400), &config);
        assert!(!state.expired_at(t(2500), &config));
    }

    #[test]
    fn test_link_state_flag_delta() {
        let mut state = LinkState::new();
        state.apply(IFF_UP | IFF_RUNNING, 0, true);

        assert!(state.is_up());
        assert!(state.is_running());
        assert!(state.has_link());
        // everything differs from the never-processed snapshot
        assert!(state.up_changed());
        assert!(state.link_changed());
        state.mark_processed();

        // same flags again: nothing changed
        state.apply(IFF_UP | IFF_RUNNING | IFF_LOWER_UP, 0, true);
        assert!(!state.up_changed());
        assert!(!state.link_changed());
        assert!(!state.interesting_change());
    }

    #[test]
    fn test_carrier_overrides_kernel_claim() {
        let mut state = LinkState::new();
        state.apply(IFF_UP | IFF_RUNNING, 0, true);
        state.mark_processed();

        // the kernel still claims LOWER_UP but sysfs says the carrier died
        state.apply(IFF_UP | IFF_RUNNING | IFF_LOWER_UP, 0, false);
        assert!(state.link_changed());
        assert!(!state.has_link());
    }

    #[test]
    fn test_change_mask_forces_processing() {
        let mut state = LinkState::new();
        state.apply(IFF_UP, 0, false);
        state.mark_processed();

        state.apply(IFF_UP, IFF_PROMISC, false);
        assert!(state.promiscuity_changed());
        assert!(!state.is_promiscuous());
    }
}
