//! Peers seen on an interface.
//!
//! Each interface keeps a fixed-capacity table of the link-local neighbors
//! observed on its link. A peer starts as a bare address and is linked to a
//! node once a heartbeat reveals its identity. Slots are stable: handles
//! stay meaningful for the lifetime of the interface, and invalidated slots
//! keep their position until reused.

use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, error, warn};

use crate::node::NodeId;

/// Capacity of one interface's neighbor table.
pub const NEIGHBOR_TABLE_SIZE: usize = 4096;

const TABLE_REPORT_THRESHOLD: usize = 256;

/// One link-local neighbor on a specific interface.
#[derive(Debug, Clone)]
pub struct Peer {
    node: Option<NodeId>,
    address: Ipv6Addr,
    ordinal: u8,
    name: Option<String>,
    last_updated: Option<Instant>,
    last_advertised: Option<Instant>,
    valid: bool,
    partner: bool,
    is_private: bool,
    spine_notified: bool,
}

impl Peer {
    fn empty() -> Self {
        Peer {
            node: None,
            address: Ipv6Addr::UNSPECIFIED,
            ordinal: 0,
            name: None,
            last_updated: None,
            last_advertised: None,
            valid: false,
            partner: false,
            is_private: false,
            spine_notified: false,
        }
    }

    fn assign(&mut self, address: Ipv6Addr) {
        self.node = None;
        self.address = address;
        self.ordinal = 0;
        self.name = None;
        self.last_updated = None;
        self.last_advertised = None;
        self.valid = true;
        self.partner = false;
        self.is_private = false;
        self.spine_notified = false;
        debug!("new neighbor {address}");
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
        self.partner = false;
        self.node = None;
        self.spine_notified = false;
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn set_node(&mut self, node: NodeId) {
        self.node = Some(node);
    }

    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Record which kind of interface this peer was seen on.
    pub fn set_interface(&mut self, is_private: bool, ordinal: u8) {
        self.is_private = is_private;
        self.ordinal = ordinal;
    }

    pub fn set_interface_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_partner(&self) -> bool {
        self.partner
    }

    pub fn make_partner(&mut self) {
        self.partner = true;
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn has_notified_spine(&self) -> bool {
        self.spine_notified
    }

    pub fn set_spine_notified(&mut self) {
        self.spine_notified = true;
    }

    /// Stamp the last time a heartbeat or advertisement arrived from this
    /// peer.
    pub fn touch(&mut self) {
        self.last_updated = Some(Instant::now());
    }

    /// Stamp the last time we advertised to this peer.
    pub fn touch_advertised(&mut self) {
        self.last_advertised = Some(Instant::now());
    }

    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    pub fn last_advertised(&self) -> Option<Instant> {
        self.last_advertised
    }

    pub fn seconds_since_last_update(&self) -> Option<u64> {
        self.last_updated.map(|t| t.elapsed().as_secs())
    }
}

/// Stable handle to a neighbor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(usize);

struct NeighborState {
    peers: Vec<Peer>,
    warning_reported: bool,
    error_reported: bool,
}

/// Fixed-capacity neighbor table owned by one interface.
pub struct NeighborTable {
    state: Mutex<NeighborState>,
    /// `name(index)` label used in diagnostics.
    label: String,
}

impl NeighborTable {
    pub fn new(label: String) -> Self {
        NeighborTable {
            state: Mutex::new(NeighborState {
                peers: vec![Peer::empty(); NEIGHBOR_TABLE_SIZE],
                warning_reported: false,
                error_reported: false,
            }),
            label,
        }
    }

    /// Find or create the peer for `address`. The bool is true when the
    /// slot was newly claimed. `None` only when the table is full.
    pub fn intern(&self, address: Ipv6Addr) -> Option<(PeerId, bool)> {
        let mut state = self.state.lock().unwrap();

        let mut in_use = 0;
        let mut available = None;
        let mut found = None;
        for (i, peer) in state.peers.iter().enumerate() {
            if !peer.valid {
                if available.is_none() {
                    available = Some(i);
                }
                continue;
            }
            in_use += 1;
            if peer.address == address {
                found = Some(i);
                break;
            }
        }

        if in_use > TABLE_REPORT_THRESHOLD && !state.warning_reported {
            warn!(
                "WARNING: {} neighbor table exceeds {TABLE_REPORT_THRESHOLD} entries",
                self.label
            );
            state.warning_reported = true;
        }

        if let Some(i) = found {
            return Some((PeerId(i), false));
        }

        match available {
            Some(i) => {
                state.peers[i].assign(address);
                Some((PeerId(i), true))
            }
            None => {
                if !state.error_reported {
                    error!("ERROR: {} neighbor table is full", self.label);
                    state.error_reported = true;
                }
                None
            }
        }
    }

    /// Invalidate every peer matching `address`.
    pub fn remove(&self, address: Ipv6Addr) -> bool {
        let mut state = self.state.lock().unwrap();
        for peer in state.peers.iter_mut() {
            if peer.valid && peer.address == address {
                peer.invalidate();
            }
        }
        true
    }

    /// Look up the valid peer for `address`.
    pub fn find(&self, address: Ipv6Addr) -> Option<PeerId> {
        let state = self.state.lock().unwrap();
        state
            .peers
            .iter()
            .position(|p| p.valid && p.address == address)
            .map(PeerId)
    }

    /// Copy out the peer behind a handle, if still valid.
    pub fn get(&self, id: PeerId) -> Option<Peer> {
        let state = self.state.lock().unwrap();
        let peer = state.peers.get(id.0)?;
        if peer.valid {
            Some(peer.clone())
        } else {
            None
        }
    }

    /// Run `f` against the peer behind a handle, if still valid.
    ///
    /// The table lock is held for the duration of `f`; callers must not
    /// reach into the node store from inside it.
    pub fn with_peer<R>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        let peer = state.peers.get_mut(id.0)?;
        if peer.valid {
            Some(f(peer))
        } else {
            None
        }
    }

    /// Visit every valid peer under the table lock.
    pub fn each_peer(&self, mut f: impl FnMut(&Peer)) {
        let state = self.state.lock().unwrap();
        for peer in state.peers.iter().filter(|p| p.valid) {
            f(peer);
        }
    }

    /// Visit every valid peer mutably under the table lock.
    pub fn each_peer_mut(&self, mut f: impl FnMut(&mut Peer)) {
        let mut state = self.state.lock().unwrap();
        for peer in state.peers.iter_mut().filter(|p| p.valid) {
            f(peer);
        }
    }

    /// Invalidate the whole table (interface teardown).
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock().unwrap();
        for peer in state.peers.iter_mut().filter(|p| p.valid) {
            peer.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, n)
    }

    #[test]
    fn test_intern_is_idempotent() {
        let table = NeighborTable::new("biz0(3)".into());
        let (a, new_a) = table.intern(addr(1)).unwrap();
        let (b, new_b) = table.intern(addr(1)).unwrap();
        assert_eq!(a, b);
        assert!(new_a);
        assert!(!new_b);
    }

    #[test]
    fn test_remove_and_find() {
        let table = NeighborTable::new("biz0(3)".into());
        let (id, _) = table.intern(addr(1)).unwrap();
        assert_eq!(table.find(addr(1)), Some(id));

        table.remove(addr(1));
        assert_eq!(table.find(addr(1)), None);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_invalidate_clears_links() {
        let table = NeighborTable::new("biz0(3)".into());
        let (id, _) = table.intern(addr(1)).unwrap();
        table.with_peer(id, |peer| {
            peer.set_node(crate::node::NodeId::test_id(7));
            peer.make_partner();
            peer.set_spine_notified();
        });

        table.remove(addr(1));
        let (id, newly) = table.intern(addr(1)).unwrap();
        assert!(newly);
        let peer = table.get(id).unwrap();
        assert!(peer.node().is_none());
        assert!(!peer.is_partner());
        assert!(!peer.has_notified_spine());
    }

    #[test]
    fn test_table_capacity() {
        let table = NeighborTable::new("biz0(3)".into());
        for i in 0..NEIGHBOR_TABLE_SIZE {
            let address = Ipv6Addr::new(
                0xfe80,
                0,
                0,
                0,
                0,
                0,
                (i >> 16) as u16,
                (i & 0xffff) as u16,
            );
            assert!(table.intern(address).is_some(), "slot {i}");
        }
        assert!(table.intern(Ipv6Addr::new(0xfe80, 0, 0, 0, 1, 2, 3, 4)).is_none());
    }

    #[test]
    fn test_each_peer_visits_valid_only() {
        let table = NeighborTable::new("biz0(3)".into());
        table.intern(addr(1)).unwrap();
        table.intern(addr(2)).unwrap();
        table.remove(addr(1));

        let mut seen = Vec::new();
        table.each_peer(|peer| seen.push(peer.address()));
        assert_eq!(seen, vec![addr(2)]);
    }
}
