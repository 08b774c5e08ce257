//! Cluster node identity store.
//!
//! Known cluster members are canonicalized here: every UUID observed on any
//! interface is interned into a fixed-capacity slot table, and peers hold
//! stable slot ids back into it. A single mutex guards the whole table; the
//! hot path is short linear scans over at most a handful of valid entries.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, error, info, warn};

use netmgr_common::types::ORDINAL_UNASSIGNED;
use netmgr_common::uuid::Uuid;

/// Capacity of the node table.
pub const NODE_TABLE_SIZE: usize = 4096;

/// A cluster is expected to stay tiny; exceeding this many live entries is
/// reported once as a sign that something is spraying identities.
const TABLE_REPORT_THRESHOLD: usize = 256;

/// One known cluster member.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    uuid: Uuid,
    ordinal: u8,
    partner: bool,
    valid: bool,
}

impl Node {
    fn empty() -> Self {
        Node {
            uuid: Uuid::NIL,
            ordinal: ORDINAL_UNASSIGNED,
            partner: false,
            valid: false,
        }
    }

    fn assign(&mut self, uuid: Uuid) {
        self.uuid = uuid;
        self.ordinal = ORDINAL_UNASSIGNED;
        self.partner = false;
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.partner = false;
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn set_ordinal(&mut self, ordinal: u8) {
        self.ordinal = ordinal;
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

    pub fn clear_partner(&mut self) {
        self.partner = false;
    }
}

/// Stable handle to a node slot. Valid for the lifetime of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[cfg(test)]
impl NodeId {
    pub(crate) fn test_id(index: usize) -> Self {
        NodeId(index)
    }
}

struct TableState {
    nodes: Vec<Node>,
    warning_reported: bool,
    error_reported: bool,
}

/// The process-wide table of known nodes.
pub struct NodeStore {
    state: Mutex<TableState>,
    partner_cache: PathBuf,
}

impl NodeStore {
    /// Create an empty store persisting its partner mark to `partner_cache`.
    pub fn new(partner_cache: PathBuf) -> Self {
        NodeStore {
            state: Mutex::new(TableState {
                nodes: vec![Node::empty(); NODE_TABLE_SIZE],
                warning_reported: false,
                error_reported: false,
            }),
            partner_cache,
        }
    }

    /// Find or create the node for `uuid`. Returns `None` only when the
    /// table is full, which is reported once per process lifetime.
    pub fn intern(&self, uuid: Uuid) -> Option<NodeId> {
        let mut state = self.state.lock().unwrap();

        let mut in_use = 0;
        let mut available = None;
        let mut found = None;
        for (i, node) in state.nodes.iter().enumerate() {
            if !node.valid {
                if available.is_none() {
                    available = Some(i);
                }
                continue;
            }
            in_use += 1;
            if node.uuid == uuid {
                found = Some(i);
                break;
            }
        }

        if in_use > TABLE_REPORT_THRESHOLD && !state.warning_reported {
            warn!("WARNING: node table exceeds {TABLE_REPORT_THRESHOLD} entries");
            state.warning_reported = true;
        }

        if let Some(i) = found {
            return Some(NodeId(i));
        }

        match available {
            Some(i) => {
                state.nodes[i].assign(uuid);
                Some(NodeId(i))
            }
            None => {
                if !state.error_reported {
                    error!("ERROR: node table is full");
                    state.error_reported = true;
                }
                None
            }
        }
    }

    /// Look up the valid node for `uuid`.
    pub fn find(&self, uuid: Uuid) -> Option<NodeId> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .position(|n| n.valid && n.uuid == uuid)
            .map(NodeId)
    }

    /// Invalidate every node matching `uuid`.
    pub fn remove(&self, uuid: Uuid) -> bool {
        let mut state = self.state.lock().unwrap();
        for node in state.nodes.iter_mut() {
            if node.valid && node.uuid == uuid {
                node.invalidate();
            }
        }
        true
    }

    /// Copy out the node behind a handle, if still valid.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        let state = self.state.lock().unwrap();
        let node = state.nodes.get(id.0)?;
        if node.valid {
            Some(*node)
        } else {
            None
        }
    }

    /// Run `f` against the node behind a handle, if still valid.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.get_mut(id.0)?;
        if node.valid {
            Some(f(node))
        } else {
            None
        }
    }

    /// Visit every valid node under the table lock.
    pub fn each_node(&self, mut f: impl FnMut(&Node)) {
        let state = self.state.lock().unwrap();
        for node in state.nodes.iter().filter(|n| n.valid) {
            f(node);
        }
    }

    /// True if the node behind `id` is currently marked partner.
    pub fn is_partner(&self, id: NodeId) -> bool {
        self.get(id).map(|n| n.is_partner()).unwrap_or(false)
    }

    /// Mark the node behind `id` as the partner. Returns true when the mark
    /// was newly set.
    pub fn make_partner(&self, id: NodeId) -> bool {
        self.with_node(id, |node| {
            if node.is_partner() {
                false
            } else {
                node.make_partner();
                true
            }
        })
        .unwrap_or(false)
    }

    /// Clear the partner mark everywhere, returning how many were cleared.
    pub fn clear_partners(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut cleared = 0;
        for node in state.nodes.iter_mut().filter(|n| n.valid && n.partner) {
            info!("clear partner [{}]", node.uuid);
            node.clear_partner();
            cleared += 1;
        }
        cleared
    }

    /// Persist the partner mark. The cache holds exactly one UUID; finding
    /// more than one partner in the table is a bug worth shouting about.
    pub fn save_partner_cache(&self) {
        let mut partners = Vec::new();
        self.each_node(|node| {
            if node.is_partner() {
                partners.push(node.uuid());
            }
        });

        let tmp = self.partner_cache.with_extension("tmp");
        let write = |uuid: Option<&Uuid>| -> std::io::Result<()> {
            let contents = match uuid {
                Some(uuid) => format!("{uuid}\n"),
                None => String::new(),
            };
            fs::write(&tmp, contents)?;
            fs::rename(&tmp, &self.partner_cache)
        };

        if let Err(err) = write(partners.first()) {
            info!("could not save partner cache: {err}");
            return;
        }
        if let Some(uuid) = partners.first() {
            debug!("save partner [{uuid}]");
        }
        if partners.len() > 1 {
            error!("%BUG multiple partner entries in node table");
        }
    }

    /// Load the previously discovered partner, if any. A malformed cache
    /// leaves the store without partners.
    pub fn load_partner_cache(&self) {
        let contents = match fs::read_to_string(&self.partner_cache) {
            Ok(contents) => contents,
            Err(_) => {
                info!("partner cache not present");
                return;
            }
        };

        let cleared = self.clear_partners();
        if cleared > 0 {
            info!("cleared {cleared} partners");
        }

        let uuid = match Uuid::parse(&contents) {
            Ok(uuid) => uuid,
            Err(_) => {
                warn!("malformed partner cache, ignoring");
                return;
            }
        };

        info!("loaded partner as [{uuid}]");
        if let Some(id) = self.intern(uuid) {
            self.make_partner(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, NodeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().join("partner-cache"));
        (dir, store)
    }

    fn uuid(n: u8) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        bytes[0] = 0x10;
        Uuid::from_bytes(bytes)
    }

    #[test]
    fn test_intern_is_idempotent() {
        let (_dir, store) = store();
        let a = store.intern(uuid(1)).unwrap();
        let b = store.intern(uuid(1)).unwrap();
        assert_eq!(a, b);

        let mut count = 0;
        store.each_node(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_find_and_remove() {
        let (_dir, store) = store();
        let id = store.intern(uuid(1)).unwrap();
        assert_eq!(store.find(uuid(1)), Some(id));

        assert!(store.remove(uuid(1)));
        assert_eq!(store.find(uuid(1)), None);
        assert!(store.get(id).is_none());
    }

    #[test]
    fn test_invalidate_clears_partner() {
        let (_dir, store) = store();
        let id = store.intern(uuid(1)).unwrap();
        store.make_partner(id);
        assert!(store.is_partner(id));

        store.remove(uuid(1));
        let id = store.intern(uuid(1)).unwrap();
        assert!(!store.is_partner(id));
    }

    #[test]
    fn test_table_capacity() {
        let (_dir, store) = store();
        for i in 0..NODE_TABLE_SIZE {
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
            bytes[15] = 1;
            assert!(store.intern(Uuid::from_bytes(bytes)).is_some(), "slot {i}");
        }
        let mut bytes = [0xffu8; 16];
        bytes[0] = 0xfe;
        assert!(store.intern(Uuid::from_bytes(bytes)).is_none());
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let (_dir, store) = store();
        let a = store.intern(uuid(1)).unwrap();
        store.remove(uuid(1));
        let b = store.intern(uuid(2)).unwrap();
        // first free slot is claimed again
        assert_eq!(a, b);
        assert_eq!(store.get(b).unwrap().uuid(), uuid(2));
    }

    #[test]
    fn test_partner_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("partner-cache");

        let store = NodeStore::new(cache.clone());
        let id = store.intern(uuid(9)).unwrap();
        store.make_partner(id);
        store.save_partner_cache();

        let contents = fs::read_to_string(&cache).unwrap();
        assert_eq!(contents, format!("{}\n", uuid(9)));

        let fresh = NodeStore::new(cache);
        fresh.load_partner_cache();
        let id = fresh.find(uuid(9)).unwrap();
        assert!(fresh.is_partner(id));
    }

    #[test]
    fn test_malformed_partner_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("partner-cache");
        fs::write(&cache, "this is not a uuid\n").unwrap();

        let store = NodeStore::new(cache);
        store.load_partner_cache();

        let mut partners = 0;
        store.each_node(|node| {
            if node.is_partner() {
                partners += 1;
            }
        });
        assert_eq!(partners, 0);
    }
}
