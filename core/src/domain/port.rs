//! Tracked port records and the authoritative port state store.

use std::collections::hash_map::Iter;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

// ============================================================================
// PortRecord
// ============================================================================

/// One currently-open port and what we know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    /// The port number (1-65535).
    pub port: u16,
    /// Process IDs holding the port open. Empty means "unknown".
    pub owning_pids: BTreeSet<u32>,
    /// When the port was first detected open.
    pub first_seen: Instant,
    /// When the port was last observed.
    pub last_seen: Instant,
    /// Set while the port is missing from samples but still inside its grace window.
    pub pending_close_since: Option<Instant>,
}

impl PortRecord {
    /// Create a record for a port detected open at `now`.
    pub fn opened(port: u16, owning_pids: BTreeSet<u32>, now: Instant) -> Self {
        Self {
            port,
            owning_pids,
            first_seen: now,
            last_seen: now,
            pending_close_since: None,
        }
    }

    /// Mark the port as observed again at `now`, leaving any pending-close state.
    pub fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
        self.pending_close_since = None;
    }

    /// Whether the record is inside its debounce grace window.
    pub fn is_pending_close(&self) -> bool {
        self.pending_close_since.is_some()
    }

    /// Time elapsed since the port was last observed.
    pub fn unseen_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Owning PIDs as a sorted list.
    pub fn pids(&self) -> Vec<u32> {
        self.owning_pids.iter().copied().collect()
    }
}

/// Whether a raw port value is a valid observation.
pub fn is_valid_port(port: i64) -> bool {
    (1..=i64::from(u16::MAX)).contains(&port)
}

// ============================================================================
// PortStateStore
// ============================================================================

/// Mapping of every port currently believed open to its record.
///
/// A key is present iff the port is believed open, including ports in their
/// pending-close grace window. Reads are public; mutation is reserved to the
/// reconciliation engine within this crate.
#[derive(Debug, Default)]
pub struct PortStateStore {
    records: HashMap<u16, PortRecord>,
}

impl PortStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record for a port.
    pub fn get(&self, port: u16) -> Option<&PortRecord> {
        self.records.get(&port)
    }

    /// Whether the port is currently believed open.
    pub fn contains(&self, port: u16) -> bool {
        self.records.contains_key(&port)
    }

    /// Number of tracked ports.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no port is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over all tracked records.
    pub fn iter(&self) -> Iter<'_, u16, PortRecord> {
        self.records.iter()
    }

    /// All tracked port numbers, sorted.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.records.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub(crate) fn get_mut(&mut self, port: u16) -> Option<&mut PortRecord> {
        self.records.get_mut(&port)
    }

    pub(crate) fn put(&mut self, record: PortRecord) -> Option<PortRecord> {
        self.records.insert(record.port, record)
    }

    pub(crate) fn delete(&mut self, port: u16) -> Option<PortRecord> {
        self.records.remove(&port)
    }
}
