//! Port allocation for per-session backend servers
//!
//! Each session gets its own TCP port drawn from a configured range. The
//! registry is shared mutable state across all session-creation calls, so
//! allocation and release go through one mutex. Ports are tracked keyed by
//! session id, which lets the sweep free ports whose store record has
//! already vanished (e.g. retired by the store's own TTL).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;

use crate::error::SessionError;

/// Inclusive port range to allocate from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn len(&self) -> usize {
        (self.max as usize).saturating_sub(self.min as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }
}

/// Mutex-guarded registry of allocated ports
///
/// Cloning shares the underlying registry, so the manager, gateway state and
/// sweep task all observe the same allocations.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    blocked: HashSet<u16>,
    // port -> owning session id
    in_use: Arc<Mutex<HashMap<u16, String>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, blocked: impl IntoIterator<Item = u16>) -> Self {
        Self {
            range,
            blocked: blocked.into_iter().collect(),
            in_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pick an unused port uniformly from the range, minus the blocklist and
    /// ports already in use
    ///
    /// Fails with `PortExhausted` once the range is spent. The caller
    /// surfaces this to the user instead of retrying.
    pub fn allocate(&self, session_id: &str) -> Result<u16, SessionError> {
        let mut in_use = self.in_use.lock().unwrap();

        let candidates: Vec<u16> = (self.range.min..=self.range.max)
            .filter(|p| !self.blocked.contains(p) && !in_use.contains_key(p))
            .collect();

        let port = *candidates
            .choose(&mut rand::thread_rng())
            .ok_or(SessionError::PortExhausted {
                min: self.range.min,
                max: self.range.max,
            })?;

        in_use.insert(port, session_id.to_string());
        Ok(port)
    }

    /// Record an externally chosen port (a backend the hosting application
    /// already started) so stats and double-allocation checks see it
    ///
    /// Not required to fall inside the allocation range.
    pub fn claim(&self, port: u16, session_id: &str) -> Result<(), SessionError> {
        let mut in_use = self.in_use.lock().unwrap();
        match in_use.get(&port) {
            Some(owner) if owner != session_id => Err(SessionError::PortExhausted {
                min: port,
                max: port,
            }),
            _ => {
                in_use.insert(port, session_id.to_string());
                Ok(())
            }
        }
    }

    /// Release a port back to the pool
    ///
    /// Idempotent: releasing an already-free port is a no-op. Both the sweep
    /// and the store TTL may retire the same session.
    pub fn release(&self, port: u16) {
        self.in_use.lock().unwrap().remove(&port);
    }

    /// Number of ports currently allocated
    pub fn used_count(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }

    /// Snapshot of (port, session id) pairs currently allocated
    pub fn snapshot(&self) -> Vec<(u16, String)> {
        self.in_use
            .lock()
            .unwrap()
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect()
    }

    pub fn range(&self) -> PortRange {
        self.range
    }
}
