//! Wager Registry
//!
//! Authoritative store of wager state. The contract: per-wager
//! read-modify-write is linearizable (each wager sits behind its own lock),
//! and operations on different wagers share no lock. The registry-wide map
//! lock is held only to look handles up or insert/remove entries, never
//! across a ledger or extractor call. Any storage engine with the same
//! per-key atomicity can replace this in-memory map.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::wager::state::{Wager, WagerId};

/// Shared handle to a single wager's state.
pub type WagerHandle = Arc<RwLock<Wager>>;

/// In-memory wager store with per-wager locking.
#[derive(Debug, Default)]
pub struct WagerRegistry {
    wagers: RwLock<BTreeMap<WagerId, WagerHandle>>,
}

impl WagerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created wager and return its handle.
    pub async fn insert(&self, wager: Wager) -> WagerHandle {
        let id = wager.id;
        let handle = Arc::new(RwLock::new(wager));
        let mut wagers = self.wagers.write().await;
        wagers.insert(id, handle.clone());
        handle
    }

    /// Look up a wager by id.
    pub async fn get(&self, id: &WagerId) -> Option<WagerHandle> {
        let wagers = self.wagers.read().await;
        wagers.get(id).cloned()
    }

    /// Remove a wager.
    pub async fn remove(&self, id: &WagerId) -> bool {
        let mut wagers = self.wagers.write().await;
        wagers.remove(id).is_some()
    }

    /// Snapshot of all wager handles, for sweeps and listings. The
    /// registry lock is released before any handle is locked.
    pub async fn handles(&self) -> Vec<WagerHandle> {
        let wagers = self.wagers.read().await;
        wagers.values().cloned().collect()
    }

    /// Number of stored wagers.
    pub async fn count(&self) -> usize {
        let wagers = self.wagers.read().await;
        wagers.len()
    }
}
