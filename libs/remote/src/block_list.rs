//! Block List
//!
//! Remote system ids that may not connect. Consulted by the endpoint reader
//! when a `ConnectRequest` arrives; mutated by administrative calls.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Shared set of blocked system ids
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    blocked: Arc<RwLock<HashSet<String>>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, system_id: &str) -> bool {
        self.blocked.read().contains(system_id)
    }

    /// Block every id in `system_ids`
    pub fn block<I, S>(&self, system_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut blocked = self.blocked.write();
        for id in system_ids {
            let id = id.into();
            info!(system_id = %id, "Blocking remote system");
            blocked.insert(id);
        }
    }

    /// Returns true if the id was blocked
    pub fn unblock(&self, system_id: &str) -> bool {
        self.blocked.write().remove(system_id)
    }

    /// Snapshot of blocked ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.blocked.read().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.blocked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.read().is_empty()
    }
}
