//! Membership view — the set of known peer ids with last-seen timestamps.
//!
//! Written by the discovery loops, snapshotted by matchmaking. Rules:
//! the local id never enters the view; a timestamp never moves backwards;
//! gossip entries older than the staleness window are dropped before
//! merging; the cleaner evicts ids not refreshed within its threshold.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::wire::GossipEntry;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Thread-safe id → last-seen map, excluding the local peer.
#[derive(Debug)]
pub struct MembershipView {
    self_id: String,
    seen: Mutex<HashMap<String, i64>>,
}

impl MembershipView {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a HELLO sighting. Returns true when the id was previously
    /// unknown (which is what triggers a gossip).
    pub fn observe_hello(&self, id: &str, now: i64) -> bool {
        if id == self.self_id {
            return false;
        }
        let mut seen = self.lock();
        match seen.get_mut(id) {
            Some(ts) => {
                if now > *ts {
                    *ts = now;
                }
                false
            }
            None => {
                seen.insert(id.to_owned(), now);
                true
            }
        }
    }

    /// Merge a GOSSIP digest. Entries naming the local peer or older than
    /// `staleness_ms` are dropped; for known ids only a strictly newer
    /// timestamp advances the sighting. Returns the ids new to the view.
    pub fn merge_gossip(
        &self,
        entries: &[GossipEntry],
        now: i64,
        staleness_ms: i64,
    ) -> Vec<String> {
        let mut added = Vec::new();
        let mut seen = self.lock();
        for entry in entries {
            if entry.id == self.self_id {
                continue;
            }
            if now - entry.ts > staleness_ms {
                continue;
            }
            match seen.get_mut(&entry.id) {
                Some(ts) => {
                    if entry.ts > *ts {
                        *ts = entry.ts;
                    }
                }
                None => {
                    seen.insert(entry.id.clone(), entry.ts);
                    added.push(entry.id.clone());
                }
            }
        }
        added
    }

    /// Evict ids whose last sighting is older than `threshold_ms`.
    /// Returns the evicted ids.
    pub fn prune(&self, now: i64, threshold_ms: i64) -> Vec<String> {
        let mut seen = self.lock();
        let stale: Vec<String> = seen
            .iter()
            .filter(|(_, &ts)| now - ts > threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            seen.remove(id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "pruned stale peers from view");
        }
        stale
    }

    /// Sorted snapshot of the known ids.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(id, last_seen)` pairs for building a gossip digest.
    pub fn entries(&self) -> Vec<GossipEntry> {
        self.lock()
            .iter()
            .map(|(id, &ts)| GossipEntry {
                id: id.clone(),
                ts,
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
