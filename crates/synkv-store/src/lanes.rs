//! Per-key background write queues.
//!
//! Each key has at most one pending payload and at most one active writer.
//! A newer `set` replaces the pending payload, so a slow backend sees only
//! the latest value per key while writes for different keys proceed
//! independently.

use std::collections::{HashMap, HashSet};

use synkv_backend::RawValue;

/// A payload waiting to be written, tagged with the cache version it was
/// produced at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub raw: RawValue,
    pub version: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Lanes {
    pending: HashMap<String, PendingWrite>,
    active: HashSet<String>,
}

impl Lanes {
    /// Queue `write` as the next payload for `key`, replacing any payload not
    /// yet picked up. Returns `true` when no writer is active for the key and
    /// the caller must start one.
    pub fn enqueue(&mut self, key: &str, write: PendingWrite) -> bool {
        self.pending.insert(key.to_owned(), write);
        self.active.insert(key.to_owned())
    }

    /// Called by the writer: the next payload to write, or `None` after
    /// marking the lane idle.
    pub fn take_next(&mut self, key: &str) -> Option<PendingWrite> {
        let next = self.pending.remove(key);
        if next.is_none() {
            self.active.remove(key);
        }
        next
    }

    /// Drop a payload that has not started writing yet.
    pub fn discard_pending(&mut self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
