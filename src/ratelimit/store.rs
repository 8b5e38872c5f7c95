//! Window store: per-key fixed-window counters.
//!
//! A store knows nothing about policies. It only tracks how many events each
//! key has accumulated since its window started, and forgets a window once
//! it has elapsed. Fixed windows allow a burst of up to twice the limit
//! across a window boundary; that approximation is accepted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::elapsed;
use crate::error::Result;

/// Accumulated usage for one key within its active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Number of counted events since the window started
    pub count: u64,
    /// When the current window began
    pub window_start: DateTime<Utc>,
}

impl WindowEntry {
    /// An empty window starting at `now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Whether this window has run its course at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        elapsed(self.window_start, now) >= window
    }
}

/// Storage backend for window counters.
///
/// Implementations must make `increment` atomic per key: two concurrent
/// increments of the same key never observe the same pre-increment count.
/// The in-process [`MemoryStore`] never fails; networked implementations
/// report [`AdmissionError::StoreUnavailable`](crate::error::AdmissionError::StoreUnavailable).
pub trait WindowStore: Send + Sync {
    /// Count one event for `key`, starting a new window if none is active.
    fn increment(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowEntry>;

    /// Read the active window for `key` without counting anything.
    ///
    /// An absent or elapsed window reads as an empty window starting at `now`.
    fn peek(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowEntry>;

    /// Forget everything about `key`.
    fn reset(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    entry: WindowEntry,
    window: Duration,
}

/// In-memory window store backed by a sharded concurrent map.
///
/// Per-key atomicity comes from the shard lock held by the map entry API;
/// keys that hash to different shards never contend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Drop every entry whose window has elapsed at `now`.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.entry.is_expired(now, slot.window));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.slots.len(), "Purged expired windows");
        }
        removed
    }

    /// Number of keys currently tracked, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store tracks no keys.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl WindowStore for MemoryStore {
    fn increment(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowEntry> {
        let entry = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.entry.is_expired(now, window) {
                    trace!(key = %key, previous = slot.entry.count, "Window elapsed, starting new window");
                    slot.entry = WindowEntry {
                        count: 1,
                        window_start: now,
                    };
                } else {
                    slot.entry.count = slot.entry.count.saturating_add(1);
                }
                slot.window = window;
                slot.entry
            }
            Entry::Vacant(vacant) => {
                trace!(key = %key, "Creating new window");
                let entry = WindowEntry {
                    count: 1,
                    window_start: now,
                };
                vacant.insert(Slot { entry, window });
                entry
            }
        };
        Ok(entry)
    }

    fn peek(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowEntry> {
        let entry = self
            .slots
            .get(key)
            .map(|slot| slot.entry)
            .filter(|entry| !entry.is_expired(now, window))
            .unwrap_or_else(|| WindowEntry::fresh(now));
        Ok(entry)
    }

    fn reset(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }
}
