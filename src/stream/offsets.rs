//! Offset table and dirty tracking
//!
//! Concurrent map of per-vBucket resume points plus the "dirty since last
//! flush" marker set. Monotonicity is enforced one level up, in the
//! coordinator's offset store path.

use crate::models::Offset;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capacity hint matching the vBucket space of a bucket.
const DEFAULT_CAPACITY: usize = 1024;

/// Per-vBucket offsets with a parallel dirty-marker set.
#[derive(Debug)]
pub struct OffsetTable {
    offsets: DashMap<u16, Offset>,
    dirty: DashMap<u16, bool>,
    any_dirty: AtomicBool,
}

impl Default for OffsetTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTable {
    pub fn new() -> Self {
        Self {
            offsets: DashMap::with_capacity(DEFAULT_CAPACITY),
            dirty: DashMap::with_capacity(DEFAULT_CAPACITY),
            any_dirty: AtomicBool::new(false),
        }
    }

    /// Look up the stored offset for a vBucket.
    pub fn load(&self, vb_id: u16) -> Option<Offset> {
        self.offsets.get(&vb_id).map(|entry| *entry)
    }

    /// Unconditional replace.
    pub fn store(&self, vb_id: u16, offset: Offset) {
        self.offsets.insert(vb_id, offset);
    }

    /// Mark a vBucket dirty iff it is unmarked or marked-and-clean.
    ///
    /// Coalesces repeated marks between ingestion and flush so the flush
    /// path can clear exactly what it captured.
    pub fn conditional_mark_dirty(&self, vb_id: u16) {
        self.dirty
            .entry(vb_id)
            .and_modify(|dirty| {
                if !*dirty {
                    *dirty = true;
                }
            })
            .or_insert(true);
        self.any_dirty.store(true, Ordering::Release);
    }

    /// Iterate all entries; return false from `f` to stop early. Each entry
    /// is read under the map's own shard lock.
    pub fn range(&self, mut f: impl FnMut(u16, &Offset) -> bool) {
        for entry in self.offsets.iter() {
            if !f(*entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// vBucket IDs currently tracked.
    pub fn vb_ids(&self) -> Vec<u16> {
        self.offsets.iter().map(|entry| *entry.key()).collect()
    }

    /// vBucket IDs currently marked dirty.
    pub fn dirty_vb_ids(&self) -> Vec<u16> {
        self.dirty
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Consistent-per-entry clone of the offsets.
    pub fn snapshot(&self) -> HashMap<u16, Offset> {
        self.offsets
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Consistent-per-entry clone of the dirty markers.
    pub fn dirty_snapshot(&self) -> HashMap<u16, bool> {
        self.dirty
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Clear the markers a successful flush captured. Marks set after the
    /// capture survive for the next flush.
    pub fn mark_flushed(&self, vb_ids: &[u16]) {
        for vb_id in vb_ids {
            if let Some(mut entry) = self.dirty.get_mut(vb_id) {
                *entry = false;
            }
        }
        if !self.dirty.iter().any(|entry| *entry.value()) {
            self.any_dirty.store(false, Ordering::Release);
        }
    }

    /// Drop every dirty marker. Single-writer operation for external offset
    /// publishers that drained the dirty set themselves.
    pub fn unmark_all(&self) {
        self.dirty.clear();
        self.any_dirty.store(false, Ordering::Release);
    }

    /// Whether any offset changed since the last successful flush.
    pub fn any_dirty(&self) -> bool {
        self.any_dirty.load(Ordering::Acquire)
    }

    pub fn set_any_dirty(&self) {
        self.any_dirty.store(true, Ordering::Release);
    }

    /// Reinitialize to empty; the next open reloads from the metadata store.
    pub fn reset(&self) {
        self.offsets.clear();
        self.dirty.clear();
        self.any_dirty.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
