//! The in-memory slot table: lookup, victim selection, and the state
//! transitions that keep `nr_dirty` and LRU linkage consistent.
//!
//! Grounded on `storage/cache.rs`'s `BlockCache` (flat slot array + set
//! grouping) and `storage/writecache.rs`'s dirty-tracking `DeviceCache`,
//! generalized to the two-policy (FIFO/LRU) victim contract spec.md §4.C
//! and §9 call for.

use alloc::vec;
use alloc::vec::Vec;

use crate::policy::{hash_block, ReclaimPolicy};
use crate::set::CacheSet;
use crate::slot::{Slot, SlotState};
use crate::types::{Dbn, SetIndex, SlotIndex, LRU_NULL};

/// Outcome of `Index::lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Hit(SlotIndex),
    Miss,
}

/// Outcome of `Index::find_victim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimResult {
    Found(SlotIndex),
    /// No unpinned slot exists in the set; the Engine defers the request
    /// (spec.md §4.C).
    NoRoom,
}

/// Owns the flat slot array and the per-set structures. Callers
/// (the Request Engine, the Cleaner) hold the instance spinlock while
/// calling any method here (spec.md §5).
pub struct Index {
    slots: Vec<Slot>,
    sets: Vec<CacheSet>,
    assoc: u32,
    block_size: u32,
}

impl Index {
    /// Builds an all-INVALID index for `size` slots grouped into
    /// `size / assoc` sets. `size` must already be `assoc`-aligned
    /// (the Persistence Manager truncates it before calling this).
    pub fn new(size: u64, assoc: u32, block_size: u32) -> Self {
        let n_sets = (size / assoc as u64) as usize;
        Index {
            slots: vec![Slot::new_invalid(); size as usize],
            sets: vec![CacheSet::new(); n_sets],
            assoc,
            block_size,
        }
    }

    pub fn n_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn assoc(&self) -> u32 {
        self.assoc
    }

    pub fn slot(&self, idx: SlotIndex) -> &Slot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: SlotIndex) -> &mut Slot {
        &mut self.slots[idx]
    }

    pub fn set(&self, idx: SetIndex) -> &CacheSet {
        &self.sets[idx]
    }

    /// Maps a DBN to its owning set (spec.md §4.C).
    pub fn set_for_dbn(&self, dbn: Dbn) -> SetIndex {
        hash_block(dbn, self.block_size, self.sets.len())
    }

    fn set_bounds(&self, set_idx: SetIndex) -> core::ops::Range<usize> {
        let base = set_idx * self.assoc as usize;
        base..(base + self.assoc as usize)
    }

    /// Hashes `dbn` to its set, then linearly scans the set for a VALID,
    /// non-installing slot whose `dbn` matches. INVALID slots never match
    /// (spec.md §4.C).
    pub fn lookup(&self, dbn: Dbn) -> LookupResult {
        let set_idx = self.set_for_dbn(dbn);
        for idx in self.set_bounds(set_idx) {
            let slot = &self.slots[idx];
            if slot.is_installing() {
                continue;
            }
            if slot.is_valid() && slot.dbn == dbn {
                return LookupResult::Hit(idx);
            }
        }
        LookupResult::Miss
    }

    /// Selects a victim in `set_idx` under `policy`. FIFO advances
    /// `set_fifo_next`; LRU walks from `lru_head`. Returns `NoRoom` if
    /// every slot in the set is pinned (spec.md §4.C).
    pub fn find_victim(&mut self, set_idx: SetIndex, policy: ReclaimPolicy) -> VictimResult {
        match policy {
            ReclaimPolicy::Fifo => self.find_victim_fifo(set_idx),
            ReclaimPolicy::Lru => self.find_victim_lru(set_idx),
        }
    }

    fn find_victim_fifo(&mut self, set_idx: SetIndex) -> VictimResult {
        let assoc = self.assoc as usize;
        let base = set_idx * assoc;
        let start = self.sets[set_idx].fifo_next as usize;
        for step in 0..assoc {
            let local = (start + step) % assoc;
            let global = base + local;
            if !self.slots[global].is_pinned() {
                self.sets[set_idx].fifo_next = ((local + 1) % assoc) as u32;
                return VictimResult::Found(global);
            }
        }
        VictimResult::NoRoom
    }

    fn find_victim_lru(&mut self, set_idx: SetIndex) -> VictimResult {
        let base = set_idx * self.assoc as usize;
        let mut cursor = self.sets[set_idx].lru_head;
        while cursor != LRU_NULL {
            let global = base + cursor as usize;
            if !self.slots[global].is_pinned() {
                return VictimResult::Found(global);
            }
            cursor = self.slots[global].lru_next;
        }
        VictimResult::NoRoom
    }

    /// Detaches `slot_idx` from its set's LRU list and pushes it to the
    /// tail (most-recently-used end). No-op under FIFO; the Engine calls
    /// this unconditionally and relies on the policy object to ignore it
    /// (callers gate on `policy == Lru` to avoid the bookkeeping cost).
    pub fn touch(&mut self, set_idx: SetIndex, slot_idx: SlotIndex) {
        let base = set_idx * self.assoc as usize;
        let local = (slot_idx - base) as u32;
        self.lru_detach(set_idx, local);
        self.lru_push_tail(set_idx, local);
    }

    fn lru_detach(&mut self, set_idx: SetIndex, local: u32) {
        let base = set_idx * self.assoc as usize;
        let (prev, next) = {
            let slot = &self.slots[base + local as usize];
            (slot.lru_prev, slot.lru_next)
        };
        if prev != LRU_NULL {
            self.slots[base + prev as usize].lru_next = next;
        } else if self.sets[set_idx].lru_head == local {
            self.sets[set_idx].lru_head = next;
        }
        if next != LRU_NULL {
            self.slots[base + next as usize].lru_prev = prev;
        } else if self.sets[set_idx].lru_tail == local {
            self.sets[set_idx].lru_tail = prev;
        }
        let slot = &mut self.slots[base + local as usize];
        slot.lru_prev = LRU_NULL;
        slot.lru_next = LRU_NULL;
    }

    fn lru_push_tail(&mut self, set_idx: SetIndex, local: u32) {
        let base = set_idx * self.assoc as usize;
        let old_tail = self.sets[set_idx].lru_tail;
        self.slots[base + local as usize].lru_prev = old_tail;
        if old_tail != LRU_NULL {
            self.slots[base + old_tail as usize].lru_next = local;
        } else {
            self.sets[set_idx].lru_head = local;
        }
        self.sets[set_idx].lru_tail = local;
    }

    /// Sets additional flags on a slot, adjusting `nr_dirty` when DIRTY is
    /// newly asserted on a VALID slot (spec.md §4.C).
    pub fn set_state(&mut self, set_idx: SetIndex, slot_idx: SlotIndex, new_flags: SlotState) {
        let was_dirty = self.slots[slot_idx].is_dirty();
        self.slots[slot_idx].state |= new_flags;
        if !was_dirty && self.slots[slot_idx].is_dirty() {
            self.sets[set_idx].nr_dirty += 1;
        }
    }

    /// Clears flags on a slot, adjusting `nr_dirty` when DIRTY is cleared.
    pub fn clear_state(&mut self, set_idx: SetIndex, slot_idx: SlotIndex, flags: SlotState) {
        let was_dirty = self.slots[slot_idx].is_dirty();
        self.slots[slot_idx].state &= !flags;
        if was_dirty && !self.slots[slot_idx].is_dirty() {
            self.sets[set_idx].nr_dirty = self.sets[set_idx].nr_dirty.saturating_sub(1);
        }
    }

    /// Demotes a slot to INVALID, going through `clear_state` so a DIRTY
    /// slot's `nr_dirty` is decremented first (spec.md §4.D error paths:
    /// a cache/disk I/O failure invalidates the slot outright, and must not
    /// leave `nr_dirty` counting a slot that no longer carries any dirty
    /// data, or `Cleaner::sync_all`'s `total_dirty() == 0` loop would never
    /// terminate). Clears every flag before assigning `INVALID`, not just
    /// `DIRTY`, since none of the persisted or in-progress flags mean
    /// anything on an invalidated slot.
    pub fn invalidate(&mut self, set_idx: SetIndex, slot_idx: SlotIndex) {
        self.clear_state(set_idx, slot_idx, SlotState::all());
        self.slots[slot_idx].state = SlotState::INVALID;
    }

    /// Sets a set's `clean_inprog` counter directly; the Cleaner owns this
    /// field's lifecycle (spec.md §4.E increments/decrements it around each
    /// write-back).
    pub(crate) fn set_clean_inprog_for_cleaner(&mut self, set_idx: SetIndex, value: u32) {
        self.sets[set_idx].clean_inprog = value;
    }

    /// Overwrites a set's `nr_dirty` directly. Only `load` uses this: it
    /// populates slots bypassing `set_state`/`clear_state` and must
    /// reconstruct the counter afterwards from the recovered slots.
    pub(crate) fn set_nr_dirty_for_recovery(&mut self, set_idx: SetIndex, count: u32) {
        self.sets[set_idx].nr_dirty = count;
    }

    /// Total dirty slots across the whole index (spec.md §4.E sync-all
    /// termination condition: `nr_dirty == 0`).
    pub fn total_dirty(&self) -> u32 {
        self.sets.iter().map(|s| s.nr_dirty).sum()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
