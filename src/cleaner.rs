//! Dirty-block Cleaner: per-set write-back under per-set/global concurrency
//! limits, plus sync-all and shutdown drains.
//!
//! Grounded on `storage/writecache.rs`'s `flush_all`/batch-writeback
//! machinery (DBN-sorted batching, a bounded number of in-flight
//! writebacks), generalized to spec.md §4.E's two triggers (threshold
//! crossing, explicit sync) and its per-set/global limit pair.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::adapter::{DeviceTarget, IoAdapter};
use crate::control::Tunables;
use crate::engine::Engine;
use crate::slot::SlotState;
use crate::types::{SetIndex, SlotIndex};

/// Global in-flight-cleaning counters shared across every set (spec.md
/// §4.E limits, §5 "global bit-lock"-adjacent counters that are fine as
/// plain atomics since they need not be consistent with slot state).
#[derive(Default)]
pub struct CleanerLimits {
    global_clean_inprog: AtomicU32,
    /// Raised during shutdown drains to bypass the configured caps
    /// (spec.md §4.E "temporarily elevated to drain aggressively").
    elevated: AtomicBool,
}

impl CleanerLimits {
    pub fn new() -> Self {
        Self::default()
    }

    fn effective_total_cap(&self, configured: u32) -> u32 {
        if self.elevated.load(Ordering::Relaxed) {
            u32::MAX
        } else {
            configured
        }
    }

    pub fn elevate(&self) {
        self.elevated.store(true, Ordering::Relaxed);
    }

    pub fn lower(&self) {
        self.elevated.store(false, Ordering::Relaxed);
    }
}

/// Drives write-back for one cache instance's dirty sets.
pub struct Cleaner<A: IoAdapter> {
    limits: CleanerLimits,
    /// Set by `stop_sync`; checked between sets during `sync_all` (spec.md
    /// §5 "Cancellation").
    stop_sync: AtomicBool,
    _marker: core::marker::PhantomData<A>,
}

impl<A: IoAdapter> Cleaner<A> {
    pub fn new() -> Self {
        Cleaner { limits: CleanerLimits::new(), stop_sync: AtomicBool::new(false), _marker: core::marker::PhantomData }
    }

    pub fn request_stop(&self) {
        self.stop_sync.store(true, Ordering::Relaxed);
    }

    fn clear_stop(&self) {
        self.stop_sync.store(false, Ordering::Relaxed);
    }

    fn stopped(&self) -> bool {
        self.stop_sync.load(Ordering::Relaxed)
    }

    /// `clean_set` (spec.md §4.E): collects unpinned DIRTY slots in
    /// `set_idx`, sorts by DBN, and writes each back up to the per-set cap
    /// and the (possibly elevated) global cap.
    pub fn clean_set(&self, engine: &Engine<A>, tunables: &Tunables, set_idx: SetIndex) -> u32 {
        let set_cap = tunables.max_clean_ios_set;
        let total_cap = self.limits.effective_total_cap(tunables.max_clean_ios_total);

        let candidates = engine.with_index(|index| {
            let assoc = index.assoc() as usize;
            let base = set_idx * assoc;
            let inflight = index.set(set_idx).clean_inprog;
            if inflight >= set_cap || self.limits.global_clean_inprog.load(Ordering::Relaxed) >= total_cap {
                engine.stats.set_limit_reached.fetch_add(1, Ordering::Relaxed);
                engine.stats.total_limit_reached.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
            let mut candidates: Vec<SlotIndex> = (0..assoc)
                .map(|local| base + local)
                .filter(|&idx| index.slot(idx).is_dirty() && !index.slot(idx).is_pinned())
                .collect();
            candidates.sort_by_key(|&idx| index.slot(idx).dbn);
            let budget = (set_cap.saturating_sub(inflight)) as usize;
            candidates.truncate(budget);
            candidates
        });

        let mut cleaned = 0u32;
        for slot_idx in candidates {
            if self.clean_one(engine, set_idx, slot_idx).is_ok() {
                cleaned += 1;
            }
        }
        cleaned
    }

    fn clean_one(&self, engine: &Engine<A>, set_idx: SetIndex, slot_idx: SlotIndex) -> Result<(), crate::error::CacheError> {
        let pinned_now = engine.with_index(|index| {
            if index.slot(slot_idx).is_pinned() || !index.slot(slot_idx).is_dirty() {
                return true;
            }
            index.set_state(
                set_idx,
                slot_idx,
                SlotState::DISK_WRITE_IN_PROGRESS | SlotState::WRITE_BACK_IN_PROGRESS,
            );
            false
        });
        if pinned_now {
            return Err(crate::error::CacheError::Aborted);
        }
        self.limits.global_clean_inprog.fetch_add(1, Ordering::Relaxed);
        self.bump_set_inprog(engine, set_idx, 1);

        let dbn = engine.with_index(|index| index.slot(slot_idx).dbn);
        let mut buf = alloc::vec![0u8; engine.block_bytes()];
        let cache_sector = engine.persistence().layout.payload_sector(slot_idx);
        let read_result = engine.adapter().sync_read(DeviceTarget::Cache, cache_sector, &mut buf);
        let result = read_result.and_then(|_| engine.adapter().sync_write(DeviceTarget::Disk, dbn, &buf));

        self.limits.global_clean_inprog.fetch_sub(1, Ordering::Relaxed);
        self.bump_set_inprog(engine, set_idx, -1);

        engine.with_index(|index| {
            index.clear_state(
                set_idx,
                slot_idx,
                SlotState::DISK_WRITE_IN_PROGRESS | SlotState::WRITE_BACK_IN_PROGRESS,
            );
            if result.is_ok() {
                index.clear_state(set_idx, slot_idx, SlotState::DIRTY);
            }
        });

        if result.is_ok() {
            engine.write_metadata_for(slot_idx).ok();
            engine.stats.cleanings.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn bump_set_inprog(&self, engine: &Engine<A>, set_idx: SetIndex, delta: i32) {
        engine.with_index(|index| {
            let current = index.set(set_idx).clean_inprog;
            let next = if delta >= 0 { current + delta as u32 } else { current.saturating_sub((-delta) as u32) };
            index.set_clean_inprog_for_cleaner(set_idx, next);
        });
    }

    /// Iterates every set, running `clean_set`, until `nr_dirty == 0`
    /// across the whole index or `stop_sync` is asserted (spec.md §4.E
    /// "Sync-all").
    pub fn sync_all(&self, engine: &Engine<A>, tunables: &Tunables) {
        self.clear_stop();
        loop {
            if engine.total_dirty() == 0 || self.stopped() {
                return;
            }
            for set_idx in 0..engine.n_sets() {
                if self.stopped() {
                    return;
                }
                self.clean_set(engine, tunables, set_idx);
            }
        }
    }

    /// Shutdown drain: elevates the concurrency caps, runs `sync_all`
    /// unless `fast_remove` is set (spec.md §4.E, §5 "fast_remove flags the
    /// cleaner to skip cleaning and leave blocks DIRTY on disk").
    pub fn drain_for_shutdown(&self, engine: &Engine<A>, tunables: &Tunables) {
        if tunables.fast_remove {
            return;
        }
        self.limits.elevate();
        self.sync_all(engine, tunables);
        self.limits.lower();
    }
}

impl<A: IoAdapter> Default for Cleaner<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MemoryAdapter;
    use crate::persistence::{Layout, PersistenceManager};
    use alloc::string::ToString;

    fn build() -> (Engine<MemoryAdapter>, Cleaner<MemoryAdapter>, Tunables) {
        let layout = Layout::new(16, 4, 8, false).unwrap();
        let cache_sectors = layout.md_sectors + layout.size * layout.block_size as u64;
        let pm = PersistenceManager::new(layout, "/dev/disk0".to_string(), "/dev/ssd0".to_string(), 1);
        let adapter = MemoryAdapter::new(1_000_000, cache_sectors);
        let index = pm.create(&adapter, false, 1_000_000, cache_sectors).unwrap();
        (Engine::new(index, adapter, pm, Tunables::default()), Cleaner::new(), Tunables::default())
    }

    #[test]
    fn clean_set_writes_dirty_slots_back_to_disk_and_clears_dirty() {
        let (engine, cleaner, tunables) = build();
        let block_bytes = engine.block_bytes();
        engine.write(0, &alloc::vec![0xCCu8; block_bytes]).unwrap();
        assert_eq!(engine.total_dirty(), 1);

        let set_idx = engine.with_index(|idx| idx.set_for_dbn(0));
        let cleaned = cleaner.clean_set(&engine, &tunables, set_idx);
        assert_eq!(cleaned, 1);
        assert_eq!(engine.total_dirty(), 0);

        let mut out = alloc::vec![0u8; block_bytes];
        engine.adapter().sync_read(DeviceTarget::Disk, 0, &mut out).unwrap();
        assert_eq!(out, alloc::vec![0xCCu8; block_bytes]);
    }

    #[test]
    fn sync_all_drains_every_dirty_set() {
        let (engine, cleaner, tunables) = build();
        let block_bytes = engine.block_bytes();
        for dbn in [0u64, 8, 16, 24] {
            engine.write(dbn, &alloc::vec![0x42u8; block_bytes]).unwrap();
        }
        assert!(engine.total_dirty() > 0);
        cleaner.sync_all(&engine, &tunables);
        assert_eq!(engine.total_dirty(), 0);
    }
}
