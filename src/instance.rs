//! Cache instance: construction, the per-request entry point (with
//! uncacheable-policy short-circuiting), and the quiesce-drain-persist
//! shutdown sequence.
//!
//! Grounded on `storage/writecache.rs`'s `DeviceCache` as the "one struct
//! owns device handles + cache + stats + config" shape, and
//! `flashcache_conf.c`'s `cache_create`/`cache_destroy` construct/destroy
//! pair for the shutdown protocol (spec.md §3 "Cache instance", §4.F).

use alloc::string::String;

use crate::adapter::IoAdapter;
use crate::cleaner::Cleaner;
use crate::control::Tunables;
use crate::engine::{BlockAlignedOnly, CacheabilityPolicy, Engine};
use crate::error::{CacheError, CacheResult};
use crate::persistence::{Layout, PersistenceManager, PersistenceMode};
use crate::types::{Dbn, DEFAULT_ASSOC, DEFAULT_BLOCK_SIZE};

/// Positional construction arguments (spec.md §6).
pub struct ConstructionArgs {
    pub disk_name: String,
    pub cache_name: String,
    pub mode: PersistenceMode,
    pub block_size: u32,
    /// Cache size in sectors; `None` uses the whole cache device.
    pub cache_size_sectors: Option<u64>,
    pub assoc: u32,
    pub with_checksum: bool,
    pub cache_version: u32,
}

impl ConstructionArgs {
    pub fn new(disk_name: impl Into<String>, cache_name: impl Into<String>, mode: PersistenceMode) -> Self {
        ConstructionArgs {
            disk_name: disk_name.into(),
            cache_name: cache_name.into(),
            mode,
            block_size: DEFAULT_BLOCK_SIZE,
            cache_size_sectors: None,
            assoc: DEFAULT_ASSOC,
            with_checksum: false,
            cache_version: 1,
        }
    }
}

/// Owns an `Engine` and `Cleaner` pair for one cache instance, plus the
/// uncacheable-request policy the Control Surface supplies (spec.md §3
/// "Cache instance").
pub struct CacheInstance<A: IoAdapter, P: CacheabilityPolicy = BlockAlignedOnly> {
    pub engine: Engine<A>,
    pub cleaner: Cleaner<A>,
    policy: P,
    disk_sectors: u64,
    cache_sectors: u64,
}

impl<A: IoAdapter> CacheInstance<A, BlockAlignedOnly> {
    /// Constructs or reloads an instance using the default block-aligned
    /// cacheability policy.
    pub fn construct(adapter: A, args: ConstructionArgs, tunables: Tunables) -> CacheResult<Self> {
        Self::construct_with_policy(adapter, args, tunables, BlockAlignedOnly)
    }
}

impl<A: IoAdapter, P: CacheabilityPolicy> CacheInstance<A, P> {
    /// Backs out the largest block count whose payload plus metadata region
    /// fits within `cache_sectors` (spec.md §6 "cache size in sectors");
    /// `md_sectors` depends on the block count being solved for, so this
    /// shrinks from the payload-only upper bound until the two regions fit.
    fn usable_blocks(cache_sectors: u64, block_size: u32, with_checksum: bool) -> CacheResult<u64> {
        if block_size == 0 {
            return Err(CacheError::ConfigInvalid);
        }
        let mut size_blocks = cache_sectors / block_size as u64;
        while size_blocks > 0 {
            let total = crate::codec::md_sectors(size_blocks, with_checksum) + size_blocks * block_size as u64;
            if total <= cache_sectors {
                return Ok(size_blocks);
            }
            size_blocks -= 1;
        }
        Err(CacheError::ConfigInvalid)
    }

    pub fn construct_with_policy(adapter: A, args: ConstructionArgs, tunables: Tunables, policy: P) -> CacheResult<Self> {
        let disk_sectors = adapter.sector_count(crate::adapter::DeviceTarget::Disk);
        let cache_sectors = args.cache_size_sectors.unwrap_or_else(|| adapter.sector_count(crate::adapter::DeviceTarget::Cache));

        let size_blocks = Self::usable_blocks(cache_sectors, args.block_size, args.with_checksum)?;
        let layout = Layout::new(size_blocks, args.assoc, args.block_size, args.with_checksum)?;
        let persistence = PersistenceManager::new(layout, args.disk_name, args.cache_name, args.cache_version);

        let index = match args.mode {
            PersistenceMode::Reload => persistence.load(&adapter, disk_sectors, cache_sectors)?,
            PersistenceMode::Create => persistence.create(&adapter, false, disk_sectors, cache_sectors)?,
            PersistenceMode::ForceCreate => persistence.create(&adapter, true, disk_sectors, cache_sectors)?,
        };

        let engine = Engine::new(index, adapter, persistence, tunables);
        Ok(CacheInstance { engine, cleaner: Cleaner::new(), policy, disk_sectors, cache_sectors })
    }

    /// Entry point for one client read. Routes through the uncacheable
    /// policy before ever consulting the index (spec.md §4.D
    /// "Uncacheable").
    pub fn read(&self, dbn: Dbn, len_sectors: u32, out: &mut [u8]) -> CacheResult<()> {
        self.engine.stats.record_io_size(out.len());
        let block_size = self.engine.block_bytes() as u32 / crate::types::SECTOR_SIZE as u32;
        if !self.policy.is_cacheable(dbn, len_sectors, block_size) {
            return self.engine.uncached_read(dbn, out);
        }
        self.engine.read(dbn, out)
    }

    pub fn write(&self, dbn: Dbn, len_sectors: u32, payload: &[u8]) -> CacheResult<()> {
        self.engine.stats.record_io_size(payload.len());
        let block_size = self.engine.block_bytes() as u32 / crate::types::SECTOR_SIZE as u32;
        if !self.policy.is_cacheable(dbn, len_sectors, block_size) {
            return self.engine.uncached_write(dbn, payload);
        }
        self.engine.write(dbn, payload)
    }

    /// Whether `dbn`'s set has crossed the dirty threshold and should be
    /// handed to the Cleaner (spec.md §4.E "(a) set threshold crossing,
    /// `nr_dirty >= dirty_thresh_set` after a write"). The core only answers
    /// this question; driving a background scan loop that polls it and calls
    /// `cleaner.clean_set` belongs to the same external task-scheduling
    /// collaborator spec.md §1 already places out of scope, alongside
    /// `do_sync` and `fast_remove`, which call `sync`/`shutdown` explicitly.
    pub fn dirty_threshold_crossed(&self, dbn: Dbn) -> bool {
        let set_idx = self.engine.set_for_dbn(dbn);
        let tunables = self.engine.tunables.lock().clone();
        let thresh = tunables.dirty_thresh_set(self.engine.assoc());
        self.engine.with_set(set_idx, |set| set.is_clean_candidate(thresh))
    }

    /// Triggers an explicit sync (`do_sync` control input, spec.md §6).
    pub fn sync(&self) {
        let tunables = self.engine.tunables.lock().clone();
        self.cleaner.sync_all(&self.engine, &tunables);
    }

    pub fn stop_sync(&self) {
        self.cleaner.request_stop();
    }

    /// Shutdown sequence: drain dirty blocks (unless `fast_remove`), then
    /// persist metadata (spec.md §3 "destroyed by a shutdown action that
    /// first quiesces outstanding I/O, drains dirty blocks ... and persists
    /// metadata"). `fast_remove` skips both the drain and the final store:
    /// per-write metadata batching has already kept every dirty slot's
    /// on-disk descriptor current, and the superblock is left exactly as
    /// it was while the cache was open (DIRTY), so a subsequent `load` takes
    /// the unclean-shutdown recovery path (spec.md §8 scenario 5, glossary
    /// "Fast remove").
    pub fn shutdown(self) -> CacheResult<()> {
        let tunables = self.engine.tunables.lock().clone();
        self.cleaner.drain_for_shutdown(&self.engine, &tunables);
        if tunables.fast_remove {
            return Ok(());
        }
        let disk_sectors = self.disk_sectors;
        let cache_sectors = self.cache_sectors;
        self.engine.with_index(|index| self.engine.persistence().store(self.engine.adapter(), index, disk_sectors, cache_sectors))?;
        Ok(())
    }

    pub fn disk_sectors(&self) -> u64 {
        self.disk_sectors
    }

    pub fn cache_sectors(&self) -> u64 {
        self.cache_sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MemoryAdapter;
    use alloc::vec;

    fn small_args() -> ConstructionArgs {
        let mut args = ConstructionArgs::new("/dev/disk0", "/dev/ssd0", PersistenceMode::Create);
        args.block_size = 8;
        args.assoc = 4;
        args.cache_size_sectors = Some(16 * 8 + 64);
        args
    }

    #[test]
    fn construct_create_then_reload_preserves_dirty_state() {
        let adapter = MemoryAdapter::new(1_000_000, 16 * 8 + 64);
        let instance = CacheInstance::construct(adapter, small_args(), Tunables::default()).unwrap();
        let block_bytes = instance.engine.block_bytes();
        instance.write(0, 8, &vec![0x9u8; block_bytes]).unwrap();
        assert_eq!(instance.engine.total_dirty(), 1);
    }

    #[test]
    fn dirty_threshold_crossed_reflects_default_pct() {
        let adapter = MemoryAdapter::new(1_000_000, 16 * 8 + 64);
        let instance = CacheInstance::construct(adapter, small_args(), Tunables::default()).unwrap();
        let block_bytes = instance.engine.block_bytes();
        assert!(!instance.dirty_threshold_crossed(0));
        instance.write(0, 8, &vec![0x9u8; block_bytes]).unwrap();
        // assoc 4, default dirty_thresh_pct 20% -> floor is 1, so the very
        // first dirty slot in a set already crosses it.
        assert!(instance.dirty_threshold_crossed(0));
    }

    #[test]
    fn uncacheable_oversize_request_bypasses_cache() {
        let adapter = MemoryAdapter::new(1_000_000, 16 * 8 + 64);
        let instance = CacheInstance::construct(adapter, small_args(), Tunables::default()).unwrap();
        let mut out = vec![0u8; 16 * crate::types::SECTOR_SIZE];
        instance.read(0, 16, &mut out).unwrap();
        assert_eq!(
            instance
                .engine
                .stats
                .uncached_reads
                .load(core::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
