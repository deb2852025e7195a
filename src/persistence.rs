//! Persistence Manager: on-device layout, create/load/store, and the
//! per-metadata-sector write-coalescing structure.
//!
//! Grounded on `storage/gpt.rs`'s layout-computation-then-validate shape for
//! `create`/`load`, widened with the clean/fastclean/dirty recovery policy
//! and the metadata-sector batching spec.md §4.F and §9 require ("at-most-
//! one-writer, others wait" — not per-slot metadata writes).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::{info, warn};

use crate::adapter::{DeviceTarget, IoAdapter};
use crate::codec::{
    decode_slot_descriptor, decode_superblock, descriptor_size, encode_slot_descriptor, encode_superblock,
    md_blocks_per_sector, md_sectors, SbState, SlotDescriptor, Superblock,
};
use crate::error::{CacheError, CacheResult};
use crate::index::Index;
use crate::slot::SlotState;
use crate::types::{is_pow2, Dbn, SlotIndex, SECTOR_SIZE};

/// How a cache instance is brought up (spec.md §6 construction arguments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    Reload,
    Create,
    ForceCreate,
}

/// Fixed geometry derived once at construction: where the superblock,
/// descriptor region, and payload region live (spec.md §3 "On-device
/// layout").
#[derive(Debug, Clone)]
pub struct Layout {
    pub block_size: u32,
    pub size: u64,
    pub assoc: u32,
    pub with_checksum: bool,
    /// Total sectors occupied by superblock + descriptor region; the
    /// payload region starts here (spec.md §3, §6).
    pub md_sectors: u64,
}

impl Layout {
    pub fn new(size: u64, assoc: u32, block_size: u32, with_checksum: bool) -> CacheResult<Self> {
        if !is_pow2(block_size) || !is_pow2(assoc) || assoc > crate::types::FLASHCACHE_MAX_ASSOC {
            return Err(CacheError::ConfigInvalid);
        }
        let aligned_size = (size / assoc as u64) * assoc as u64;
        if aligned_size == 0 {
            return Err(CacheError::ConfigInvalid);
        }
        Ok(Layout {
            block_size,
            size: aligned_size,
            assoc,
            with_checksum,
            md_sectors: md_sectors(aligned_size, with_checksum),
        })
    }

    /// Sector on the cache device where slot `i`'s payload begins
    /// (spec.md §3: "slot i at sector md_sectors + i * block_size").
    pub fn payload_sector(&self, slot_idx: SlotIndex) -> u64 {
        self.md_sectors + slot_idx as u64 * self.block_size as u64
    }

    fn descriptors_per_sector(&self) -> usize {
        md_blocks_per_sector(self.with_checksum)
    }

    /// Which descriptor-region sector (0-based within the region, i.e. its
    /// absolute sector is `1 + this`) holds `slot_idx`'s descriptor, and the
    /// descriptor's byte offset within that sector.
    pub fn descriptor_location(&self, slot_idx: SlotIndex) -> (u64, usize) {
        let per_sector = self.descriptors_per_sector();
        let sector = (slot_idx / per_sector) as u64;
        let offset = (slot_idx % per_sector) * descriptor_size(self.with_checksum);
        (sector, offset)
    }

    pub fn total_descriptor_sectors(&self) -> u64 {
        self.md_sectors - 2
    }
}

/// Orchestrates `create`/`load`/`store` against a cache device (spec.md
/// §4.F). Holds the device-path strings carried in the superblock; owns no
/// I/O state itself.
pub struct PersistenceManager {
    pub layout: Layout,
    pub disk_name: String,
    pub cache_name: String,
    pub cache_version: u32,
}

impl PersistenceManager {
    pub fn new(layout: Layout, disk_name: String, cache_name: String, cache_version: u32) -> Self {
        PersistenceManager { layout, disk_name, cache_name, cache_version }
    }

    fn read_superblock(&self, adapter: &dyn IoAdapter) -> CacheResult<Superblock> {
        let mut sector = [0u8; SECTOR_SIZE];
        adapter
            .sync_read(DeviceTarget::Cache, 0, &mut sector)
            .map_err(|_| CacheError::DeviceOpen)?;
        decode_superblock(&sector)
    }

    fn write_superblock(&self, adapter: &dyn IoAdapter, state: SbState, disk_sectors: u64, cache_sectors: u64) -> CacheResult<()> {
        let sb = Superblock {
            state,
            block_size: self.layout.block_size,
            size: self.layout.size,
            assoc: self.layout.assoc,
            disk_name: self.disk_name.clone(),
            cache_name: self.cache_name.clone(),
            disk_sectors,
            cache_sectors,
            cache_version: self.cache_version,
        };
        let bytes = encode_superblock(&sb);
        adapter
            .sync_write(DeviceTarget::Cache, 0, &bytes)
            .map_err(|_| CacheError::MetadataWrite)
    }

    /// Writes the full descriptor region in one large vectored write, all
    /// entries INVALID (spec.md §4.F `create`).
    fn write_blank_descriptor_region(&self, adapter: &dyn IoAdapter) -> CacheResult<()> {
        let per_sector = self.layout.descriptors_per_sector();
        let dsize = descriptor_size(self.layout.with_checksum);
        let mut sector_buf = vec![0u8; SECTOR_SIZE];
        let blank = SlotDescriptor {
            dbn: 0,
            checksum: if self.layout.with_checksum { Some(0) } else { None },
            state: SlotState::INVALID,
        };
        for slot_in_sector in 0..per_sector {
            encode_slot_descriptor(&blank, &mut sector_buf[slot_in_sector * dsize..(slot_in_sector + 1) * dsize]);
        }
        for region_sector in 0..self.layout.total_descriptor_sectors() {
            adapter
                .sync_write(DeviceTarget::Cache, 1 + region_sector, &sector_buf)
                .map_err(|_| CacheError::MetadataWrite)?;
        }
        Ok(())
    }

    /// `create(force?)` (spec.md §4.F). Fails with `ExistingCache` unless
    /// `force` or no valid, live superblock is present.
    pub fn create(&self, adapter: &dyn IoAdapter, force: bool, disk_sectors: u64, cache_sectors: u64) -> CacheResult<Index> {
        if !force {
            if let Ok(sb) = self.read_superblock(adapter) {
                if matches!(sb.state, SbState::Clean | SbState::Dirty | SbState::FastClean) {
                    warn!("refusing to create over a live cache at {}", self.cache_name);
                    return Err(CacheError::ExistingCache);
                }
            }
        }
        self.write_blank_descriptor_region(adapter)?;
        self.write_superblock(adapter, SbState::Dirty, disk_sectors, cache_sectors)?;
        info!("cache created at {} ({} slots)", self.cache_name, self.layout.size);
        Ok(Index::new(self.layout.size, self.layout.assoc, self.layout.block_size))
    }

    /// `load` (spec.md §4.F). Applies the DIRTY/CLEAN/FASTCLEAN recovery
    /// policy while streaming the descriptor region, then reopens the cache
    /// by rewriting the superblock as DIRTY.
    pub fn load(&self, adapter: &dyn IoAdapter, disk_sectors: u64, cache_sectors: u64) -> CacheResult<Index> {
        let sb = self.read_superblock(adapter)?;
        if !matches!(sb.state, SbState::Clean | SbState::FastClean | SbState::Dirty) {
            return Err(CacheError::MalformedMetadata);
        }
        if sb.block_size != self.layout.block_size || sb.size != self.layout.size || sb.assoc != self.layout.assoc {
            return Err(CacheError::MalformedMetadata);
        }
        if matches!(sb.state, SbState::Dirty) {
            warn!("loading {} after an unclean shutdown, trusting only DIRTY descriptors", self.cache_name);
        }

        let mut index = Index::new(self.layout.size, self.layout.assoc, self.layout.block_size);
        let per_sector = self.layout.descriptors_per_sector();
        let dsize = descriptor_size(self.layout.with_checksum);
        let mut sector_buf = vec![0u8; SECTOR_SIZE];

        for region_sector in 0..self.layout.total_descriptor_sectors() {
            adapter
                .sync_read(DeviceTarget::Cache, 1 + region_sector, &mut sector_buf)
                .map_err(|_| CacheError::MalformedMetadata)?;
            for slot_in_sector in 0..per_sector {
                let slot_idx = (region_sector as usize) * per_sector + slot_in_sector;
                if slot_idx >= self.layout.size as usize {
                    break;
                }
                let desc = decode_slot_descriptor(&sector_buf[slot_in_sector * dsize..(slot_in_sector + 1) * dsize], self.layout.with_checksum)?;
                let on_disk_dirty = desc.state.contains(SlotState::DIRTY);
                let trusted_state = match sb.state {
                    // Unclean shutdown: only DIRTY descriptors are trusted; everything
                    // else is forced INVALID, its payload presumed stale (spec.md §4.F).
                    SbState::Dirty => {
                        if on_disk_dirty {
                            SlotState::VALID | SlotState::DIRTY
                        } else {
                            SlotState::INVALID
                        }
                    }
                    // Slow clean shutdown flushed every dirty block; nothing is DIRTY.
                    SbState::Clean => desc.state & !SlotState::DIRTY,
                    // Fast clean shutdown trusts both CLEAN and DIRTY descriptors verbatim.
                    SbState::FastClean => desc.state,
                    SbState::Unstable => return Err(CacheError::MalformedMetadata),
                };
                let slot = index.slot_mut(slot_idx);
                slot.dbn = desc.dbn;
                slot.state = trusted_state;
                slot.checksum = desc.checksum;
            }
        }
        recompute_nr_dirty(&mut index);

        self.write_superblock(adapter, SbState::Dirty, disk_sectors, cache_sectors)?;
        Ok(index)
    }

    /// `store` (spec.md §4.F): writes every descriptor, then the
    /// superblock with state chosen from `(nr_dirty, had_write_error)`.
    pub fn store(&self, adapter: &dyn IoAdapter, index: &Index, disk_sectors: u64, cache_sectors: u64) -> CacheResult<()> {
        let per_sector = self.layout.descriptors_per_sector();
        let dsize = descriptor_size(self.layout.with_checksum);
        let mut sector_buf = vec![0u8; SECTOR_SIZE];
        let mut had_write_error = false;

        for region_sector in 0..self.layout.total_descriptor_sectors() {
            for slot_in_sector in 0..per_sector {
                let slot_idx = (region_sector as usize) * per_sector + slot_in_sector;
                let desc = if slot_idx < index.len() {
                    let slot = index.slot(slot_idx);
                    SlotDescriptor {
                        dbn: slot.dbn,
                        checksum: if self.layout.with_checksum { slot.checksum } else { None },
                        state: slot.state.to_persisted(),
                    }
                } else {
                    SlotDescriptor { dbn: 0, checksum: None, state: SlotState::INVALID }
                };
                encode_slot_descriptor(&desc, &mut sector_buf[slot_in_sector * dsize..(slot_in_sector + 1) * dsize]);
            }
            if adapter.sync_write(DeviceTarget::Cache, 1 + region_sector, &sector_buf).is_err() {
                had_write_error = true;
            }
        }

        let nr_dirty = index.total_dirty();
        let state = if had_write_error {
            SbState::Unstable
        } else if nr_dirty == 0 {
            SbState::Clean
        } else {
            SbState::FastClean
        };
        self.write_superblock(adapter, state, disk_sectors, cache_sectors)?;
        if had_write_error {
            return Err(CacheError::MetadataWrite);
        }
        Ok(())
    }
}

/// `load` populates slots directly rather than through `set_state`/
/// `clear_state`, so `nr_dirty` has to be reconstructed from the recovered
/// slots once the whole region has been read.
fn recompute_nr_dirty(index: &mut Index) {
    for set_idx in 0..index.n_sets() {
        let assoc = index.assoc() as usize;
        let base = set_idx * assoc;
        let count = (0..assoc).filter(|&local| index.slot(base + local).is_dirty()).count() as u32;
        index.set_nr_dirty_for_recovery(set_idx, count);
    }
}

/// Per-metadata-sector write coalescing: at most one writer per sector at a
/// time; concurrent dirtying transitions to slots sharing a sector queue
/// behind it and are drained on completion (spec.md §4.F, §9).
pub struct MetadataBatcher {
    sectors: BTreeMap<u64, SectorBatch>,
}

#[derive(Default)]
struct SectorBatch {
    in_progress: bool,
    queued: Vec<SlotIndex>,
}

impl MetadataBatcher {
    pub fn new() -> Self {
        MetadataBatcher { sectors: BTreeMap::new() }
    }

    /// Registers that `slot_idx` (whose descriptor lives in `sector`) needs
    /// a metadata write. Returns `true` if the caller should issue the
    /// write now (it becomes the sector's sole writer); `false` if another
    /// write for this sector is already in flight and `slot_idx` was
    /// queued to ride along with it.
    pub fn begin_update(&mut self, sector: u64, slot_idx: SlotIndex) -> bool {
        let batch = self.sectors.entry(sector).or_default();
        if batch.in_progress {
            batch.queued.push(slot_idx);
            false
        } else {
            batch.in_progress = true;
            true
        }
    }

    /// Called when the in-flight write for `sector` completes. Returns the
    /// slots that queued behind it (the caller re-encodes and rewrites the
    /// sector for them, coalesced into one more write if any arrived while
    /// the first was outstanding).
    pub fn complete(&mut self, sector: u64) -> Vec<SlotIndex> {
        let Some(batch) = self.sectors.get_mut(&sector) else { return Vec::new() };
        batch.in_progress = false;
        core::mem::take(&mut batch.queued)
    }
}

impl Default for MetadataBatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MemoryAdapter;
    use alloc::string::ToString;

    fn layout() -> Layout {
        Layout::new(16, 4, 8, false).unwrap()
    }

    fn manager() -> PersistenceManager {
        PersistenceManager::new(layout(), "/dev/disk0".to_string(), "/dev/ssd0".to_string(), 1)
    }

    #[test]
    fn create_then_load_round_trips_an_empty_cache() {
        let pm = manager();
        let adapter = MemoryAdapter::new(1_000_000, pm.layout.md_sectors + pm.layout.size * pm.layout.block_size as u64);
        let index = pm.create(&adapter, false, 1_000_000, 1_000).unwrap();
        assert_eq!(index.len(), 16);
        let reloaded = pm.load(&adapter, 1_000_000, 1_000).unwrap();
        assert_eq!(reloaded.len(), 16);
        for i in 0..reloaded.len() {
            assert!(!reloaded.slot(i).is_valid());
        }
    }

    #[test]
    fn create_without_force_rejects_existing_cache() {
        let pm = manager();
        let cache_sectors = pm.layout.md_sectors + pm.layout.size * pm.layout.block_size as u64;
        let adapter = MemoryAdapter::new(1_000_000, cache_sectors);
        pm.create(&adapter, false, 1_000_000, cache_sectors).unwrap();
        let err = pm.create(&adapter, false, 1_000_000, cache_sectors).unwrap_err();
        assert_eq!(err, CacheError::ExistingCache);
        pm.create(&adapter, true, 1_000_000, cache_sectors).unwrap();
    }

    #[test]
    fn dirty_shutdown_recovery_trusts_only_dirty_descriptors() {
        let pm = manager();
        let cache_sectors = pm.layout.md_sectors + pm.layout.size * pm.layout.block_size as u64;
        let adapter = MemoryAdapter::new(1_000_000, cache_sectors);
        let mut index = pm.create(&adapter, false, 1_000_000, cache_sectors).unwrap();

        let set_idx = index.set_for_dbn(0);
        index.slot_mut(0).dbn = 0;
        index.set_state(set_idx, 0, SlotState::VALID | SlotState::DIRTY);
        let set_idx2 = index.set_for_dbn(8);
        index.slot_mut(4).dbn = 8;
        index.set_state(set_idx2, 4, SlotState::VALID);

        // Persist descriptors directly (simulating in-flight writes before a crash)
        // with superblock left DIRTY, matching an unclean shutdown.
        pm.store(&adapter, &index, 1_000_000, cache_sectors).unwrap();
        let mut sector = [0u8; SECTOR_SIZE];
        adapter.sync_read(DeviceTarget::Cache, 0, &mut sector).unwrap();
        let mut sb = decode_superblock(&sector).unwrap();
        sb.state = SbState::Dirty;
        let bytes = encode_superblock(&sb);
        adapter.sync_write(DeviceTarget::Cache, 0, &bytes).unwrap();

        let recovered = pm.load(&adapter, 1_000_000, cache_sectors).unwrap();
        assert!(recovered.slot(0).is_dirty());
        assert!(recovered.slot(0).is_valid());
        assert!(!recovered.slot(4).is_valid());
    }

    #[test]
    fn metadata_batcher_queues_concurrent_updates_to_the_same_sector() {
        let mut batcher = MetadataBatcher::new();
        assert!(batcher.begin_update(0, 1));
        assert!(!batcher.begin_update(0, 2));
        let queued = batcher.complete(0);
        assert_eq!(queued, vec![2]);
        assert!(batcher.begin_update(0, 3));
    }
}
