//! End-to-end scenario suite (spec.md §8): drives whole `CacheInstance`
//! lifecycles — construct, read/write, crash or shutdown, reload — against
//! the in-memory mock adapter, using the literal configuration spec.md §8
//! fixes its scenarios to: `block_size = 8` sectors, `assoc = 4`, `size = 16`
//! blocks, 4 sets.

use alloc::vec;

use crate::adapter::mock::MemoryAdapter;
use crate::adapter::DeviceTarget;
use crate::control::Tunables;
use crate::engine::CacheabilityPolicy;
use crate::instance::{CacheInstance, ConstructionArgs};
use crate::persistence::PersistenceMode;
use crate::types::{Dbn, SECTOR_SIZE};

const BLOCK_SECTORS: u32 = 8;
const ASSOC: u32 = 4;
const N_BLOCKS: u64 = 16;
const BLOCK_BYTES: usize = BLOCK_SECTORS as usize * SECTOR_SIZE;

/// Total cache-device sectors that back out to exactly `N_BLOCKS` usable
/// blocks through `CacheInstance`'s sectors→blocks solve (metadata region +
/// payload region, no slack) — needed so the scenario assertions below can
/// rely on spec.md §8's literal 4-set geometry.
fn exact_cache_sectors() -> u64 {
    crate::codec::md_sectors(N_BLOCKS, false) + N_BLOCKS * BLOCK_SECTORS as u64
}

fn args(mode: PersistenceMode) -> ConstructionArgs {
    let mut args = ConstructionArgs::new("/dev/disk0", "/dev/ssd0", mode);
    args.block_size = BLOCK_SECTORS;
    args.assoc = ASSOC;
    args.cache_size_sectors = Some(exact_cache_sectors());
    args
}

fn new_adapter() -> MemoryAdapter {
    MemoryAdapter::new(1_000_000, exact_cache_sectors() + 64)
}

#[test]
fn scenario_1_write_then_read_hit() {
    let instance = CacheInstance::construct(new_adapter(), args(PersistenceMode::Create), Tunables::default()).unwrap();
    let payload = vec![0xAAu8; BLOCK_BYTES];
    instance.write(0, BLOCK_SECTORS, &payload).unwrap();

    let mut out = vec![0u8; BLOCK_BYTES];
    instance.read(0, BLOCK_SECTORS, &mut out).unwrap();
    assert_eq!(out, payload);
    assert_eq!(instance.engine.total_dirty(), 1);
}

#[test]
fn scenario_2_read_miss_fills_cache() {
    let instance = CacheInstance::construct(new_adapter(), args(PersistenceMode::Create), Tunables::default()).unwrap();

    // Backing disk has 0xBB at DBN 8; hash_block(8, 8, 4) = 1 (spec.md §8).
    let seeded = vec![0xBBu8; BLOCK_BYTES];
    instance
        .engine
        .adapter()
        .sync_write(DeviceTarget::Disk, 8, &seeded)
        .unwrap();

    let mut out = vec![0u8; BLOCK_BYTES];
    instance.read(8, BLOCK_SECTORS, &mut out).unwrap();
    assert_eq!(out, seeded);
    assert_eq!(instance.engine.with_index(|idx| idx.set_for_dbn(8)), 1);

    let mut out2 = vec![0u8; BLOCK_BYTES];
    instance.read(8, BLOCK_SECTORS, &mut out2).unwrap();
    assert_eq!(
        instance.engine.stats.read_hits.load(core::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn scenario_3_victim_write_back_on_fifo_eviction() {
    let instance = CacheInstance::construct(new_adapter(), args(PersistenceMode::Create), Tunables::default()).unwrap();

    // Block numbers 0, 4, 8, 12 all reduce to set 0 (block_number mod 4 sets).
    let first_set_dbns: [Dbn; 4] = [0, 4 * BLOCK_SECTORS as u64, 8 * BLOCK_SECTORS as u64, 12 * BLOCK_SECTORS as u64];
    for (i, &dbn) in first_set_dbns.iter().enumerate() {
        assert_eq!(instance.engine.with_index(|idx| idx.set_for_dbn(dbn)), 0);
        let payload = vec![(0x10 + i) as u8; BLOCK_BYTES];
        instance.write(dbn, BLOCK_SECTORS, &payload).unwrap();
    }
    assert_eq!(instance.engine.total_dirty(), 4);

    // A fifth DBN hashing to the same set evicts the first-inserted slot
    // (FIFO is the default reclaim policy).
    let fifth_dbn = 16 * BLOCK_SECTORS as u64;
    assert_eq!(instance.engine.with_index(|idx| idx.set_for_dbn(fifth_dbn)), 0);
    let payload = vec![0xFFu8; BLOCK_BYTES];
    instance.write(fifth_dbn, BLOCK_SECTORS, &payload).unwrap();

    assert_eq!(
        instance.engine.stats.cleanings.load(core::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(
        instance.engine.stats.replace.load(core::sync::atomic::Ordering::Relaxed),
        1
    );
    // The evicted slot's payload must have reached the backing disk before reuse.
    let mut from_disk = vec![0u8; BLOCK_BYTES];
    instance
        .engine
        .adapter()
        .sync_read(DeviceTarget::Disk, first_set_dbns[0], &mut from_disk)
        .unwrap();
    assert_eq!(from_disk, vec![0x10u8; BLOCK_BYTES]);
    // Still 4 dirty in the set: one evicted (written back, no longer dirty), one freshly installed.
    assert_eq!(instance.engine.total_dirty(), 4);
}

#[test]
fn scenario_4_crash_recovery_trusts_only_dirty_slots() {
    let adapter = new_adapter();
    let reopened_adapter = adapter.clone();

    {
        let instance = CacheInstance::construct(adapter, args(PersistenceMode::Create), Tunables::default()).unwrap();
        for dbn in [0u64, 8, 16] {
            let payload = vec![0x77u8; BLOCK_BYTES];
            instance.write(dbn, BLOCK_SECTORS, &payload).unwrap();
        }
        assert_eq!(instance.engine.total_dirty(), 3);
        // No `shutdown()` call: the instance is simply dropped here, standing in
        // for a crash. The per-write metadata batching has already persisted
        // each dirty descriptor; the superblock is still DIRTY from `create`.
    }

    let recovered = CacheInstance::construct(reopened_adapter, args(PersistenceMode::Reload), Tunables::default()).unwrap();
    assert_eq!(recovered.engine.total_dirty(), 3);
    for dbn in [0u64, 8, 16] {
        let set_idx = recovered.engine.with_index(|idx| idx.set_for_dbn(dbn));
        let found = recovered.engine.with_index(|idx| {
            let assoc = idx.assoc() as usize;
            let base = set_idx * assoc;
            (0..assoc).any(|local| {
                let slot = idx.slot(base + local);
                slot.dbn == dbn && slot.is_valid() && slot.is_dirty()
            })
        });
        assert!(found, "DBN {dbn} should have recovered DIRTY+VALID");
    }
}

#[test]
fn scenario_5_fast_remove_recovers_all_dirty_slots() {
    let adapter = new_adapter();
    let reopened_adapter = adapter.clone();
    let dbns: [Dbn; 5] = [0, 8, 16, 24, 4 * BLOCK_SECTORS as u64];

    {
        let mut tunables = Tunables::default();
        tunables.fast_remove = true;
        let instance = CacheInstance::construct(adapter, args(PersistenceMode::Create), tunables).unwrap();
        for &dbn in &dbns {
            let payload = vec![0x99u8; BLOCK_BYTES];
            instance.write(dbn, BLOCK_SECTORS, &payload).unwrap();
        }
        assert_eq!(instance.engine.total_dirty(), 5);
        instance.shutdown().unwrap();
    }

    let recovered = CacheInstance::construct(reopened_adapter, args(PersistenceMode::Reload), Tunables::default()).unwrap();
    assert_eq!(recovered.engine.total_dirty(), 5);
}

/// Stand-in for a Control Surface PID deny-list decision (spec.md §4.D
/// "Uncacheable", §4.G): the core only consumes the yes/no answer through
/// `CacheabilityPolicy`, so a denied-PID policy is just one that always
/// answers `false`.
struct DenyAllPolicy;

impl CacheabilityPolicy for DenyAllPolicy {
    fn is_cacheable(&self, _dbn: Dbn, _len_sectors: u32, _block_size: u32) -> bool {
        false
    }
}

#[test]
fn scenario_6_denied_pid_bypasses_the_cache() {
    let instance = CacheInstance::construct_with_policy(new_adapter(), args(PersistenceMode::Create), Tunables::default(), DenyAllPolicy).unwrap();
    let payload = vec![0x55u8; BLOCK_BYTES];
    instance.write(0, BLOCK_SECTORS, &payload).unwrap();

    assert_eq!(instance.engine.total_dirty(), 0);
    assert_eq!(
        instance.engine.stats.uncached_writes.load(core::sync::atomic::Ordering::Relaxed),
        1
    );
    let mut out = vec![0u8; BLOCK_BYTES];
    instance.engine.adapter().sync_read(DeviceTarget::Disk, 0, &mut out).unwrap();
    assert_eq!(out, payload);
}
