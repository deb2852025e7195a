//! Global list of cache instances and tunable fan-out.
//!
//! Grounded on `flashcache_conf.c`'s global cache-instance list (protected
//! there by a single bit-lock) and `storage/writecache.rs`'s `Once`-backed
//! global singleton pattern; widened into a reader-writer lock per spec.md
//! §9's accepted refinement ("a reader-writer lock is an acceptable
//! refinement provided the reboot notifier remains a writer").

use alloc::string::String;
use alloc::vec::Vec;

use spin::RwLock;

use crate::adapter::IoAdapter;
use crate::control::Tunables;
use crate::engine::{BlockAlignedOnly, CacheabilityPolicy};
use crate::instance::CacheInstance;

/// One registered instance: a name (the cache device path is the natural
/// choice) plus the instance itself.
pub struct RegisteredInstance<A: IoAdapter, P: CacheabilityPolicy = BlockAlignedOnly> {
    pub name: String,
    pub instance: CacheInstance<A, P>,
}

/// Holds every live cache instance in the process. Readers (status export,
/// iteration) and writers (register, unregister, tunable fan-out) all go
/// through this lock; only construction/destruction and broadcast tunable
/// updates take the write side (spec.md §9).
pub struct Registry<A: IoAdapter, P: CacheabilityPolicy = BlockAlignedOnly> {
    instances: RwLock<Vec<RegisteredInstance<A, P>>>,
}

impl<A: IoAdapter, P: CacheabilityPolicy> Registry<A, P> {
    pub const fn new() -> Self {
        Registry { instances: RwLock::new(Vec::new()) }
    }

    pub fn register(&self, name: String, instance: CacheInstance<A, P>) {
        self.instances.write().push(RegisteredInstance { name, instance });
    }

    /// Removes and returns the named instance, if present, so the caller
    /// can run its shutdown sequence outside the registry lock.
    pub fn unregister(&self, name: &str) -> Option<RegisteredInstance<A, P>> {
        let mut guard = self.instances.write();
        let pos = guard.iter().position(|r| r.name == name)?;
        Some(guard.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Runs `f` against the named instance under the read lock.
    pub fn with_instance<R>(&self, name: &str, f: impl FnOnce(&CacheInstance<A, P>) -> R) -> Option<R> {
        let guard = self.instances.read();
        guard.iter().find(|r| r.name == name).map(|r| f(&r.instance))
    }

    /// `zero_stats`: resets counters on every registered instance.
    pub fn zero_all_stats(&self) {
        let guard = self.instances.read();
        for entry in guard.iter() {
            entry.instance.engine.stats.zero();
        }
    }

    /// `do_sync` across all instances.
    pub fn sync_all(&self) {
        let guard = self.instances.read();
        for entry in guard.iter() {
            entry.instance.sync();
        }
    }

    pub fn stop_sync_all(&self) {
        let guard = self.instances.read();
        for entry in guard.iter() {
            entry.instance.stop_sync();
        }
    }

    /// Fans a tunable change out to every registered instance.
    pub fn broadcast_tunables(&self, tunables: Tunables) {
        let guard = self.instances.read();
        for entry in guard.iter() {
            *entry.instance.engine.tunables.lock() = tunables.clone();
        }
    }
}

impl<A: IoAdapter, P: CacheabilityPolicy> Default for Registry<A, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MemoryAdapter;
    use crate::instance::ConstructionArgs;
    use crate::persistence::PersistenceMode;
    use alloc::string::ToString;

    fn build_instance() -> CacheInstance<MemoryAdapter> {
        let adapter = MemoryAdapter::new(1_000_000, 16 * 8 + 64);
        let mut args = ConstructionArgs::new("/dev/disk0", "/dev/ssd0", PersistenceMode::Create);
        args.block_size = 8;
        args.assoc = 4;
        args.cache_size_sectors = Some(16 * 8 + 64);
        CacheInstance::construct(adapter, args, Tunables::default()).unwrap()
    }

    #[test]
    fn register_then_lookup_then_unregister() {
        let registry: Registry<MemoryAdapter> = Registry::new();
        registry.register("cache0".to_string(), build_instance());
        assert_eq!(registry.len(), 1);
        let dirty = registry.with_instance("cache0", |inst| inst.engine.total_dirty());
        assert_eq!(dirty, Some(0));
        assert!(registry.unregister("cache0").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_tunables_updates_every_instance() {
        let registry: Registry<MemoryAdapter> = Registry::new();
        registry.register("cache0".to_string(), build_instance());
        let mut tunables = Tunables::default();
        tunables.set_dirty_thresh_pct(50);
        registry.broadcast_tunables(tunables);
        let pct = registry.with_instance("cache0", |inst| inst.engine.tunables.lock().dirty_thresh_pct);
        assert_eq!(pct, Some(50));
    }
}
