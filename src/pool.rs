//! Pre-allocated object pools for request and pending descriptors.
//!
//! Grounded on `flashcache_conf.c`'s `mempool_create(MIN_JOBS, ...)` for the
//! cache-job and pending-job pools, and its `nr_cache_jobs`/`nr_pending_jobs`
//! atomic counters used to gate the destroy path on outstanding I/O
//! (spec.md §5 "the destroy path waits on `nr_jobs == 0`").

use core::sync::atomic::{AtomicU32, Ordering};

/// Floor on pool capacity: guarantees forward progress under memory
/// pressure by never letting a pool shrink to zero (spec.md §5).
pub const MIN_JOBS: u32 = 1024;

/// A capacity-bounded counter standing in for a pre-allocated descriptor
/// pool. Real descriptor storage (request/pending state) lives inline in
/// the Engine's per-request structures; this tracks how many are
/// outstanding against the configured ceiling, returning `None` on
/// exhaustion so the Engine can answer with `NoRoom` instead of blocking
/// (spec.md §5).
pub struct JobPool {
    capacity: u32,
    in_use: AtomicU32,
}

impl JobPool {
    /// `requested` is raised to `MIN_JOBS` if smaller.
    pub fn new(requested: u32) -> Self {
        JobPool {
            capacity: requested.max(MIN_JOBS),
            in_use: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Reserves one slot, returning `false` (no blocking) if the pool is
    /// exhausted.
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.in_use.load(Ordering::Relaxed);
            if current >= self.capacity {
                return false;
            }
            if self
                .in_use
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_drained(&self) -> bool {
        self.in_use() == 0
    }
}

/// The pair of pools a cache instance holds: cache-job descriptors (one per
/// in-flight client/cleaner I/O) and pending-job descriptors (one per
/// queued request behind a pinned slot).
pub struct JobPools {
    pub cache_jobs: JobPool,
    pub pending_jobs: JobPool,
}

impl JobPools {
    pub fn new(cache_job_capacity: u32, pending_job_capacity: u32) -> Self {
        JobPools {
            cache_jobs: JobPool::new(cache_job_capacity),
            pending_jobs: JobPool::new(pending_job_capacity),
        }
    }

    /// Whether the destroy path may proceed: no outstanding cache or
    /// pending jobs (spec.md §5).
    pub fn all_drained(&self) -> bool {
        self.cache_jobs.is_drained() && self.pending_jobs.is_drained()
    }
}
