//! Engine counters and the I/O-size histogram.
//!
//! Counters that need not be atomic with slot-state transitions may be
//! updated without the instance lock (spec.md §5); hence plain `AtomicU64`
//! rather than lock-guarded fields. Grounded on `writecache.rs`'s
//! `CacheStats`, widened with the counter names spec.md §4/§6/§8 name
//! explicitly (`noroom`, `cleanings`, `replace`, `checksum_invalid`, the
//! front/back merge counters, the per-limit-reached counters) and the
//! `size_hist[33]` histogram from `flashcache_conf.c`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of 512-byte buckets in the I/O-size histogram, 512 B..16 KiB
/// (spec.md §6), matching `flashcache_conf.c`'s `size_hist[33]`.
pub const HISTOGRAM_BUCKETS: usize = 33;

/// Engine-wide counters. All fields are independently atomic; a reader
/// assembling a status snapshot accepts that the fields may not be mutually
/// consistent (spec.md §5).
#[derive(Default)]
pub struct Stats {
    pub read_hits: AtomicU64,
    pub read_misses: AtomicU64,
    pub write_hits: AtomicU64,
    pub write_misses: AtomicU64,
    pub uncached_reads: AtomicU64,
    pub uncached_writes: AtomicU64,
    pub noroom: AtomicU64,
    pub cleanings: AtomicU64,
    pub replace: AtomicU64,
    pub write_front_merge: AtomicU64,
    pub write_back_merge: AtomicU64,
    pub checksum_invalid: AtomicU64,
    pub set_limit_reached: AtomicU64,
    pub total_limit_reached: AtomicU64,
    pub pending_jobs_count: AtomicU64,
    pub disk_read_errors: AtomicU64,
    pub disk_write_errors: AtomicU64,
    pub cache_read_errors: AtomicU64,
    pub cache_write_errors: AtomicU64,
    pub metadata_write_errors: AtomicU64,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one I/O of `size_bytes` into the 512 B-wide histogram
    /// buckets, clamping anything at or above the top bucket into it.
    pub fn record_io_size(&self, size_bytes: usize) {
        let bucket = (size_bytes / 512).min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn histogram_snapshot(&self) -> [u64; HISTOGRAM_BUCKETS] {
        let mut out = [0u64; HISTOGRAM_BUCKETS];
        for (dst, src) in out.iter_mut().zip(self.histogram.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        out
    }

    /// Resets every counter to zero (`zero_stats` control input, spec.md §6).
    pub fn zero(&self) {
        self.read_hits.store(0, Ordering::Relaxed);
        self.read_misses.store(0, Ordering::Relaxed);
        self.write_hits.store(0, Ordering::Relaxed);
        self.write_misses.store(0, Ordering::Relaxed);
        self.uncached_reads.store(0, Ordering::Relaxed);
        self.uncached_writes.store(0, Ordering::Relaxed);
        self.noroom.store(0, Ordering::Relaxed);
        self.cleanings.store(0, Ordering::Relaxed);
        self.replace.store(0, Ordering::Relaxed);
        self.write_front_merge.store(0, Ordering::Relaxed);
        self.write_back_merge.store(0, Ordering::Relaxed);
        self.checksum_invalid.store(0, Ordering::Relaxed);
        self.set_limit_reached.store(0, Ordering::Relaxed);
        self.total_limit_reached.store(0, Ordering::Relaxed);
        self.disk_read_errors.store(0, Ordering::Relaxed);
        self.disk_write_errors.store(0, Ordering::Relaxed);
        self.cache_read_errors.store(0, Ordering::Relaxed);
        self.cache_write_errors.store(0, Ordering::Relaxed);
        self.metadata_write_errors.store(0, Ordering::Relaxed);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}
