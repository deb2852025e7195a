//! A cache set: `assoc` consecutive slots and the per-set bookkeeping the
//! replacement policy and cleaner need.

use crate::types::LRU_NULL;

/// Group of `assoc` consecutive slots, all candidate locations for a given
/// DBN (spec.md §3).
#[derive(Debug, Clone)]
pub struct CacheSet {
    /// FIFO cursor, local offset within the set (used when the replacement
    /// policy is FIFO).
    pub fifo_next: u32,
    /// Cleaner scan cursor, local offset within the set.
    pub clean_next: u32,
    /// Count of DIRTY slots in the set.
    pub nr_dirty: u32,
    /// Count of in-flight cleanings for the set.
    pub clean_inprog: u32,
    /// Head/tail of the per-set LRU list, local offsets.
    pub lru_head: u32,
    pub lru_tail: u32,
}

impl CacheSet {
    pub fn new() -> Self {
        CacheSet {
            fifo_next: 0,
            clean_next: 0,
            nr_dirty: 0,
            clean_inprog: 0,
            lru_head: LRU_NULL,
            lru_tail: LRU_NULL,
        }
    }

    /// A set whose dirty count has crossed the threshold is a cleaning
    /// candidate (spec.md §3).
    pub fn is_clean_candidate(&self, dirty_thresh_set: u32) -> bool {
        self.nr_dirty >= dirty_thresh_set
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        Self::new()
    }
}
