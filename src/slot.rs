//! A single cache slot: its persistent disk-block-number, its transient
//! state flags, and its LRU linkage within its set.

use bitflags::bitflags;

use crate::types::{Dbn, LRU_NULL};

bitflags! {
    /// Transient + persistent state of a slot. `INVALID`/`VALID` and `DIRTY`
    /// are the only flags the metadata codec persists (spec.md §3, §4.B);
    /// the rest are in-memory-only pins.
    ///
    /// Grounded on `storage/writecache.rs`'s `CacheState` enum, widened from
    /// four mutually-exclusive states into an orthogonal flag set because the
    /// spec requires several in-progress flags to coexist with VALID/DIRTY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotState: u32 {
        const INVALID                    = 0;
        const VALID                      = 1 << 0;
        const DIRTY                      = 1 << 1;
        const DISK_READ_IN_PROGRESS      = 1 << 2;
        const CACHE_WRITE_IN_PROGRESS    = 1 << 3;
        const CACHE_READ_IN_PROGRESS     = 1 << 4;
        const DISK_WRITE_IN_PROGRESS     = 1 << 5;
        const WRITE_BACK_IN_PROGRESS     = 1 << 6;
        const META_WRITE_IN_PROGRESS     = 1 << 7;
        /// A slot is being installed with a new DBN: it matches neither its
        /// old nor its new DBN for lookup purposes (spec.md §9 open
        /// question — resolved with an explicit flag instead of relying on
        /// legacy dbn-overwrite-before-invalidate ordering).
        const INSTALLING                 = 1 << 8;
    }
}

impl SlotState {
    /// Persisted bits only (spec.md §4.B: "transient flags are never
    /// persisted").
    pub const PERSISTED_MASK: SlotState =
        SlotState::from_bits_truncate(SlotState::VALID.bits() | SlotState::DIRTY.bits());

    /// Any `*_IN_PROGRESS` flag pins the slot against victim selection
    /// (spec.md §3, §4.C).
    pub const IN_PROGRESS_MASK: SlotState = SlotState::from_bits_truncate(
        SlotState::DISK_READ_IN_PROGRESS.bits()
            | SlotState::CACHE_WRITE_IN_PROGRESS.bits()
            | SlotState::CACHE_READ_IN_PROGRESS.bits()
            | SlotState::DISK_WRITE_IN_PROGRESS.bits()
            | SlotState::WRITE_BACK_IN_PROGRESS.bits()
            | SlotState::META_WRITE_IN_PROGRESS.bits(),
    );

    pub fn is_in_progress(self) -> bool {
        self.intersects(SlotState::IN_PROGRESS_MASK)
    }

    pub fn to_persisted(self) -> SlotState {
        self & SlotState::PERSISTED_MASK
    }
}

/// One cacheable position on the cache device.
#[derive(Debug, Clone)]
pub struct Slot {
    pub dbn: Dbn,
    pub state: SlotState,
    /// Client requests queued behind this slot while it is pinned
    /// (spec.md §4.D "Conflict").
    pub nr_queued: u32,
    /// Integrity digest of the cached payload; only meaningful under the
    /// `checksum` feature.
    pub checksum: Option<u64>,
    /// Offsets (within the owning set) of the previous/next slot on the
    /// per-set LRU list.
    pub lru_prev: u32,
    pub lru_next: u32,
}

impl Slot {
    pub fn new_invalid() -> Self {
        Slot {
            dbn: 0,
            state: SlotState::INVALID,
            nr_queued: 0,
            checksum: None,
            lru_prev: LRU_NULL,
            lru_next: LRU_NULL,
        }
    }

    /// A slot is pinned (may not be chosen as a victim, may not be freed or
    /// have its `dbn` changed) while any `*_IN_PROGRESS` flag is set or
    /// requests are queued behind it (spec.md §3).
    pub fn is_pinned(&self) -> bool {
        self.state.is_in_progress() || self.nr_queued > 0
    }

    pub fn is_valid(&self) -> bool {
        self.state.contains(SlotState::VALID)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.contains(SlotState::DIRTY)
    }

    /// Whether this slot is mid-installation and therefore matches neither
    /// its old nor its prospective new DBN for lookup (spec.md §9).
    pub fn is_installing(&self) -> bool {
        self.state.contains(SlotState::INSTALLING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_dirty_implies_valid_is_enforced_by_construction() {
        let mut slot = Slot::new_invalid();
        slot.state = SlotState::VALID | SlotState::DIRTY;
        assert!(slot.is_valid());
        assert!(slot.is_dirty());
    }

    #[test]
    fn in_progress_flags_pin_a_slot() {
        let mut slot = Slot::new_invalid();
        assert!(!slot.is_pinned());
        slot.state |= SlotState::CACHE_READ_IN_PROGRESS;
        assert!(slot.is_pinned());
    }

    #[test]
    fn queued_requests_pin_a_slot() {
        let mut slot = Slot::new_invalid();
        slot.nr_queued = 1;
        assert!(slot.is_pinned());
    }

    #[test]
    fn persisted_mask_drops_transient_flags() {
        let transient = SlotState::VALID | SlotState::DIRTY | SlotState::CACHE_READ_IN_PROGRESS;
        assert_eq!(transient.to_persisted(), SlotState::VALID | SlotState::DIRTY);
    }
}
