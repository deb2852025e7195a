//! Block I/O Adapter: the seam between the engine and the two physical
//! devices (backing disk, cache device).
//!
//! Grounded on `storage/block.rs`'s `BlockDevice` trait (`read_blocks`/
//! `write_blocks`, sector-offset + count + flat buffer shape), split into a
//! synchronous path (metadata only, spec.md §4.A) and an asynchronous,
//! callback-driven path (payload and cleaning I/O, spec.md §4.A, §5 "the
//! Request Engine never blocks while holding the index lock"). The adapter
//! never retries; retry policy lives in the engine (spec.md §4.A, §7).

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::CacheError;
use crate::types::SECTOR_SIZE;

/// Which physical device an I/O targets; error classification depends on
/// this (spec.md §4.A: `DiskRead`/`DiskWrite` vs `CacheRead`/`CacheWrite`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTarget {
    Disk,
    Cache,
}

impl DeviceTarget {
    pub fn read_error(self) -> CacheError {
        match self {
            DeviceTarget::Disk => CacheError::DiskRead,
            DeviceTarget::Cache => CacheError::CacheRead,
        }
    }

    pub fn write_error(self) -> CacheError {
        match self {
            DeviceTarget::Disk => CacheError::DiskWrite,
            DeviceTarget::Cache => CacheError::CacheWrite,
        }
    }
}

/// Invoked exactly once, from whatever context completes the I/O (may be
/// the calling thread for a synchronous-underneath implementation, or a
/// device interrupt/completion-queue thread). The adapter never calls it
/// more than once, and never synthesizes a success after a real failure.
pub type IoCompletion = Box<dyn FnOnce(Result<(), CacheError>) + Send>;

/// The interface the engine and cleaner consume to move bytes to and from
/// the two devices. Implementations own the actual device handles; this
/// crate never opens a device itself (spec.md §1: the block-device
/// integration shim is an external collaborator).
pub trait IoAdapter: Send + Sync {
    /// Total sectors available on `target`.
    fn sector_count(&self, target: DeviceTarget) -> u64;

    /// Synchronous, vectored read/write against a device region. Used only
    /// for metadata (superblock, descriptor region): `buf.len()` must be an
    /// exact multiple of `SECTOR_SIZE`.
    fn sync_read(&self, target: DeviceTarget, sector_offset: u64, buf: &mut [u8]) -> Result<(), CacheError>;
    fn sync_write(&self, target: DeviceTarget, sector_offset: u64, buf: &[u8]) -> Result<(), CacheError>;

    /// Asynchronous sector-granular I/O with a completion callback. Used
    /// for block payload and cleaner write-back. `buf` must outlive the
    /// call until `completion` fires; implementations that are actually
    /// synchronous underneath may call `completion` before returning.
    fn async_read(&self, target: DeviceTarget, sector_offset: u64, buf: &mut [u8], completion: IoCompletion);
    fn async_write(&self, target: DeviceTarget, sector_offset: u64, buf: &[u8], completion: IoCompletion);
}

/// Allocates a zeroed, sector-aligned bounce buffer of `n_sectors` sectors,
/// used when the caller's buffer shape (e.g. a page list) doesn't match the
/// flat byte slice `IoAdapter` expects (spec.md §2.A "bounce-page
/// management").
pub fn alloc_bounce_buffer(n_sectors: usize) -> Vec<u8> {
    vec![0u8; n_sectors * SECTOR_SIZE]
}
