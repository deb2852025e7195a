//! Error kinds for the cache engine.
//!
//! One flat enum, classified the way the I/O completion path needs it:
//! callers branch on the kind (demote a slot on `CacheRead`/`CacheWrite`,
//! propagate `DiskRead`/`DiskWrite` to the client) rather than downcasting a
//! boxed error.

use core::fmt;

/// Error returned by any fallible engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// A construction argument or tunable was out of range.
    ConfigInvalid,
    /// Opening the disk or cache device handle failed.
    DeviceOpen,
    /// `create` found a live superblock and `force` was not set.
    ExistingCache,
    /// A superblock or descriptor failed to decode.
    MalformedMetadata,
    /// Allocation of the slot table or a request/pending descriptor failed.
    MemoryExhausted,
    /// Backing-disk read failed.
    DiskRead,
    /// Backing-disk write failed.
    DiskWrite,
    /// Cache-device read failed.
    CacheRead,
    /// Cache-device write failed.
    CacheWrite,
    /// A metadata-sector write failed.
    MetadataWrite,
    /// The operation was aborted (`stop_sync`, shutdown).
    Aborted,
}

impl CacheError {
    /// True for errors that originate on the cache device rather than the
    /// backing disk: these demote the slot and retry against disk where
    /// possible (spec.md §4.D, §7), instead of failing the client.
    pub fn is_cache_device_error(self) -> bool {
        matches!(self, CacheError::CacheRead | CacheError::CacheWrite)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CacheError::ConfigInvalid => "invalid configuration",
            CacheError::DeviceOpen => "failed to open device",
            CacheError::ExistingCache => "a cache already exists on this device",
            CacheError::MalformedMetadata => "malformed on-device metadata",
            CacheError::MemoryExhausted => "out of memory",
            CacheError::DiskRead => "backing disk read failed",
            CacheError::DiskWrite => "backing disk write failed",
            CacheError::CacheRead => "cache device read failed",
            CacheError::CacheWrite => "cache device write failed",
            CacheError::MetadataWrite => "metadata sector write failed",
            CacheError::Aborted => "operation aborted",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CacheError {}

/// Shorthand result type used throughout the engine.
pub type CacheResult<T> = core::result::Result<T, CacheError>;
