//! Set-associative, write-back block cache engine with crash-consistent
//! metadata.
//!
//! Interposes between a client and a slow backing disk, using a fast cache
//! device as a persistent write-back cache. Owns the index, the per-request
//! state machine, the dirty-block cleaner, and the on-device metadata
//! format; the block-device shim, control surface, and kernel I/O
//! primitives are external collaborators this crate only defines interfaces
//! for (see [`adapter::IoAdapter`] and [`control`]).
//!
//! `no_std` by default; enable the `std` feature (on by default via the
//! crate's `default` feature set) for `std::error::Error` on [`error::CacheError`]
//! and for the in-memory test adapter's dependency on `spin`'s std-friendly
//! mutex behavior. Enable `checksum` to widen the on-device slot descriptor
//! with an integrity digest (spec.md §9 "checksums are optional").

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod adapter;
pub mod cleaner;
pub mod codec;
pub mod control;
pub mod engine;
pub mod error;
pub mod index;
pub mod instance;
pub mod persistence;
pub mod policy;
pub mod pool;
pub mod registry;
#[cfg(test)]
mod scenarios;
pub mod set;
pub mod slot;
pub mod stats;
pub mod types;

pub use adapter::{DeviceTarget, IoAdapter, IoCompletion};
pub use control::Tunables;
pub use engine::Engine;
pub use error::{CacheError, CacheResult};
pub use index::Index;
pub use instance::{CacheInstance, ConstructionArgs};
pub use persistence::{Layout, PersistenceManager, PersistenceMode};
pub use policy::ReclaimPolicy;
pub use registry::Registry;
pub use slot::{Slot, SlotState};
pub use types::{Dbn, SECTOR_SIZE};
