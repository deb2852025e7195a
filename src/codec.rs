//! On-device metadata format: superblock (sector 0) and per-slot descriptors
//! (packed into the descriptor region).
//!
//! Grounded on `storage/gpt.rs`'s fixed-layout on-disk header parsing, but
//! encoded with explicit little-endian byte slicing rather than
//! `repr(C, packed)` pointer casts: the spec requires byte-exact,
//! little-endian compatibility with legacy on-disk images (spec.md §4.B,
//! §6), which a pointer cast over a `Vec<u8>` buffer cannot guarantee across
//! host endianness or alignment.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{CacheError, CacheResult};
use crate::slot::SlotState;
use crate::types::{Dbn, DEV_PATHLEN, SECTOR_SIZE};

/// Magic value identifying a superblock written by this codec.
const SUPERBLOCK_MAGIC: u32 = 0xF1A5_CAC4;

/// Superblock shutdown state (spec.md §3, §4.F, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SbState {
    Dirty = 1,
    Clean = 2,
    FastClean = 3,
    Unstable = 4,
}

impl SbState {
    fn from_u32(value: u32) -> CacheResult<Self> {
        match value {
            1 => Ok(SbState::Dirty),
            2 => Ok(SbState::Clean),
            3 => Ok(SbState::FastClean),
            4 => Ok(SbState::Unstable),
            _ => Err(CacheError::MalformedMetadata),
        }
    }
}

/// Decoded superblock contents.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub state: SbState,
    pub block_size: u32,
    pub size: u64,
    pub assoc: u32,
    pub disk_name: String,
    pub cache_name: String,
    pub disk_sectors: u64,
    pub cache_sectors: u64,
    pub cache_version: u32,
}

fn write_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

fn read_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encodes a superblock into exactly `SECTOR_SIZE` bytes.
#[allow(clippy::too_many_arguments)]
pub fn encode_superblock(sb: &Superblock) -> [u8; SECTOR_SIZE] {
    let mut out = [0u8; SECTOR_SIZE];
    let mut off = 0usize;

    out[off..off + 4].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
    off += 4;
    out[off..off + 4].copy_from_slice(&(sb.state as u32).to_le_bytes());
    off += 4;
    out[off..off + 4].copy_from_slice(&sb.block_size.to_le_bytes());
    off += 4;
    out[off..off + 8].copy_from_slice(&sb.size.to_le_bytes());
    off += 8;
    out[off..off + 4].copy_from_slice(&sb.assoc.to_le_bytes());
    off += 4;
    write_fixed_str(&mut out[off..off + DEV_PATHLEN], &sb.disk_name);
    off += DEV_PATHLEN;
    write_fixed_str(&mut out[off..off + DEV_PATHLEN], &sb.cache_name);
    off += DEV_PATHLEN;
    out[off..off + 8].copy_from_slice(&sb.disk_sectors.to_le_bytes());
    off += 8;
    out[off..off + 8].copy_from_slice(&sb.cache_sectors.to_le_bytes());
    off += 8;
    out[off..off + 4].copy_from_slice(&sb.cache_version.to_le_bytes());

    out
}

/// Decodes a superblock from a `SECTOR_SIZE`-byte sector, rejecting bad
/// magic, bad state, or non-power-of-two geometry.
pub fn decode_superblock(sector: &[u8; SECTOR_SIZE]) -> CacheResult<Superblock> {
    let mut off = 0usize;
    let magic = u32::from_le_bytes(sector[off..off + 4].try_into().unwrap());
    off += 4;
    if magic != SUPERBLOCK_MAGIC {
        return Err(CacheError::MalformedMetadata);
    }
    let state = SbState::from_u32(u32::from_le_bytes(sector[off..off + 4].try_into().unwrap()))?;
    off += 4;
    let block_size = u32::from_le_bytes(sector[off..off + 4].try_into().unwrap());
    off += 4;
    let size = u64::from_le_bytes(sector[off..off + 8].try_into().unwrap());
    off += 8;
    let assoc = u32::from_le_bytes(sector[off..off + 4].try_into().unwrap());
    off += 4;
    let disk_name = read_fixed_str(&sector[off..off + DEV_PATHLEN]);
    off += DEV_PATHLEN;
    let cache_name = read_fixed_str(&sector[off..off + DEV_PATHLEN]);
    off += DEV_PATHLEN;
    let disk_sectors = u64::from_le_bytes(sector[off..off + 8].try_into().unwrap());
    off += 8;
    let cache_sectors = u64::from_le_bytes(sector[off..off + 8].try_into().unwrap());
    off += 8;
    let cache_version = u32::from_le_bytes(sector[off..off + 4].try_into().unwrap());

    if !crate::types::is_pow2(block_size) || !crate::types::is_pow2(assoc) {
        return Err(CacheError::MalformedMetadata);
    }

    Ok(Superblock {
        state,
        block_size,
        size,
        assoc,
        disk_name,
        cache_name,
        disk_sectors,
        cache_sectors,
        cache_version,
    })
}

/// On-disk descriptor size without checksums (spec.md §6).
pub const DESCRIPTOR_SIZE_PLAIN: usize = 16;
/// On-disk descriptor size with the `checksum` feature's extra `u64`.
pub const DESCRIPTOR_SIZE_CHECKSUM: usize = 24;

pub const fn descriptor_size(with_checksum: bool) -> usize {
    if with_checksum {
        DESCRIPTOR_SIZE_CHECKSUM
    } else {
        DESCRIPTOR_SIZE_PLAIN
    }
}

/// `MD_BLOCKS_PER_SECTOR`: how many descriptors pack into one 512 B sector
/// (spec.md §4.B, §6).
pub const fn md_blocks_per_sector(with_checksum: bool) -> usize {
    SECTOR_SIZE / descriptor_size(with_checksum)
}

/// A decoded slot descriptor. State is masked to `{INVALID, VALID, DIRTY}`;
/// all other flags are transient and never round-trip through the codec
/// (spec.md §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub dbn: Dbn,
    pub checksum: Option<u64>,
    pub state: SlotState,
}

/// Encodes one descriptor. `buf` must be exactly `descriptor_size(checksum.is_some())`.
pub fn encode_slot_descriptor(desc: &SlotDescriptor, buf: &mut [u8]) {
    let with_checksum = desc.checksum.is_some();
    debug_assert_eq!(buf.len(), descriptor_size(with_checksum));

    buf[0..8].copy_from_slice(&desc.dbn.to_le_bytes());
    let mut off = 8;
    if let Some(cksum) = desc.checksum {
        buf[off..off + 8].copy_from_slice(&cksum.to_le_bytes());
        off += 8;
    }
    let state_code: u32 = match desc.state.to_persisted() {
        s if s == SlotState::INVALID => 0,
        s if s == SlotState::VALID => 1,
        s if s == (SlotState::VALID | SlotState::DIRTY) => 3,
        _ => 0,
    };
    buf[off..off + 4].copy_from_slice(&state_code.to_le_bytes());
}

/// Decodes one descriptor, given whether the on-disk layout carries a
/// checksum field.
pub fn decode_slot_descriptor(buf: &[u8], with_checksum: bool) -> CacheResult<SlotDescriptor> {
    if buf.len() != descriptor_size(with_checksum) {
        return Err(CacheError::MalformedMetadata);
    }
    let dbn = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let mut off = 8;
    let checksum = if with_checksum {
        let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        Some(v)
    } else {
        None
    };
    let state_code = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    let state = match state_code {
        0 => SlotState::INVALID,
        1 => SlotState::VALID,
        3 => SlotState::VALID | SlotState::DIRTY,
        _ => return Err(CacheError::MalformedMetadata),
    };
    Ok(SlotDescriptor { dbn, checksum, state })
}

/// Integrity digest over one block's payload, stored in a slot's descriptor
/// when the `checksum` feature is on and verified against the payload on
/// every cache-device read (spec.md §4.B, §9 "checksums are optional").
/// Without the feature, callers still compile (descriptor layout is
/// unaffected by whether a real digest backs it) but get a constant digest,
/// so a checksum mismatch is never detected.
#[cfg(feature = "checksum")]
pub fn compute_checksum(payload: &[u8]) -> u64 {
    seahash::hash(payload)
}

#[cfg(not(feature = "checksum"))]
pub fn compute_checksum(_payload: &[u8]) -> u64 {
    0
}

/// Sectors occupied by the descriptor region plus the superblock:
/// `ceil(size / MD_BLOCKS_PER_SECTOR) + 1` for the descriptors, plus the
/// superblock sector itself (spec.md §4.F: "`md_sectors = ceil(size /
/// MD_BLOCKS_PER_SECTOR) + 2`" counts both).
pub fn md_sectors(size: u64, with_checksum: bool) -> u64 {
    let per_sector = md_blocks_per_sector(with_checksum) as u64;
    let descriptor_sectors = size.div_ceil(per_sector);
    descriptor_sectors + 2
}
