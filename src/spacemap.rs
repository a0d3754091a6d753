//! Space map — the shared coordination file.
//!
//! # On-disk layout (128-byte header, native-endian atomics)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        bytes FF 'S' 'h' '$' read at native width
//!    4      2   version      = 1
//!    6      2   block_shift  log2(block size), 9..=30
//!    8      8   file_size    byte offset of true EOF, 0 = unknown
//!   16     32   uri_hash     SHA-512/256 of the URI, zero bytes eliminated
//!   48     80   reserved     zero
//!  128      N   block_states one byte per block
//! ```
//!
//! Fields are native-endian because they are never interpreted as a byte
//! stream: every participant on the host maps the file `MAP_SHARED` and
//! accesses each field as an atomic of its natural width.  The magic is
//! defined as a byte sequence, so the stored bytes are identical on every
//! host, and its leading `0xFF` keeps the header from parsing as text.
//!
//! # Set-once header
//!
//! Every header field is written at most once, by whichever participant
//! gets there first (see [`crate::set_once`]).  `NONE = 0` is the block
//! state of freshly grown file space, so a zero-filled region is already
//! correct — growth needs no initialization pass.
//!
//! # Growth
//!
//! The file only ever grows, serialized by a whole-file write lock.  The
//! lock covers resizing only; block-state traffic is plain atomics on the
//! shared mapping and never takes any lock.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use memmap2::MmapRaw;
use thiserror::Error;
use tracing::{debug, warn};

use crate::hash::HASH_SIZE;
use crate::lock::FileLock;
use crate::options::{MAX_BLOCK_SHIFT, MIN_BLOCK_SHIFT};
use crate::set_once::{set_once_u16, set_once_u32, set_once_u64, set_once_u8, SetOnce};

// ── Header constants ─────────────────────────────────────────────────────────

/// Header magic, `FF 'S' 'h' '$'` as stored bytes.
pub const HEADER_MAGIC: u32 = u32::from_ne_bytes([0xFF, b'S', b'h', b'$']);

/// Current space-map layout version.
pub const HEADER_VERSION: u16 = 1;

/// Fixed byte size of the header; block states start here.
pub const HEADER_SIZE: usize = 128;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_BLOCK_SHIFT: usize = 6;
const OFF_FILE_SIZE: usize = 8;
const OFF_HASH: usize = 16;

// ── Block state ──────────────────────────────────────────────────────────────

/// Per-block cache state, one atomic byte each.
///
/// `None = 0` so zero-filled growth reads as "not attempted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Not attempted.
    None    = 0,
    /// Bytes are in the content file at this block's offset.
    Cached  = 1,
    /// Some participant is currently fetching this block.
    Pending = 2,
    /// The last fetch of this block failed with an I/O error.
    Failed  = 3,
}

impl BlockState {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(BlockState::None),
            1 => Some(BlockState::Cached),
            2 => Some(BlockState::Pending),
            3 => Some(BlockState::Failed),
            _ => None,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SpacemapError {
    #[error("Space map magic mismatch: expected {HEADER_MAGIC:#010X}, got {0:#010X}")]
    MagicMismatch(u32),
    #[error("Unsupported space map version {0} (this build handles v{HEADER_VERSION})")]
    VersionMismatch(u16),
    #[error("Invalid block shift {0} in existing space map")]
    InvalidShift(u16),
    #[error("Space map URI hash mismatch: expected {expected}, got {found}")]
    HashMismatch { expected: String, found: String },
    #[error("Cached file size mismatch: expected {expected}, got {found}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("Space map size overflow for block {0}")]
    Overflow(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── SpaceMap ─────────────────────────────────────────────────────────────────

/// A shared mapping of one space-map file.
///
/// Every session holds its own `SpaceMap` over the same file; the mapping is
/// `MAP_SHARED`, so block-state transitions made by any process are visible
/// to all of them.
pub struct SpaceMap {
    file:    File,
    map:     MmapRaw,
    map_len: usize,
    shift:   u16,
}

impl SpaceMap {
    /// Map the file, growing it to hold at least the header.
    ///
    /// The returned map is not yet a verified cache identity — call
    /// [`SpaceMap::init`] before trusting any field.
    pub fn open(file: File) -> Result<Self, SpacemapError> {
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            let _lock = FileLock::exclusive(&file)?;
            if file.metadata()?.len() < HEADER_SIZE as u64 {
                file.set_len(HEADER_SIZE as u64)?;
            }
        }
        let map = MmapRaw::map_raw(&file)?;
        let map_len = map.len();
        Ok(Self { file, map, map_len, shift: 0 })
    }

    /// Establish (or verify) the header.
    ///
    /// Exactly one participant wins each field; every other participant
    /// verifies against the established value.  A `block_shift` the file
    /// already carries wins over the requested one.  Returns `true` if this
    /// call initialized the file.
    pub fn init(&mut self, hash: &[u8; HASH_SIZE], requested_shift: u16) -> Result<bool, SpacemapError> {
        let created = match set_once_u32(self.atomic_u32(OFF_MAGIC), HEADER_MAGIC) {
            SetOnce::Set => true,
            SetOnce::AlreadyEqual => false,
            SetOnce::Conflict(found) => return Err(SpacemapError::MagicMismatch(found)),
        };
        if let SetOnce::Conflict(found) = set_once_u16(self.atomic_u16(OFF_VERSION), HEADER_VERSION) {
            return Err(SpacemapError::VersionMismatch(found));
        }

        self.shift = match set_once_u16(self.atomic_u16(OFF_BLOCK_SHIFT), requested_shift) {
            SetOnce::Set | SetOnce::AlreadyEqual => requested_shift,
            SetOnce::Conflict(existing) => {
                warn!(existing, requested = requested_shift,
                      "space map uses a different block shift; keeping the existing one");
                if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&existing) {
                    return Err(SpacemapError::InvalidShift(existing));
                }
                existing
            }
        };

        for (i, &byte) in hash.iter().enumerate() {
            if let SetOnce::Conflict(_) = set_once_u8(self.atomic_u8(OFF_HASH + i), byte) {
                return Err(SpacemapError::HashMismatch {
                    expected: hex::encode_upper(hash),
                    found:    hex::encode_upper(self.stored_hash()),
                });
            }
        }

        if created {
            debug!(shift = self.shift, "initialized new cache space map");
        }
        Ok(created)
    }

    // ── Header accessors ─────────────────────────────────────────────────────

    /// Established `log2(block size)`.  Valid after [`SpaceMap::init`].
    #[inline]
    pub fn shift(&self) -> u16 {
        self.shift
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        1usize << self.shift
    }

    /// True EOF of the resource, or 0 while unknown.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.atomic_u64(OFF_FILE_SIZE).load(Ordering::Relaxed)
    }

    /// Publish the discovered resource size.  Returns `true` if this call
    /// established it; a different already-established size is a hard error
    /// (the resource changed identity behind the cache).
    pub fn set_file_size(&self, size: u64) -> Result<bool, SpacemapError> {
        if size == 0 {
            return Ok(false);
        }
        match set_once_u64(self.atomic_u64(OFF_FILE_SIZE), size) {
            SetOnce::Set => Ok(true),
            SetOnce::AlreadyEqual => Ok(false),
            SetOnce::Conflict(found) => Err(SpacemapError::SizeMismatch { expected: size, found }),
        }
    }

    /// The full URI hash stored in the header.
    pub fn stored_hash(&self) -> [u8; HASH_SIZE] {
        let mut out = [0u8; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.atomic_u8(OFF_HASH + i).load(Ordering::Relaxed);
        }
        out
    }

    // ── Growth ───────────────────────────────────────────────────────────────

    /// Ensure the mapping covers the state byte of `block`.
    ///
    /// While the resource size is unknown the target is rounded up to a
    /// block-size multiple, so a sequential streaming workload resizes
    /// O(size/B²) times instead of once per block.
    pub fn grow(&mut self, block: u64) -> Result<(), SpacemapError> {
        let num_blocks = block.checked_add(1).ok_or(SpacemapError::Overflow(block))?;
        let mut map_bytes = (HEADER_SIZE as u64)
            .checked_add(num_blocks)
            .ok_or(SpacemapError::Overflow(block))?;

        if self.file_size() == 0 {
            let bs = self.block_size() as u64;
            map_bytes = map_bytes
                .checked_add(bs - 1)
                .ok_or(SpacemapError::Overflow(block))?
                / bs
                * bs;
        }

        if self.remap(map_bytes)? {
            let capacity = (self.map_len - HEADER_SIZE) as u64;
            debug!(bytes = self.map_len, capacity_blocks = capacity,
                   capacity_mb = (capacity * self.block_size() as u64) >> 20,
                   "resized space map");
        }
        Ok(())
    }

    /// Grow the file to at least `target` bytes and refresh the mapping.
    ///
    /// Resizers are serialized by a whole-file write lock; the size is
    /// re-checked under the lock because another process may have grown the
    /// file while we waited.  Returns `true` if this call grew the file.
    fn remap(&mut self, target: u64) -> Result<bool, SpacemapError> {
        if target <= self.map_len as u64 {
            return Ok(false);
        }

        // Opportunistic check: the target may already be satisfied by
        // another process's resize, in which case remapping suffices.
        let mut did_grow = false;
        if self.file.metadata()?.len() < target {
            let _lock = FileLock::exclusive(&self.file)?;
            if self.file.metadata()?.len() < target {
                self.file.set_len(target)?;
                did_grow = true;
            }
            self.map = MmapRaw::map_raw(&self.file)?;
        } else {
            self.map = MmapRaw::map_raw(&self.file)?;
        }
        self.map_len = self.map.len();
        Ok(did_grow)
    }

    /// Number of block-state bytes the current mapping covers.
    #[inline]
    pub fn capacity_blocks(&self) -> u64 {
        (self.map_len - HEADER_SIZE) as u64
    }

    // ── Block state ──────────────────────────────────────────────────────────

    /// Load the state byte of `block` with acquire ordering, pairing with
    /// the release store in [`SpaceMap::publish`] so a `Cached` observation
    /// also observes the block's bytes in the content file.
    #[inline]
    pub fn state(&self, block: u64) -> u8 {
        self.block_atomic(block).load(Ordering::Acquire)
    }

    /// Claim the fetch of `block`: CAS `expected` → `Pending`.
    /// On failure returns the state that was found instead.
    #[inline]
    pub fn claim(&self, block: u64, expected: u8) -> Result<(), u8> {
        self.block_atomic(block)
            .compare_exchange(expected, BlockState::Pending as u8,
                              Ordering::Acquire, Ordering::Acquire)
            .map(|_| ())
    }

    /// Publish `block` as `Cached`.  Release store; must happen after the
    /// last byte of the block reached the content file.
    #[inline]
    pub fn publish(&self, block: u64) {
        self.block_atomic(block)
            .store(BlockState::Cached as u8, Ordering::Release);
    }

    /// Resolve a claimed `Pending` block to `to` (`Failed` after a fetch
    /// error, back to `None` after a seek or write-back error).  A mismatch
    /// means another participant already resolved the block; that outcome
    /// is kept.
    #[inline]
    pub fn demote(&self, block: u64, to: BlockState) {
        let _ = self.block_atomic(block).compare_exchange(
            BlockState::Pending as u8, to as u8,
            Ordering::Relaxed, Ordering::Relaxed,
        );
    }

    // ── Atomic views ─────────────────────────────────────────────────────────

    #[inline]
    fn block_atomic(&self, block: u64) -> &AtomicU8 {
        let off = HEADER_SIZE as u64 + block;
        assert!(off < self.map_len as u64, "block {block} outside space map");
        // SAFETY: bounds asserted above; bytes have no alignment demands;
        // the mapping outlives &self.
        unsafe { AtomicU8::from_ptr(self.map.as_mut_ptr().add(off as usize)) }
    }

    #[inline]
    fn atomic_u8(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < HEADER_SIZE);
        // SAFETY: header offsets are within the mapping (open() guarantees
        // HEADER_SIZE bytes) and the mapping outlives &self.
        unsafe { AtomicU8::from_ptr(self.map.as_mut_ptr().add(off)) }
    }

    #[inline]
    fn atomic_u16(&self, off: usize) -> &AtomicU16 {
        debug_assert!(off + 2 <= HEADER_SIZE && off % 2 == 0);
        // SAFETY: in-bounds and naturally aligned (the mapping is
        // page-aligned and the offset is a multiple of 2).
        unsafe { AtomicU16::from_ptr(self.map.as_mut_ptr().add(off).cast()) }
    }

    #[inline]
    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off + 4 <= HEADER_SIZE && off % 4 == 0);
        // SAFETY: in-bounds and naturally aligned.
        unsafe { AtomicU32::from_ptr(self.map.as_mut_ptr().add(off).cast()) }
    }

    #[inline]
    fn atomic_u64(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off + 8 <= HEADER_SIZE && off % 8 == 0);
        // SAFETY: in-bounds and naturally aligned.
        unsafe { AtomicU64::from_ptr(self.map.as_mut_ptr().add(off).cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_uri;
    use std::fs::OpenOptions;
    use std::path::Path;

    fn open_map(path: &Path) -> SpaceMap {
        let file = OpenOptions::new()
            .read(true).write(true).create(true).truncate(false)
            .open(path)
            .unwrap();
        SpaceMap::open(file).unwrap()
    }

    #[test]
    fn init_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.spacemap");
        let hash = hash_uri("file:///a");

        let mut sm = open_map(&path);
        assert!(sm.init(&hash, 12).unwrap());
        assert_eq!(sm.shift(), 12);
        assert_eq!(sm.block_size(), 4096);
        assert_eq!(sm.file_size(), 0);
        drop(sm);

        let mut sm = open_map(&path);
        assert!(!sm.init(&hash, 12).unwrap());
        assert_eq!(sm.stored_hash(), hash);
    }

    #[test]
    fn existing_shift_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.spacemap");
        let hash = hash_uri("file:///a");

        let mut sm = open_map(&path);
        sm.init(&hash, 10).unwrap();
        drop(sm);

        let mut sm = open_map(&path);
        sm.init(&hash, 20).unwrap();
        assert_eq!(sm.shift(), 10);
    }

    #[test]
    fn hash_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.spacemap");

        let mut sm = open_map(&path);
        sm.init(&hash_uri("file:///a"), 12).unwrap();
        drop(sm);

        let mut sm = open_map(&path);
        let err = sm.init(&hash_uri("file:///b"), 12).unwrap_err();
        assert!(matches!(err, SpacemapError::HashMismatch { .. }));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.spacemap");
        std::fs::write(&path, vec![0x42u8; 256]).unwrap();

        let mut sm = open_map(&path);
        let err = sm.init(&hash_uri("file:///a"), 12).unwrap_err();
        assert!(matches!(err, SpacemapError::MagicMismatch(_)));
    }

    #[test]
    fn file_size_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_map(&dir.path().join("a.spacemap"));
        sm.init(&hash_uri("u"), 12).unwrap();

        assert!(sm.set_file_size(10_000).unwrap());
        assert!(!sm.set_file_size(10_000).unwrap());
        assert!(matches!(
            sm.set_file_size(20_000),
            Err(SpacemapError::SizeMismatch { expected: 20_000, found: 10_000 })
        ));
        assert_eq!(sm.file_size(), 10_000);
    }

    #[test]
    fn grow_rounds_up_while_size_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_map(&dir.path().join("a.spacemap"));
        sm.init(&hash_uri("u"), 9).unwrap();

        sm.grow(0).unwrap();
        // 128 + 1 rounded to a 512 multiple
        assert_eq!(sm.capacity_blocks(), 512 - HEADER_SIZE as u64);

        // Known size switches to exact growth.
        sm.set_file_size(1 << 20).unwrap();
        sm.grow(1000).unwrap();
        assert!(sm.capacity_blocks() >= 1001);
    }

    #[test]
    fn grow_across_block_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_map(&dir.path().join("a.spacemap"));
        sm.init(&hash_uri("u"), 9).unwrap();

        sm.grow(512 - HEADER_SIZE as u64).unwrap();
        assert_eq!(sm.capacity_blocks(), 2 * 512 - HEADER_SIZE as u64);
    }

    #[test]
    fn block_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_map(&dir.path().join("a.spacemap"));
        sm.init(&hash_uri("u"), 12).unwrap();
        sm.grow(3).unwrap();

        assert_eq!(sm.state(3), BlockState::None as u8);
        sm.claim(3, BlockState::None as u8).unwrap();
        assert_eq!(sm.state(3), BlockState::Pending as u8);

        // A second claim loses and reports the current state.
        assert_eq!(sm.claim(3, BlockState::None as u8), Err(BlockState::Pending as u8));

        sm.publish(3);
        assert_eq!(sm.state(3), BlockState::Cached as u8);

        // Demotion of a resolved block is a no-op.
        sm.demote(3, BlockState::None);
        assert_eq!(sm.state(3), BlockState::Cached as u8);
    }

    #[test]
    fn states_are_shared_between_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.spacemap");
        let hash = hash_uri("u");

        let mut a = open_map(&path);
        a.init(&hash, 12).unwrap();
        a.grow(0).unwrap();

        let mut b = open_map(&path);
        b.init(&hash, 12).unwrap();
        b.grow(0).unwrap();

        a.claim(0, BlockState::None as u8).unwrap();
        assert_eq!(b.state(0), BlockState::Pending as u8);
        b.publish(0);
        assert_eq!(a.state(0), BlockState::Cached as u8);
    }
}
