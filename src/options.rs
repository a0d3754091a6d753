//! Session configuration for the shared cache.
//!
//! Every option maps onto one knob of the protocol:
//!
//! | Option | Effect |
//! |--------|--------|
//! | `cache_dir`        | directory holding the `.cache`/`.spacemap` pairs (required) |
//! | `block_shift`      | requested `log2(block size)`, 9..=30; an existing space map wins |
//! | `read_only`        | never write to the content file; non-cached reads bypass the cache |
//! | `cache_timeout_us` | wait budget (µs) on a `PENDING` block before racing the fetch |
//! | `retry_errors`     | treat `FAILED` blocks as re-drivable instead of terminal |

use std::path::PathBuf;
use thiserror::Error;

/// Smallest permitted block shift (512 B blocks).
pub const MIN_BLOCK_SHIFT: u16 = 9;
/// Largest permitted block shift (1 GiB blocks).
pub const MAX_BLOCK_SHIFT: u16 = 30;
/// Default block shift: 32 KiB blocks.
pub const DEFAULT_BLOCK_SHIFT: u16 = 15;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Missing cache directory for shared cache")]
    MissingCacheDir,
    #[error("Invalid block shift {0} (allowed: {MIN_BLOCK_SHIFT}..={MAX_BLOCK_SHIFT})")]
    InvalidBlockShift(u16),
}

/// Configuration for [`SharedReader::open`](crate::reader::SharedReader::open).
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Directory containing the cache file pairs.  Must exist and be
    /// writable; it is never created implicitly.
    pub cache_dir:        PathBuf,
    /// Requested `log2(block size)`.  A space map initialized by an earlier
    /// session keeps its established shift; the request is then ignored
    /// with a warning.
    pub block_shift:      u16,
    /// Read from the cache but never write to it.  Blocks that are not
    /// already `CACHED` are fetched byte-accurate from the inner transport
    /// without touching any block state.
    pub read_only:        bool,
    /// Time in microseconds to wait on a block another participant is
    /// fetching before racing the fetch ourselves.  `0` disables waiting.
    pub cache_timeout_us: u64,
    /// Re-request blocks whose last fetch attempt failed.
    pub retry_errors:     bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_dir:        PathBuf::new(),
            block_shift:      DEFAULT_BLOCK_SHIFT,
            read_only:        false,
            cache_timeout_us: 0,
            retry_errors:     true,
        }
    }
}

impl CacheOptions {
    /// Convenience constructor for the common case.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self { cache_dir: cache_dir.into(), ..Self::default() }
    }

    /// Check the options for internal consistency.  Called by `open`.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(OptionsError::MissingCacheDir);
        }
        if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&self.block_shift) {
            return Err(OptionsError::InvalidBlockShift(self.block_shift));
        }
        Ok(())
    }

    /// Block size in bytes implied by the requested shift.
    #[inline]
    pub fn block_size(&self) -> usize {
        1usize << self.block_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_dir_is_set() {
        assert!(matches!(
            CacheOptions::default().validate(),
            Err(OptionsError::MissingCacheDir)
        ));
        assert!(CacheOptions::new("/tmp/cache").validate().is_ok());
    }

    #[test]
    fn shift_bounds_are_enforced() {
        let mut opts = CacheOptions::new("/tmp/cache");
        opts.block_shift = 8;
        assert!(matches!(opts.validate(), Err(OptionsError::InvalidBlockShift(8))));
        opts.block_shift = 31;
        assert!(opts.validate().is_err());
        opts.block_shift = 9;
        assert!(opts.validate().is_ok());
        assert_eq!(opts.block_size(), 512);
        opts.block_shift = 30;
        assert!(opts.validate().is_ok());
    }
}
